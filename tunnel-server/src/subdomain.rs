//! Random subdomain label generation: a fixed-length label drawn from an
//! unambiguous alphabet, retried on collision with the active set before
//! failing the handshake with `subdomain_exhausted`.

use crate::deps::Rng;

/// Generates one candidate label of `length` characters drawn from
/// `alphabet`. Does not itself retry or check for collisions — callers
/// drive the retry loop against the registry (see `Registry::register`
/// call sites in `control.rs`), since only the registry can answer
/// "is this subdomain free".
pub fn generate_label(rng: &dyn Rng, alphabet: &[char], length: usize) -> String {
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0, alphabet.len() as u32) as usize;
            alphabet[idx]
        })
        .collect()
}
