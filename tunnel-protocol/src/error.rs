use thiserror::Error;

/// Errors that can occur while encoding or decoding a [`crate::Frame`].
///
/// A decode/encode error on the control channel is always fatal for the
/// session it occurs on — see `protocol_error`. Callers are expected
/// to tear the session down rather than attempt to resynchronise.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload exceeds max_frame_len ({0} > {1})")]
    TooLarge(usize, usize),

    #[error("unknown frame tag {0}")]
    UnknownTag(u8),

    #[error("failed to encode frame payload: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode frame payload: {0}")]
    Decode(#[source] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
