//! Error types for the codec.

/// Errors produced while encoding, decoding, or verifying envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The buffer ended before the announced field length.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A varint ran past 10 bytes or overflowed 64 bits.
    #[error("varint overflow")]
    VarintOverflow,

    /// A field payload had the wrong size for its type.
    #[error("bad length for field {field}: {len}")]
    BadFieldLength {
        /// Name of the offending field.
        field: &'static str,
        /// Observed payload length.
        len: usize,
    },

    /// A required field was absent from the envelope.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// An enum discriminant outside the known range.
    #[error("invalid {what} code: {code}")]
    InvalidCode {
        /// Which enum was being decoded.
        what: &'static str,
        /// The unknown code.
        code: u8,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in field {0}")]
    InvalidUtf8(&'static str),

    /// The entry's signature does not verify, or the signing node is not
    /// in the cluster roster.
    #[error("log entry signature invalid")]
    SignatureInvalid,
}
