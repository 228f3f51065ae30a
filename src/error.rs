//! Error taxonomy.
//!
//! Library operations return [`Error`]; the binary wraps these in `anyhow`
//! with path context at the orchestration layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An alignment value that is zero or not a power of two. Mask-based
    /// rounding is only valid for non-zero powers of two, so this is
    /// rejected before any field is rewritten.
    #[error("invalid alignment 0x{0:x} (must be a non-zero power of two)")]
    InvalidAlignment(u64),

    /// The image has no sections to lay out.
    #[error("image has an empty section table")]
    EmptySections,

    /// The image structure is damaged in a way this crate detects itself
    /// (as opposed to parse errors surfaced from the `object` crate).
    #[error("malformed image: {0}")]
    Malformed(String),

    /// A recomputed layout value no longer fits the 32-bit header field
    /// it must be written back into.
    #[error("{field} 0x{value:x} does not fit in a 32-bit header field")]
    FieldOverflow {
        /// Name of the header field being written.
        field: &'static str,
        /// The value that overflowed.
        value: u64,
    },

    /// A realigned image failed the post-write invariant check.
    #[error("verification failed: {0}")]
    Verify(String),

    #[error(transparent)]
    Object(#[from] object::read::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
