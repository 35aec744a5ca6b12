//! Error types.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// An error raised by a producer, loader or cursor.
///
/// Producer failures are side-channel events: they are delivered to
/// [`ErrorObserver`](crate::ErrorObserver)s and never tear down the data.
/// They are reference counted so every registered observer sees the same instance.
pub type SourceError = Arc<dyn StdError + Send + Sync + 'static>;

/// Result type alias for fallible data operations.
pub type Result<T, E = DataError> = std::result::Result<T, E>;

/// Errors reported by data operations.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// A read or write addressed a position outside `[0, size)`.
    #[error("position {position} is out of range for data of size {size}")]
    OutOfRange {
        /// Requested position.
        position: usize,
        /// Size of the data at the time of the call.
        size: usize,
    },

    /// A range operation extended past the end of the data.
    #[error("range {start}..{start}+{count} is out of range for data of size {size}")]
    InvalidRange {
        /// First position of the range.
        start: usize,
        /// Number of elements in the range.
        count: usize,
        /// Size of the data at the time of the call.
        size: usize,
    },

    /// A block move addressed elements outside the data.
    #[error("cannot move {count} elements from {from} to {to} in data of size {size}")]
    InvalidMove {
        /// Source position of the block.
        from: usize,
        /// Destination position in the post-removal index space.
        to: usize,
        /// Length of the block.
        count: usize,
        /// Size of the data at the time of the call.
        size: usize,
    },

    /// The cursor backing the data has been released.
    #[error("cursor has been closed")]
    CursorClosed,

    /// A producer or loader failed.
    #[error(transparent)]
    Source(SourceError),
}

/// Convert anything error-like into a [`SourceError`].
///
/// Accepts concrete error types as well as `&str` and `String`.
pub fn source_error<E>(error: E) -> SourceError
where
    E: Into<Box<dyn StdError + Send + Sync + 'static>>,
{
    Arc::from(error.into())
}

impl From<SourceError> for DataError {
    fn from(error: SourceError) -> Self {
        DataError::Source(error)
    }
}
