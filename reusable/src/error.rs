//! Errors surfaced at the await point of a [`PooledFuture`].
//!
//! [`PooledFuture`]: crate::PooledFuture
use std::fmt;

/// Result type returned by every pooled operation.
pub type Result<T> = std::result::Result<T, Error>;

/// The ways a pooled operation can fail.
///
/// `InvalidReuse` is always a programming error: a handle was awaited twice, registered a
/// continuation twice, or outlived the generation it was created for. It is never retried.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A future (or its awaiter) was driven more than once, or its slot has been recycled.
    #[error("invalid reuse of a pooled future: {0}")]
    InvalidReuse(&'static str),

    /// The operation is not valid in the current state of the object.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The operation was canceled through a [`CancellationToken`](crate::CancellationToken).
    #[error("the operation was canceled")]
    Canceled,

    /// The asynchronous work failed; the original error is carried unchanged.
    #[error(transparent)]
    Faulted(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an arbitrary error produced by asynchronous work.
    pub fn faulted<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Error::Faulted(err.into())
    }

    pub fn is_invalid_reuse(&self) -> bool {
        matches!(self, Error::InvalidReuse(_))
    }

    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Error::InvalidOperation(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidReuse(msg) => f.debug_tuple("InvalidReuse").field(msg).finish(),
            Error::InvalidOperation(msg) => f.debug_tuple("InvalidOperation").field(msg).finish(),
            Error::Canceled => f.write_str("Canceled"),
            Error::Faulted(err) => f.debug_tuple("Faulted").field(err).finish(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Faulted(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_faulted_keeps_source() {
        let err = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow disk"));
        assert_eq!(err.to_string(), "slow disk");
        match err {
            Error::Faulted(inner) => {
                let io_err = inner.downcast::<io::Error>().unwrap();
                assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classification() {
        assert!(Error::Canceled.is_canceled());
        assert!(Error::InvalidReuse("twice").is_invalid_reuse());
        assert!(Error::InvalidOperation("closed").is_invalid_operation());
        assert!(!Error::Canceled.is_invalid_operation());
    }
}
