use std::fmt;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("no such entity")]
    NoSuchEntity,
    #[error("invalid entity type")]
    InvalidEntityType,
    #[error("concurrent transaction")]
    ConcurrentTransaction,
    #[error("cannot load field {field:?} into a {type_name:?}: {reason}")]
    FieldMismatch {
        type_name: String,
        field: String,
        reason: String,
    },
    #[error("cannot convert {found} value into {expected}")]
    ValueMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("iterator done")]
    Done,
    #[error("{0}")]
    Multi(MultiError),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid property: {0}")]
    InvalidProperty(String),
    #[error("transaction already finished")]
    TransactionFinished,
    #[error("pending key does not belong to this commit")]
    PendingKeyMismatch,
    #[error("batch dropped before exec")]
    BatchCanceled,
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("Transient backend error: {0}")]
    Transient(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("TiKV error: {0}")]
    TikvError(Arc<tikv_client::Error>),
    #[error("Prost error: {0}")]
    SerializationError(#[from] prost::EncodeError),
    #[error("Prost error: {0}")]
    DeserializationError(#[from] prost::DecodeError),
}

impl From<tikv_client::Error> for Error {
    fn from(err: tikv_client::Error) -> Self {
        Error::TikvError(Arc::new(err))
    }
}

impl From<MultiError> for Error {
    fn from(err: MultiError) -> Self {
        Error::Multi(err)
    }
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Transient(message.into())
    }

    pub fn is_no_such_entity(&self) -> bool {
        matches!(self, Error::NoSuchEntity)
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Error::Multi(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Error::Done)
    }

    pub fn is_concurrent_transaction(&self) -> bool {
        matches!(self, Error::ConcurrentTransaction)
    }

    pub fn is_field_mismatch(&self) -> bool {
        matches!(self, Error::FieldMismatch { .. })
    }

    /// Cancellation and deadline errors come from the caller's context and
    /// must reach it unchanged.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }

    /// Errors raised by checking the request itself. Re-issuing the same
    /// request fails the same way.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidKey(_)
                | Error::InvalidQuery(_)
                | Error::InvalidArgument(_)
                | Error::InvalidProperty(_)
                | Error::InvalidEntityType
                | Error::TransactionFinished
                | Error::PendingKeyMismatch
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::TikvError(_))
    }

    /// Unwraps the error of a one-key call from its one-slot multi error.
    pub(crate) fn single(self) -> Error {
        match self {
            Error::Multi(m) if m.len() == 1 => match m.into_inner().into_iter().flatten().next() {
                Some(err) => err,
                None => Error::Multi(MultiError::new(1)),
            },
            other => other,
        }
    }
}

/// Slot-parallel errors of a multi operation. `None` marks a slot that
/// succeeded.
#[derive(Debug, Clone, Default)]
pub struct MultiError(pub Vec<Option<Error>>);

impl MultiError {
    pub fn new(len: usize) -> Self {
        MultiError((0..len).map(|_| None).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Error> {
        self.0.get(index).and_then(|e| e.as_ref())
    }

    pub fn set(&mut self, index: usize, err: Error) {
        self.0[index] = Some(err);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Option::is_some)
    }

    /// `Err(Error::Multi)` when at least one slot failed.
    pub fn into_result(self) -> Result<(), Error> {
        if self.has_errors() {
            Err(Error::Multi(self))
        } else {
            Ok(())
        }
    }

    pub fn into_inner(self) -> Vec<Option<Error>> {
        self.0
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors = self.0.iter().flatten();
        let Some(first) = errors.next() else {
            return write!(f, "(0 errors)");
        };
        match errors.count() {
            0 => write!(f, "{}", first),
            1 => write!(f, "{} (and 1 other error)", first),
            n => write!(f, "{} (and {} other errors)", first, n),
        }
    }
}

impl std::error::Error for MultiError {}

/// Splits a slot error out of a pipeline result: whole-call errors are
/// returned as `Err`, per-slot errors as `Ok(MultiError)`.
pub(crate) fn slot_errors(result: Result<(), Error>, len: usize) -> Result<MultiError, Error> {
    match result {
        Ok(()) => Ok(MultiError::new(len)),
        Err(Error::Multi(m)) if m.len() == len => Ok(m),
        Err(Error::Multi(m)) => Err(Error::InvalidArgument(format!(
            "multi error has {} slots, expected {}",
            m.len(),
            len
        ))),
        Err(err) => Err(err),
    }
}
