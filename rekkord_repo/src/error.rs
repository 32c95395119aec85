//! Typed errors surfaced by the repository engine.

use rekkord_core::envelope::EnvelopeError;
use rekkord_core::format::FormatError;
use rekkord_core::keys::KeyError;
use rekkord_core::sealed::SealError;
use rekkord_core::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("object not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("corrupt data: {0}")]
    Corruption(String),
    #[error("truncated data: {0}")]
    Truncation(String),
    #[error("local cache was out of sync with the repository")]
    CacheInconsistent,
    #[error("{0}")]
    InvalidInput(String),
    #[error("store failure: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Error::NotFound,
            StoreError::AccessDenied => Error::AccessDenied,
            other => Error::Store(other),
        }
    }
}

impl From<EnvelopeError> for Error {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Truncated => Error::Truncation(err.to_string()),
            EnvelopeError::UnknownVersion(_)
            | EnvelopeError::Format(_)
            | EnvelopeError::Unseal(_)
            | EnvelopeError::Decrypt => Error::Corruption(err.to_string()),
            EnvelopeError::Seal(_) | EnvelopeError::Encrypt | EnvelopeError::Compression(_) => {
                Error::Other(err.into())
            }
        }
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::NameTooLong => Error::InvalidInput(err.to_string()),
            other => Error::Corruption(other.to_string()),
        }
    }
}

impl From<SealError> for Error {
    fn from(err: SealError) -> Self {
        match err {
            SealError::Open | SealError::Malformed => Error::Corruption(err.to_string()),
            SealError::Seal => Error::Other(err.into()),
        }
    }
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::WrongPassword => Error::AccessDenied,
            KeyError::MalformedRecord
            | KeyError::MalformedSecret
            | KeyError::UnknownSecretVersion(_)
            | KeyError::Decrypt => Error::Corruption(err.to_string()),
            KeyError::Derive | KeyError::Encrypt => Error::Other(err.into()),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Other(err.into())
    }
}
