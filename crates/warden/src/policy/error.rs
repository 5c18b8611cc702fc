use std::path::PathBuf;

use crate::rmi::{ErrorKind, RemoteError};

use super::store::StoreError;
use super::value::{CodecError, ValueType};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("policy {0} has no value yet")]
    Uninitialized(String),

    #[error("admin {0} is not enrolled")]
    NotEnrolled(String),

    #[error("admin {0} is deactivated")]
    Deactivated(String),

    #[error("invalid admin name {0:?}")]
    InvalidAdmin(String),

    #[error("policy {policy} takes {expected} values, got {found}")]
    TypeMismatch {
        policy: String,
        expected: ValueType,
        found: ValueType,
    },

    #[error("policy {0} is already registered")]
    Duplicate(String),

    #[error("policy {policy} rejected value: {reason}")]
    Rejected { policy: String, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownPolicy(_) => ErrorKind::NotFound,
            Self::InvalidAdmin(_) | Self::TypeMismatch { .. } => ErrorKind::InvalidArgument,
            Self::NotEnrolled(_) | Self::Deactivated(_) => ErrorKind::Permission,
            Self::Codec(_) => ErrorKind::Codec,
            Self::Store(_) => ErrorKind::Storage,
            Self::Uninitialized(_) | Self::Duplicate(_) | Self::Rejected { .. } => {
                ErrorKind::Policy
            }
        }
    }
}

impl From<PolicyError> for RemoteError {
    fn from(err: PolicyError) -> Self {
        RemoteError::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("failed to read plugin directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to load plugin {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: libloading::Error,
    },

    #[error("plugin {} has no provider entry point: {source}", path.display())]
    MissingEntryPoint {
        path: PathBuf,
        source: libloading::Error,
    },
}
