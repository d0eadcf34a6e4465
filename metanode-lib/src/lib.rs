#![allow(unused, dead_code)]

mod bootstrap;
mod client;
mod edit_log;
mod namespace;
mod storage;
mod throttle;
mod transfer;

pub use bootstrap::*;
pub use client::*;
pub use edit_log::*;
pub use namespace::*;
pub use storage::*;
pub use throttle::*;
pub use transfer::*;

use reqwest::StatusCode;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("failed to connect: {0}")]
    FailedConnect(String),
    #[error("incompatible version: {0}")]
    InvalidVersion(String),
    #[error("already formatted: {0}")]
    AlreadyFormatted(String),
    #[error("edit logs unavailable: {0}")]
    LogsUnavailable(String),
    #[error("insufficient disk space: {0}")]
    InsufficientSpace(String),
    #[error("verify image error: {0}")]
    VerifyError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl MetaError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => MetaError::NotFound(info),
            StatusCode::INTERNAL_SERVER_ERROR => MetaError::Internal(info),
            _ => MetaError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::NotFound(_))
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, MetaError::FailedConnect(_))
    }
}

pub type MetaResult<T> = std::result::Result<T, MetaError>;

impl From<std::io::Error> for MetaError {
    fn from(err: std::io::Error) -> Self {
        MetaError::IoError(err.to_string())
    }
}
