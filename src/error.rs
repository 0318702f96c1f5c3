// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error handling for nbcoll
//!
//! Two channels exist. [`NbcError`] is the ordinary, recoverable error returned
//! at API boundaries (misuse such as stopping an engine twice, bad arguments).
//! [`FatalError`] describes conditions that indicate a defect or a failed
//! collective; these never reach a caller as a `Result` but are handed to the
//! engine's fatal reporter, which logs them and terminates.

use std::fmt;

/// Error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    OutOfMemory = 1,
    KeyError = 2,
    TypeError = 3,
    Invalid = 4,
    IoError = 5,
    CapacityError = 6,
    IndexError = 7,
    UnknownError = 9,
    NotImplemented = 10,
    ExecutionError = 42,
    AlreadyExists = 45,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::OutOfMemory => write!(f, "Out of memory"),
            Code::KeyError => write!(f, "Key error"),
            Code::TypeError => write!(f, "Type error"),
            Code::Invalid => write!(f, "Invalid"),
            Code::IoError => write!(f, "IO error"),
            Code::CapacityError => write!(f, "Capacity error"),
            Code::IndexError => write!(f, "Index error"),
            Code::UnknownError => write!(f, "Unknown error"),
            Code::NotImplemented => write!(f, "Not implemented"),
            Code::ExecutionError => write!(f, "Execution error"),
            Code::AlreadyExists => write!(f, "Already exists"),
        }
    }
}

/// Main error type for nbcoll operations
#[derive(thiserror::Error, Debug)]
pub enum NbcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Index out of bounds: {0}")]
    IndexError(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Progress engine error: {0}")]
    Engine(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Generic error with code {code}: {message}")]
    Generic { code: Code, message: String },
}

impl NbcError {
    /// Create a new error with a specific code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        NbcError::Generic {
            code,
            message: message.into(),
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            NbcError::Io(_) => Code::IoError,
            NbcError::Invalid(_) => Code::Invalid,
            NbcError::NotImplemented(_) => Code::NotImplemented,
            NbcError::IndexError(_) => Code::IndexError,
            NbcError::TypeError(_) => Code::TypeError,
            NbcError::Config(_) => Code::Invalid,
            NbcError::Engine(_) => Code::ExecutionError,
            NbcError::Communication(_) => Code::IoError,
            NbcError::Device(_) => Code::ExecutionError,
            NbcError::Topology(_) => Code::ExecutionError,
            NbcError::Generic { code, .. } => *code,
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        NbcError::new(Code::UnknownError, format!("{} lock poisoned", what))
    }
}

/// Type alias for Results using NbcError
pub type NbcResult<T> = Result<T, NbcError>;

/// Unrecoverable conditions.
///
/// A collective spans every participant, so none of these can be retried
/// locally; the process is torn down after the condition is reported.
#[derive(thiserror::Error, Debug)]
pub enum FatalError {
    #[error("Using more execution contexts than supported (maximum {max})")]
    TooManyContexts { max: usize },

    #[error("Operation {name} tried to advance past pipeline stage {stage} of {stages}")]
    PipelineOverflow {
        name: String,
        stage: usize,
        stages: usize,
    },

    #[error("Operation {name} failed in its backend: {source}")]
    Backend {
        name: String,
        #[source]
        source: NbcError,
    },

    #[error("Cannot bind progress engine: {0}")]
    Affinity(#[source] NbcError),

    #[error("Progress engine internal error: {0}")]
    Internal(String),
}
