//! Error hierarchy and the stable result codes exposed at the API boundary.
//!
//! Every [`OptimizerError`] variant folds into exactly one [`ErrorCode`];
//! callers that only care about the flat code use [`OptimizerError::code`].

use std::fmt;
use std::path::PathBuf;
use std::sync::PoisonError;

use crate::backend::ModelType;

/// Stable integer result codes. `Success` is zero, every failure is negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    InvalidParam = -1,
    FileIo = -2,
    Memory = -3,
    UnsupportedFormat = -4,
    Gpu = -5,
    Thread = -6,
    System = -7,
    Initialization = -8,
    NotImplemented = -9,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::Success,
        ErrorCode::InvalidParam,
        ErrorCode::FileIo,
        ErrorCode::Memory,
        ErrorCode::UnsupportedFormat,
        ErrorCode::Gpu,
        ErrorCode::Thread,
        ErrorCode::System,
        ErrorCode::Initialization,
        ErrorCode::NotImplemented,
    ];

    #[inline]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_raw() == raw)
    }

    pub const fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::InvalidParam => "Invalid parameter",
            ErrorCode::FileIo => "File I/O error",
            ErrorCode::Memory => "Memory allocation error",
            ErrorCode::UnsupportedFormat => "Unsupported format",
            ErrorCode::Gpu => "GPU error",
            ErrorCode::Thread => "Thread error",
            ErrorCode::System => "System error",
            ErrorCode::Initialization => "Initialization error",
            ErrorCode::NotImplemented => "Not implemented",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Static message for a raw result code; `"Unknown error"` outside the table.
pub fn error_string(raw: i32) -> &'static str {
    ErrorCode::from_raw(raw)
        .map(ErrorCode::message)
        .unwrap_or("Unknown error")
}

#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    // ── Preconditions ──
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Optimizer is not initialized")]
    NotInitialized,

    #[error("No {0} model is loaded")]
    ModelNotLoaded(ModelType),

    #[error("Transfer of {requested} bytes exceeds buffer capacity of {capacity} bytes")]
    TransferOutOfBounds { requested: usize, capacity: usize },

    // ── File I/O ──
    #[error("File I/O error on {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Short read on {}: expected {expected} bytes, got {actual}", path.display())]
    ShortRead {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    // ── Memory ──
    #[error("Allocation of {bytes} bytes failed: {reason}")]
    Memory { bytes: usize, reason: String },

    #[error(
        "Device memory limit exceeded: limit={limit_bytes}B current={current_bytes}B requested={requested_bytes}B would_be={would_be_bytes}B"
    )]
    MemoryLimitExceeded {
        limit_bytes: usize,
        current_bytes: usize,
        requested_bytes: usize,
        would_be_bytes: usize,
    },

    // ── Formats ──
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    // ── Device and inference ──
    #[error("Device error: {0}")]
    Device(String),

    #[error("Kernel `{kernel}` failed: {message}")]
    Kernel {
        kernel: &'static str,
        message: String,
    },

    #[error("Kernel `{kernel}` rejected output geometry {width}x{height}")]
    InvalidGeometry {
        kernel: &'static str,
        width: u32,
        height: u32,
    },

    #[error("Inference error: {0}")]
    Inference(String),

    // ── Synchronization ──
    #[error("Synchronization failure: {0}")]
    Thread(String),

    // ── Reserved ──
    #[error("System error: {0}")]
    System(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl OptimizerError {
    /// Flat result code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            OptimizerError::InvalidParam(_)
            | OptimizerError::NotInitialized
            | OptimizerError::ModelNotLoaded(_)
            | OptimizerError::TransferOutOfBounds { .. } => ErrorCode::InvalidParam,
            OptimizerError::FileIo { .. } | OptimizerError::ShortRead { .. } => ErrorCode::FileIo,
            OptimizerError::Memory { .. } | OptimizerError::MemoryLimitExceeded { .. } => {
                ErrorCode::Memory
            }
            OptimizerError::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            OptimizerError::Device(_)
            | OptimizerError::Kernel { .. }
            | OptimizerError::InvalidGeometry { .. }
            | OptimizerError::Inference(_) => ErrorCode::Gpu,
            OptimizerError::Thread(_) => ErrorCode::Thread,
            OptimizerError::System(_) => ErrorCode::System,
            OptimizerError::Initialization(_) => ErrorCode::Initialization,
            OptimizerError::NotImplemented(_) => ErrorCode::NotImplemented,
        }
    }

    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OptimizerError::FileIo {
            path: path.into(),
            source,
        }
    }

    pub fn kernel(kernel: &'static str, message: impl fmt::Display) -> Self {
        OptimizerError::Kernel {
            kernel,
            message: message.to_string(),
        }
    }
}

impl<T> From<PoisonError<T>> for OptimizerError {
    fn from(err: PoisonError<T>) -> Self {
        OptimizerError::Thread(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OptimizerError>;
