#![doc = include_str!("../README.md")]

pub mod backend;
pub mod callbacks;
pub mod context;
pub mod detection;
pub mod error;
pub mod formats;
pub mod host_copy_audit;
pub mod types;

/// Record a device program that had to stage its inputs through host memory.
///
/// Expands to [`host_copy_audit::record_staging`] and propagates the error
/// returned in strict mode.
#[macro_export]
macro_rules! host_staging {
    ($stage:expr, $($arg:tt)+) => {
        $crate::host_copy_audit::record_staging($stage, format!($($arg)+))?
    };
}
