//! Error types for the compiler broker.

use thiserror::Error;

/// Failure categories for talking to an external compiler.
///
/// `Transport` means the pipe to the worker is gone and the worker has been
/// (or is about to be) torn down; the pool retries these on a fresh process.
/// `Compile` means the worker is healthy but rejected the source; these are
/// returned to the caller verbatim and never retried. `BadCompiler` means the
/// worker binary could not be launched or failed its handshake; these abort
/// startup.
#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("bad compiler: {0}")]
    BadCompiler(String),
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, CompilerError>;
