use std::io;

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised while compiling, loading, or invoking a generated library.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Codegen(#[from] gradc::CodegenError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Non-zero exit from the external compiler. Never retried: compiler
    /// errors are deterministic given fixed source.
    #[error("C compiler exited with {status}: {stderr}")]
    Compiler { status: String, stderr: String },

    #[error("failed to load compiled library: {0}")]
    Load(#[from] libloading::Error),

    #[error("dynamic link '{name}' not found under {dir}")]
    DynamicLink { name: String, dir: String },

    #[error("invalid request: {0}")]
    Config(String),

    /// The foreign call produced no storage for a key it was supposed to
    /// populate.
    #[error("foreign call returned null for key '{key}'")]
    NullOutput { key: String },
}

impl BridgeError {
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config(message.into())
    }
}
