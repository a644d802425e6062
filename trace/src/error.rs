use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the dump/import plumbing. Never surfaced on the hot path.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write dump {path}: {source}")]
    DumpIo { path: PathBuf, source: io::Error },

    #[error("failed to read dump {path}: {source}")]
    ImportIo { path: PathBuf, source: io::Error },

    #[error("failed to parse dump {path}: {source}")]
    ImportParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Failures of the interception layer at initialization time.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("failed to resolve underlying `{symbol}` via the dynamic linker")]
    SymbolResolution { symbol: &'static str },
}
