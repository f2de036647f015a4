//! Error types for the writer's public boundary.
//!
//! The append/start/finish/flush surface itself is infallible (see
//! `src/writer.rs`): misuse and transient runtime faults are reported
//! through the `log` crate and swallowed. `WriterError` only covers the
//! handful of operations that can fail in a way the caller must be able
//! to observe.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("could not open log file after exhausting filename retries")]
    FileOpenExhausted,

    #[error("flusher thread panicked")]
    ThreadJoin,
}
