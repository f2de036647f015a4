//! An append-only WPILOG binary telemetry logger: a fixed-width record
//! codec, a recycled buffer pool, a reference-counted entry registry, and
//! a background flusher thread writing to either a file or a
//! user-supplied callback.
//!
//! The public surface is [`DataLog`]: open one with
//! [`DataLog::open_file`] or [`DataLog::open_callback`], register
//! entries with [`DataLog::start`], append values with the `append_*`
//! methods, and either let it drop or call [`DataLog::close`] to observe
//! a panicked flusher thread.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod sink;
pub mod writer;

pub use config::WriterConfig;
pub use error::WriterError;
pub use sink::{CallbackSink, FileSink, Sink};
pub use writer::DataLog;
