//! `impactlog` - impact event logging with a live web view
//!
//! A sampling thread appends impact records to an append-only CSV
//! [`EventLog`]. A single-threaded HTTP [`Server`] streams that log to clients
//! on the local subnet as an HTML table, with a small polling script that
//! refreshes the table whenever the log's version changes.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod access;
pub mod cli;
pub mod config;
pub mod error;
pub mod event_log;
pub mod handler;
pub mod http;
pub mod logging;
pub mod monitor;
pub mod render;
pub mod server;
pub mod writer;

pub use access::{AccessControl, Rejection};
pub use config::Config;
pub use error::{Error, Result};
pub use event_log::{EventLog, LogSnapshot, Record, StorageError};
pub use handler::{ConnectionHandler, Outcome};
pub use logging::init_logging;
pub use server::{Server, ServerContext};
pub use writer::BufferedWriter;
