//! Error types for the feed watcher
//!
//! This module defines the domain error types used throughout the application.

use thiserror::Error;

/// Errors that can occur while fetching a feed
///
/// Every variant describes a call that produced no HTTP response at all.
/// Status codes are not errors at this layer; they are classified into an
/// [`HttpClass`](crate::models::HttpClass) by the caller.
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Feed id could not be turned into a request URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Response body could not be read
    #[error("Failed to read response body: {0}")]
    Body(String),
}

/// Errors that can occur while parsing a feed payload
#[derive(Error, Debug)]
pub enum ParseError {
    /// Payload is neither a valid Atom nor RSS document
    #[error("Unknown or unsupported feed format")]
    UnknownFormat,

    /// Payload is empty
    #[error("Empty payload")]
    Empty,
}

/// Errors raised by the SQLite-backed stores
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Another thread panicked while holding the connection
    #[error("Database connection lock poisoned")]
    LockPoisoned,

    /// Keyed update hit no row
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// A stored timestamp column could not be parsed
    #[error("Invalid timestamp in column '{column}': {value}")]
    InvalidTimestamp { column: &'static str, value: String },

    /// Filesystem error around the database file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
