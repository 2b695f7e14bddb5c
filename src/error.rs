//! Error types for the driver framework.
//!
//! This module defines [`ScpiError`], the single error type surfaced by every
//! fallible operation in the crate. The framework never wraps or downgrades a
//! failure once it has been constructed: a validator's error reaches the
//! caller exactly as the validator produced it, with the recovery flush of the
//! dispatch layer as the only added side effect.
//!
//! ## Error Categories
//!
//! - **Registration errors** (`InvalidSpecification`) occur while building a
//!   command or driver specification, before any driver instance exists.
//! - **Construction errors** (`Configuration`) occur in
//!   [`ScpiDriver::connect`](crate::driver::ScpiDriver::connect) and are never
//!   retried; no partially-usable driver is ever produced.
//! - **Per-call errors** (`ArgumentBinding`, `Validation`, `Parse`,
//!   `Transport`, `SessionClosed`, `UnknownCommand`) lose only the failing
//!   call; the driver instance itself stays usable.

use thiserror::Error;

/// Convenience alias for results using the framework error type.
pub type Result<T> = std::result::Result<T, ScpiError>;

/// Primary error type for the driver framework.
#[derive(Error, Debug)]
pub enum ScpiError {
    /// Driver construction was misconfigured.
    ///
    /// Raised for a missing device id, for `simulation = true` before a
    /// simulator factory was registered, or for an unresolvable serial port.
    /// Fatal to construction: no driver instance exists after this error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A command specification was malformed.
    ///
    /// Raised at registration time for a method or argument name that is not
    /// a valid identifier, for a non-defaulted argument following a defaulted
    /// one, or for a duplicate/reserved method name. No instance of the
    /// driver type can be built from an invalid specification.
    #[error("Invalid command specification: {0}")]
    InvalidSpecification(String),

    /// A call site supplied arguments that do not bind to the declared list.
    ///
    /// Too many positional values, an unknown keyword, a keyword duplicating
    /// a positional, or a missing non-defaulted argument. Surfaced before the
    /// device lock is taken; the framework never catches it.
    #[error("Argument binding error: {0}")]
    ArgumentBinding(String),

    /// A caller-supplied argument or response validator rejected a value.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A response parser could not interpret the device's reply.
    #[error("Response parse error: {0}")]
    Parse(String),

    /// The underlying session failed during `write`/`query`/`flush`.
    ///
    /// Triggers the flush-and-return recovery path: stale buffered bytes are
    /// discarded so the session is usable for the next call, but the failed
    /// command is not retried and no reconnection is attempted.
    #[error("Transport fault: {0}")]
    Transport(String),

    /// Operation on a session that has been closed.
    ///
    /// Any driver instance sharing a device key becomes invalid the moment a
    /// sibling calls `close()`; built-in sessions surface this error rather
    /// than leaving the behavior undefined.
    #[error("Session is closed")]
    SessionClosed,

    /// The method name is not present in the driver's command table.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

impl From<std::io::Error> for ScpiError {
    fn from(err: std::io::Error) -> Self {
        ScpiError::Transport(err.to_string())
    }
}

impl From<serialport::Error> for ScpiError {
    fn from(err: serialport::Error) -> Self {
        ScpiError::Transport(err.to_string())
    }
}
