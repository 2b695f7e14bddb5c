//! Scripted session for exercising drivers without hardware.
//!
//! [`MockSession`] records every command it is handed and answers queries
//! from a scripted response queue (falling back to a configurable default).
//! Register one as a simulator factory and a driver runs entirely in memory:
//!
//! ```
//! use std::sync::Arc;
//! use scpi_driver::mock::MockSession;
//! use scpi_driver::Session;
//!
//! let session = Arc::new(MockSession::with_response("Test device"));
//! assert_eq!(session.query("*IDN?").unwrap(), "Test device");
//! assert_eq!(session.sent(), vec!["*IDN?".to_string()]);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{Result, ScpiError};
use crate::session::Session;

/// In-memory session with scripted responses and a full command transcript.
///
/// Honors the closed-session contract: after [`close`](Session::close),
/// every operation fails with [`ScpiError::SessionClosed`].
#[derive(Default)]
pub struct MockSession {
    /// Responses consumed front-first by `query`; empty queue falls back to
    /// the default response.
    responses: Mutex<VecDeque<Result<String>>>,
    default_response: Mutex<String>,
    sent: Mutex<Vec<String>>,
    flushes: AtomicUsize,
    closed: AtomicBool,
}

impl MockSession {
    /// A session answering every query with an empty string.
    pub fn new() -> Self {
        Self::default()
    }

    /// A session answering every query with `response`.
    pub fn with_response(response: &str) -> Self {
        let session = Self::default();
        session.set_response(response);
        session
    }

    /// Replace the fallback response.
    pub fn set_response(&self, response: &str) {
        *self
            .default_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = response.to_string();
    }

    /// Queue a one-shot response, consumed before the fallback.
    pub fn push_response(&self, response: &str) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response.to_string()));
    }

    /// Queue a one-shot transport fault for the next query.
    pub fn push_fault(&self, message: &str) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(ScpiError::Transport(message.to_string())));
    }

    /// Every command handed to `write` or `query`, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recent command, if any.
    pub fn last_command(&self) -> Option<String> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// How many times `flush` has been called.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ScpiError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn record(&self, command: &str) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());
    }
}

impl Session for MockSession {
    fn write(&self, command: &str) -> Result<()> {
        self.ensure_open()?;
        self.record(command);
        Ok(())
    }

    fn query(&self, command: &str) -> Result<String> {
        self.ensure_open()?;
        self.record(command);
        let scripted = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(self
                .default_response
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
        }
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
