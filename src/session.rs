//! The session contract between the dispatch engine and a transport.
//!
//! A [`Session`] owns the live connection to one physical instrument. The
//! framework only ever talks to a session through this trait, so any
//! transport (serial, GPIB gateway, TCP bridge, a scripted mock) can be
//! substituted as long as it answers these four calls. Sessions are shared by
//! reference across every driver instance addressing the same device, which
//! is why all methods take `&self`: implementations use interior mutability
//! and must be safe to hand across threads.

use std::sync::Arc;

use crate::driver::DriverConfig;
use crate::error::Result;

/// Communication capability set consumed by the dispatch engine.
///
/// Exclusive access is guaranteed by the per-device lock in the dispatch
/// layer, not by the session itself; a session only has to be internally
/// consistent under that serialization.
pub trait Session: Send + Sync {
    /// Send a command with no expected response.
    fn write(&self, command: &str) -> Result<()>;

    /// Send a command and block for a single textual response.
    fn query(&self, command: &str) -> Result<String>;

    /// Discard buffered bytes in both directions.
    ///
    /// Called once after a session is created and before every command, and
    /// best-effort after any dispatch failure. Transports with nothing to
    /// flush keep this default no-op.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Release the underlying resource.
    ///
    /// The session will not be used again after a successful close; built-in
    /// sessions fail all subsequent calls with
    /// [`ScpiError::SessionClosed`](crate::ScpiError::SessionClosed).
    fn close(&self) -> Result<()>;
}

/// Factory producing the real session for a device.
///
/// Receives the full driver configuration so transport-specific settings
/// (baud rate, terminations, timeouts) reach the transport.
pub type SessionFactory = Arc<dyn Fn(&DriverConfig) -> Result<Arc<dyn Session>> + Send + Sync>;

/// Zero-argument factory producing a simulated session.
///
/// Registered on a driver specification with
/// [`DriverSpec::register_simulator`](crate::driver::DriverSpec::register_simulator);
/// the sole seam for exercising driver logic without hardware.
pub type SimulatorFactory = Arc<dyn Fn() -> Arc<dyn Session> + Send + Sync>;
