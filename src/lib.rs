//! `scpi-driver`
//!
//! Declarative driver generation for instruments that speak a line-oriented
//! text command protocol (SCPI and friends) over a point-to-point session.
//!
//! Instead of hand-writing one method per instrument command, a driver type
//! is declared as data (each command with its wire syntax, argument list,
//! and response validator/parser) and compiled at registration time into a
//! method table of safe, correctly-bound callables.
//!
//! ## Architecture
//!
//! - [`Session`]: the transport contract (`write`/`query`/`flush`/`close`);
//!   [`serial::SerialSession`] implements it for real hardware,
//!   [`mock::MockSession`] for tests and simulators
//! - [`SessionPool`]: shares one session and one re-entrant lock per device
//!   identity, so several driver instances addressing the same device take
//!   turns on a single connection
//! - [`CommandSpec`]: one declared command, compiled once and reused by
//!   every instance and every call
//! - [`DriverSpec`]: the driver type: command table, session factory,
//!   registered simulator, connection-check hook
//! - [`ScpiDriver`]: one attached handle on one device; every dispatch runs
//!   under the device lock with fault recovery (best-effort buffer flush,
//!   original error returned unchanged)
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use scpi_driver::mock::MockSession;
//! use scpi_driver::{
//!     parsers, Arg, CallArgs, CommandSpec, DriverConfig, DriverSpec, ScpiDriver, SessionPool,
//!     Value,
//! };
//!
//! # fn main() -> scpi_driver::Result<()> {
//! let spec = Arc::new(
//!     DriverSpec::builder("Synth")
//!         .command(
//!             CommandSpec::builder("get_version", "*VER?")
//!                 .parser(parsers::int)
//!                 .build()?,
//!         )
//!         .command(
//!             CommandSpec::builder("set_mode", "MODE")
//!                 .arg(Arg::new("channel"))
//!                 .arg(Arg::new("mode").with_default(1))
//!                 .no_reply()
//!                 .build()?,
//!         )
//!         .build()?,
//! );
//!
//! // Hardware-free: register a simulator, then construct in simulation mode.
//! let sim = Arc::new(MockSession::with_response("42"));
//! let handle = sim.clone();
//! spec.register_simulator(move || handle.clone());
//!
//! let pool = SessionPool::new();
//! let driver = ScpiDriver::connect(spec, &pool, DriverConfig::simulated("bench-1"))?;
//!
//! assert_eq!(driver.call("get_version", CallArgs::new())?, Some(Value::Int(42)));
//! assert_eq!(driver.call("set_mode", CallArgs::new().arg(2))?, None);
//! assert_eq!(sim.last_command().as_deref(), Some("MODE 2 1"));
//! driver.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Drivers against real hardware differ only in construction: leave
//! `simulation` off and the spec's session factory (serial by default)
//! opens the port named by `device_id`.

pub mod command;
pub mod driver;
pub mod error;
pub mod mock;
pub mod registry;
pub mod serial;
pub mod session;

pub use command::{parsers, Arg, CallArgs, CommandSpec, CommandSpecBuilder, DispatchMode, Value};
pub use driver::{ConnectionCheck, DriverConfig, DriverSpec, DriverSpecBuilder, ScpiDriver};
pub use error::{Result, ScpiError};
pub use registry::{DeviceLock, DeviceLockGuard, SessionPool};
pub use serial::{resolve_port, SerialConfig, SerialSession};
pub use session::{Session, SessionFactory, SimulatorFactory};
