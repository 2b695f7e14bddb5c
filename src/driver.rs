//! Driver types: the per-type specification and the per-device instance.
//!
//! A [`DriverSpec`] is the Rust rendition of "the driver subtype": it owns
//! the compiled command table, the real-session factory, the registered
//! simulator, and the optional connection-check hook. It is built once
//! (typically in a `LazyLock` static) and shared by every instance.
//!
//! A [`ScpiDriver`] is one handle on one device. Construction resolves or
//! creates the shared session for the device's identity key, health-checks
//! it, and returns an attached driver; every subsequent dispatch runs under
//! the device's re-entrant lock with fault recovery (best-effort buffer
//! flush, original error returned unchanged).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{require_identifier, CallArgs, CommandSpec, Value};
use crate::error::{Result, ScpiError};
use crate::registry::{DeviceKey, DeviceLock, SessionPool};
use crate::serial::{SerialConfig, SerialSession};
use crate::session::{Session, SessionFactory, SimulatorFactory};

/// Connection health check, run lock-wrapped during construction and on
/// demand. Receives the driver so it can invoke generated commands.
pub type ConnectionCheck = Arc<dyn Fn(&ScpiDriver) -> Result<()> + Send + Sync>;

/// Method names reserved by the driver's own public surface.
const RESERVED_METHODS: &[&str] = &["close", "ping", "check_connection"];

// =============================================================================
// Driver Configuration
// =============================================================================

fn default_command_separator() -> String {
    " ".to_string()
}

/// Per-instance construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Which device to attach to. Required; part of the identity key.
    pub device_id: String,
    /// Use the registered simulator instead of the real transport.
    #[serde(default)]
    pub simulation: bool,
    /// Separator between the wire command and its stringified arguments.
    #[serde(default = "default_command_separator")]
    pub command_separator: String,
    /// Transport settings handed to the session factory.
    #[serde(default)]
    pub serial: SerialConfig,
}

impl DriverConfig {
    /// Settings for a real device with transport defaults.
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            simulation: false,
            command_separator: default_command_separator(),
            serial: SerialConfig::default(),
        }
    }

    /// Settings for a simulated device.
    pub fn simulated(device_id: &str) -> Self {
        Self {
            simulation: true,
            ..Self::new(device_id)
        }
    }
}

// =============================================================================
// Driver Specification
// =============================================================================

fn serial_session_factory(config: &DriverConfig) -> Result<Arc<dyn Session>> {
    Ok(Arc::new(SerialSession::open(
        &config.device_id,
        &config.serial,
    )?))
}

/// The declarative driver type: command table plus construction seams.
///
/// Shared via `Arc` by every instance; the simulator slot is
/// interior-mutable so a factory can be registered after the spec is built
/// (and is inherited by every instance constructed afterwards).
pub struct DriverSpec {
    name: String,
    commands: HashMap<String, CommandSpec>,
    session_factory: SessionFactory,
    simulator: RwLock<Option<SimulatorFactory>>,
    connection_check: Option<ConnectionCheck>,
}

impl DriverSpec {
    /// Start declaring a driver type. `name` becomes part of every identity
    /// key derived for instances of this type.
    pub fn builder(name: &str) -> DriverSpecBuilder {
        DriverSpecBuilder {
            name: name.to_string(),
            commands: Vec::new(),
            session_factory: Arc::new(serial_session_factory),
            connection_check: None,
        }
    }

    /// The driver type's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a compiled command.
    pub fn command(&self, method: &str) -> Option<&CommandSpec> {
        self.commands.get(method)
    }

    /// All registered method names, sorted.
    pub fn command_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Register the simulator factory for this driver type.
    ///
    /// Enables `simulation = true` construction for every instance built
    /// after this call. The factory must produce an object satisfying the
    /// session contract; minimally it answers `query`.
    pub fn register_simulator(&self, factory: impl Fn() -> Arc<dyn Session> + Send + Sync + 'static) {
        *self
            .simulator
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(factory));
    }

    pub(crate) fn simulator(&self) -> Option<SimulatorFactory> {
        self.simulator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn connection_check(&self) -> Option<ConnectionCheck> {
        self.connection_check.clone()
    }
}

/// Builder for [`DriverSpec`].
pub struct DriverSpecBuilder {
    name: String,
    commands: Vec<CommandSpec>,
    session_factory: SessionFactory,
    connection_check: Option<ConnectionCheck>,
}

impl DriverSpecBuilder {
    /// Add a compiled command to the method table.
    pub fn command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    /// Replace the default serial session factory.
    pub fn session_factory(
        mut self,
        factory: impl Fn(&DriverConfig) -> Result<Arc<dyn Session>> + Send + Sync + 'static,
    ) -> Self {
        self.session_factory = Arc::new(factory);
        self
    }

    /// Install the connection health check run during construction.
    ///
    /// The hook runs under the device lock, so it may freely invoke the
    /// driver's generated commands.
    pub fn connection_check(
        mut self,
        check: impl Fn(&ScpiDriver) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.connection_check = Some(Arc::new(check));
        self
    }

    /// Validate the declaration and produce the driver type.
    ///
    /// # Errors
    ///
    /// [`ScpiError::InvalidSpecification`] for a malformed driver name or a
    /// duplicate/reserved method name.
    pub fn build(self) -> Result<DriverSpec> {
        require_identifier("driver", &self.name)?;

        let mut commands = HashMap::with_capacity(self.commands.len());
        for command in self.commands {
            let method = command.method_name().to_string();
            if RESERVED_METHODS.contains(&method.as_str()) {
                return Err(ScpiError::InvalidSpecification(format!(
                    "method name '{method}' is reserved by the driver surface"
                )));
            }
            if commands.insert(method.clone(), command).is_some() {
                return Err(ScpiError::InvalidSpecification(format!(
                    "duplicate method name '{method}'"
                )));
            }
        }

        Ok(DriverSpec {
            name: self.name,
            commands,
            session_factory: self.session_factory,
            simulator: RwLock::new(None),
            connection_check: self.connection_check,
        })
    }
}

// =============================================================================
// Driver Instance
// =============================================================================

/// One attached handle on one device.
///
/// Cloning produces another handle on the same shared session and lock,
/// the same situation as constructing a second instance with the same
/// identity key.
#[derive(Clone)]
pub struct ScpiDriver {
    spec: Arc<DriverSpec>,
    pool: SessionPool,
    key: DeviceKey,
    session: Arc<dyn Session>,
    lock: Arc<DeviceLock>,
    command_separator: String,
    device_id: String,
    simulation: bool,
}

impl ScpiDriver {
    /// Resolve or create the shared session for this device and return an
    /// attached driver.
    ///
    /// Construction sequence: validate the device id, derive the identity
    /// key, get-or-create the session under the key's lock (simulator
    /// factory in simulation mode, session factory otherwise; a new session
    /// is flushed once), then run the connection check outside the creation
    /// scope.
    ///
    /// # Errors
    ///
    /// [`ScpiError::Configuration`] for a missing device id or simulation
    /// without a registered factory; transport/check failures propagate
    /// unchanged. On any error no usable instance exists.
    pub fn connect(spec: Arc<DriverSpec>, pool: &SessionPool, config: DriverConfig) -> Result<Self> {
        if config.device_id.is_empty() {
            return Err(ScpiError::Configuration(
                "a device id is required".to_string(),
            ));
        }

        let key = DeviceKey::new(spec.name(), &config.device_id, config.simulation);
        debug!("constructing driver for {}", key);

        let lock = pool.lock_for(&key);
        let session = {
            let _creation = lock.acquire();
            pool.get_or_create(&key, || {
                let session: Arc<dyn Session> = if config.simulation {
                    match spec.simulator() {
                        Some(factory) => factory(),
                        None => {
                            return Err(ScpiError::Configuration(
                                "simulation unavailable until a simulator factory is registered"
                                    .to_string(),
                            ))
                        }
                    }
                } else {
                    (spec.session_factory)(&config)?
                };
                session.flush()?;
                Ok(session)
            })?
        };

        let driver = Self {
            spec,
            pool: pool.clone(),
            key,
            session,
            lock,
            command_separator: config.command_separator,
            device_id: config.device_id,
            simulation: config.simulation,
        };

        driver.check_connection()?;
        info!("driver for {} connected", driver.key);
        Ok(driver)
    }

    /// Invoke a generated command synchronously.
    ///
    /// Binding errors surface before the device lock is taken; everything
    /// after runs under the lock with fault recovery. Returns `None` for
    /// fire-and-forget commands, `Some(value)` otherwise.
    pub fn call(&self, method: &str, args: CallArgs) -> Result<Option<Value>> {
        let command = self
            .spec
            .command(method)
            .ok_or_else(|| ScpiError::UnknownCommand(method.to_string()))?;
        let bound = command.bind(&args)?;

        let _guard = self.lock.acquire();
        self.run_recovered(|| self.execute(command, &bound))
    }

    /// Invoke a generated command on the blocking pool and await the result.
    ///
    /// The executor, locking, and recovery are identical to [`call`];
    /// suspension happens only at the hand-off to the worker. This is the
    /// entry point for commands declared
    /// [`Asynchronous`](crate::command::DispatchMode::Asynchronous).
    pub async fn call_async(&self, method: &str, args: CallArgs) -> Result<Option<Value>> {
        let driver = self.clone();
        let method = method.to_string();
        tokio::task::spawn_blocking(move || driver.call(&method, args))
            .await
            .map_err(|err| ScpiError::Transport(format!("async dispatch worker failed: {err}")))?
    }

    /// Run the driver type's connection health check (default: no-op).
    pub fn check_connection(&self) -> Result<()> {
        let _guard = self.lock.acquire();
        self.run_recovered(|| match self.spec.connection_check() {
            Some(check) => check(self),
            None => Ok(()),
        })
    }

    /// Liveness probe for hosting infrastructure.
    pub fn ping(&self) -> bool {
        true
    }

    /// Documentation for a generated method, if it exists.
    pub fn help(&self, method: &str) -> Option<&str> {
        self.spec.command(method).map(CommandSpec::docs)
    }

    /// The caller-supplied device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether this instance runs against the registered simulator.
    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    /// Method names this driver answers to, sorted.
    pub fn command_names(&self) -> Vec<&str> {
        self.spec.command_names()
    }

    /// Close the shared session and drop this device's pool entries.
    ///
    /// Every other instance sharing the identity key becomes invalid the
    /// moment the session closes: built-in sessions fail subsequent calls
    /// with [`ScpiError::SessionClosed`]. The key itself may be reused by a
    /// fresh `connect`.
    pub fn close(&self) -> Result<()> {
        warn!("closing session for {}", self.key);
        let result = self.session.close();
        self.pool.remove(&self.key);
        result
    }

    fn execute(&self, command: &CommandSpec, values: &[Value]) -> Result<Option<Value>> {
        let mut parts: Vec<String> = Vec::with_capacity(values.len() + 1);
        parts.push(command.device_command().to_string());
        for (arg, value) in command.args().iter().zip(values) {
            parts.push(arg.format(value)?);
        }
        let wire = parts.join(&self.command_separator);

        debug!("sending command '{}' to {}", wire, self.key);
        self.session.flush()?;

        match command.parser() {
            Some(parser) => {
                let raw = self.session.query(&wire)?;
                if let Some(validator) = command.response_validator() {
                    validator(&raw)?;
                }
                parser(&raw).map(Some)
            }
            None => {
                self.session.write(&wire)?;
                Ok(None)
            }
        }
    }

    /// Run `body`; on any failure flush the session (best-effort) and return
    /// the original error unchanged. No retry is attempted; the flush only
    /// clears stale buffered bytes so the session is usable for the next
    /// call.
    fn run_recovered<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        match body() {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Err(flush_err) = self.session.flush() {
                    warn!("recovery flush for {} failed: {}", self.key, flush_err);
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for ScpiDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScpiDriver")
            .field("key", &self.key)
            .field("simulation", &self.simulation)
            .finish()
    }
}
