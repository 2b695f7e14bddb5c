//! Command specifications and the compiler that turns them into callables.
//!
//! An instrument command is declared as data (a method name, a wire-format
//! prefix, an ordered argument list, and an optional response
//! validator/parser) and compiled once, at registration time, into an
//! immutable [`CommandSpec`] held in the driver type's method table. A call
//! site supplies a [`CallArgs`] bundle; binding enforces the same contract a
//! named/defaulted parameter list would (positional or keyword values,
//! unknown keywords rejected, excess positionals rejected, omitted trailing
//! arguments filled from their declared defaults) before the device lock is
//! ever taken.
//!
//! Specification errors (bad identifiers, a default followed by a
//! non-default) fail [`CommandSpecBuilder::build`] with
//! [`ScpiError::InvalidSpecification`], so no driver instance can exist for
//! a malformed declaration.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScpiError};

/// Pattern a method or argument name must match (compiled once).
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid identifier regex"));

pub(crate) fn require_identifier(kind: &str, name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(ScpiError::InvalidSpecification(format!(
            "'{name}' is not a valid {kind} name"
        )))
    }
}

// =============================================================================
// Runtime Values
// =============================================================================

/// Runtime value passed to or returned from a generated command.
///
/// Arguments are stringified onto the wire via an argument's validator or,
/// absent one, via this type's `Display`. Response parsers produce a `Value`
/// from the device's raw reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Text value.
    Str(String),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Boolean value (`Display`s as `true`/`false`).
    Bool(bool),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Integer view of the value, if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow the text, if the value is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

// =============================================================================
// Callbacks
// =============================================================================

/// Formats one argument value for interpolation into the wire command.
///
/// May reject the value with [`ScpiError::Validation`]. Absence on an [`Arg`]
/// means "stringify as-is".
pub type ArgValidator = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;

/// Turns the device's raw reply into the command's return value.
pub type ResponseParser = Arc<dyn Fn(&str) -> Result<Value> + Send + Sync>;

/// Checks the device's raw reply before the parser runs.
pub type ResponseValidator = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

// =============================================================================
// Arguments
// =============================================================================

/// One declared argument of a command.
#[derive(Clone)]
pub struct Arg {
    name: String,
    default: Option<Value>,
    validator: Option<ArgValidator>,
}

impl Arg {
    /// Declare a required argument.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
            validator: None,
        }
    }

    /// Give the argument a default, making it optional at the call site.
    ///
    /// Once any argument in a command's ordered list has a default, every
    /// later argument must also have one; the builder rejects violations.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Attach a validator that formats (and may reject) supplied values.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&Value) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// The argument's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the argument has a declared default.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Run the validator (or plain stringification) on a bound value.
    pub(crate) fn format(&self, value: &Value) -> Result<String> {
        match &self.validator {
            Some(validator) => validator(value),
            None => Ok(value.to_string()),
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arg")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

// =============================================================================
// Call-site Argument Bundles
// =============================================================================

/// Positional and keyword values supplied at a call site.
///
/// ```
/// use scpi_driver::CallArgs;
///
/// let args = CallArgs::new().arg(1).kwarg("mode", "fast");
/// ```
#[derive(Clone, Default)]
pub struct CallArgs {
    positional: Vec<Value>,
    keyword: Vec<(String, Value)>,
}

impl CallArgs {
    /// An empty bundle, for zero-argument commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional value.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Append a keyword value.
    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.keyword.push((name.to_string(), value.into()));
        self
    }
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArgs")
            .field("positional", &self.positional)
            .field("keyword", &self.keyword)
            .finish()
    }
}

// =============================================================================
// Dispatch Mode
// =============================================================================

/// How a command's compiled executor is intended to be dispatched.
///
/// The executor, locking, and recovery are identical in both modes; an
/// `Asynchronous` command is meant to be invoked through
/// [`ScpiDriver::call_async`](crate::driver::ScpiDriver::call_async), which
/// off-loads the blocking executor to a worker and is awaitable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run on the caller's own thread.
    Synchronous,
    /// Off-load to the blocking pool; the caller awaits the result.
    Asynchronous,
}

// =============================================================================
// Command Specification
// =============================================================================

/// An immutable, compiled instrument command.
///
/// Built once via [`CommandSpec::builder`] and shared (inside a
/// [`DriverSpec`](crate::driver::DriverSpec)) by every driver instance and
/// every call.
#[derive(Clone)]
pub struct CommandSpec {
    method_name: String,
    device_command: String,
    parser: Option<ResponseParser>,
    response_validator: Option<ResponseValidator>,
    args: Vec<Arg>,
    mode: DispatchMode,
    docs: String,
}

impl CommandSpec {
    /// Start declaring a command.
    ///
    /// `method_name` is the name the generated method is invoked by;
    /// `device_command` is the wire-format command prefix sent to the device.
    pub fn builder(method_name: &str, device_command: &str) -> CommandSpecBuilder {
        CommandSpecBuilder {
            method_name: method_name.to_string(),
            device_command: device_command.to_string(),
            parser: Some(Arc::new(parsers::string)),
            response_validator: None,
            args: Vec::new(),
            mode: DispatchMode::Synchronous,
            docs: None,
        }
    }

    /// The generated method's name.
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// The wire-format command prefix.
    pub fn device_command(&self) -> &str {
        &self.device_command
    }

    /// Declared arguments, in order.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// The command's dispatch mode.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Documentation attached at registration time.
    pub fn docs(&self) -> &str {
        &self.docs
    }

    pub(crate) fn parser(&self) -> Option<&ResponseParser> {
        self.parser.as_ref()
    }

    pub(crate) fn response_validator(&self) -> Option<&ResponseValidator> {
        self.response_validator.as_ref()
    }

    /// Bind a call site's values to the declared argument list.
    ///
    /// Enforces the calling convention: at most `args.len()` positional
    /// values, keywords must name declared arguments, a keyword may not
    /// duplicate a positional, and anything left unbound falls back to its
    /// declared default or fails.
    pub(crate) fn bind(&self, call: &CallArgs) -> Result<Vec<Value>> {
        if call.positional.len() > self.args.len() {
            return Err(ScpiError::ArgumentBinding(format!(
                "{} takes at most {} argument(s), got {}",
                self.method_name,
                self.args.len(),
                call.positional.len()
            )));
        }

        let mut slots: Vec<Option<Value>> = vec![None; self.args.len()];
        for (slot, value) in slots.iter_mut().zip(call.positional.iter()) {
            *slot = Some(value.clone());
        }

        for (name, value) in &call.keyword {
            let index = self
                .args
                .iter()
                .position(|arg| arg.name == *name)
                .ok_or_else(|| {
                    ScpiError::ArgumentBinding(format!(
                        "{} got an unexpected keyword argument '{name}'",
                        self.method_name
                    ))
                })?;
            if slots[index].is_some() {
                return Err(ScpiError::ArgumentBinding(format!(
                    "{} got multiple values for argument '{name}'",
                    self.method_name
                )));
            }
            slots[index] = Some(value.clone());
        }

        let mut bound = Vec::with_capacity(self.args.len());
        for (slot, arg) in slots.into_iter().zip(self.args.iter()) {
            match slot {
                Some(value) => bound.push(value),
                None => match &arg.default {
                    Some(default) => bound.push(default.clone()),
                    None => {
                        return Err(ScpiError::ArgumentBinding(format!(
                            "{} missing required argument '{}'",
                            self.method_name, arg.name
                        )))
                    }
                },
            }
        }
        Ok(bound)
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("method_name", &self.method_name)
            .field("device_command", &self.device_command)
            .field("args", &self.args)
            .field("mode", &self.mode)
            .field("fire_and_forget", &self.parser.is_none())
            .finish()
    }
}

/// Builder for [`CommandSpec`]; validation happens in [`build`](Self::build).
pub struct CommandSpecBuilder {
    method_name: String,
    device_command: String,
    parser: Option<ResponseParser>,
    response_validator: Option<ResponseValidator>,
    args: Vec<Arg>,
    mode: DispatchMode,
    docs: Option<String>,
}

impl CommandSpecBuilder {
    /// Append a declared argument.
    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    /// Replace the default identity-as-string parser.
    pub fn parser(mut self, parser: impl Fn(&str) -> Result<Value> + Send + Sync + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    /// Mark the command fire-and-forget: the device's response is not read
    /// at all and the call returns `None`.
    pub fn no_reply(mut self) -> Self {
        self.parser = None;
        self
    }

    /// Check the raw response before the parser runs; may fail the call.
    pub fn response_validator(
        mut self,
        validator: impl Fn(&str) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.response_validator = Some(Arc::new(validator));
        self
    }

    /// Dispatch the compiled executor through the blocking pool.
    pub fn asynchronous(mut self) -> Self {
        self.mode = DispatchMode::Asynchronous;
        self
    }

    /// Attach documentation; auto-generated when not supplied.
    pub fn docs(mut self, docs: &str) -> Self {
        self.docs = Some(docs.to_string());
        self
    }

    /// Validate the declaration and produce the compiled command.
    ///
    /// # Errors
    ///
    /// [`ScpiError::InvalidSpecification`] for a malformed method or argument
    /// name, a duplicate argument name, or a non-defaulted argument after a
    /// defaulted one.
    pub fn build(self) -> Result<CommandSpec> {
        require_identifier("method", &self.method_name)?;

        let mut seen_default = false;
        for (index, arg) in self.args.iter().enumerate() {
            require_identifier("argument", &arg.name)?;
            if self.args[..index].iter().any(|other| other.name == arg.name) {
                return Err(ScpiError::InvalidSpecification(format!(
                    "duplicate argument name '{}' in {}",
                    arg.name, self.method_name
                )));
            }
            if arg.default.is_some() {
                seen_default = true;
            } else if seen_default {
                return Err(ScpiError::InvalidSpecification(format!(
                    "argument '{}' without a default follows defaulted arguments in {}",
                    arg.name, self.method_name
                )));
            }
        }

        let docs = self.docs.unwrap_or_else(|| {
            let names: Vec<&str> = self.args.iter().map(|a| a.name.as_str()).collect();
            format!(
                "Send \"{}\" to the device.\n\nGenerated method `{}`; accepts {} argument(s) named [{}].",
                self.device_command,
                self.method_name,
                self.args.len(),
                names.join(", ")
            )
        });

        Ok(CommandSpec {
            method_name: self.method_name,
            device_command: self.device_command,
            parser: self.parser,
            response_validator: self.response_validator,
            args: self.args,
            mode: self.mode,
            docs,
        })
    }
}

// =============================================================================
// Common Response Parsers
// =============================================================================

/// Response parsers for the usual reply shapes.
///
/// These have the exact signature user-supplied parsers take, so
/// `.parser(parsers::int)` and `.parser(|raw| ...)` are interchangeable.
pub mod parsers {
    use super::Value;
    use crate::error::{Result, ScpiError};

    /// Identity: the raw reply as text. This is every command's default.
    pub fn string(raw: &str) -> Result<Value> {
        Ok(Value::Str(raw.to_string()))
    }

    /// Parse the reply as a signed integer.
    pub fn int(raw: &str) -> Result<Value> {
        raw.trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|err| ScpiError::Parse(format!("expected an integer, got {raw:?}: {err}")))
    }

    /// Parse the reply as a float (scientific notation included).
    pub fn float(raw: &str) -> Result<Value> {
        raw.trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|err| ScpiError::Parse(format!("expected a number, got {raw:?}: {err}")))
    }

    /// Parse `1`/`0`/`on`/`off`/`true`/`false` replies.
    pub fn boolean(raw: &str) -> Result<Value> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "on" | "true" => Ok(Value::Bool(true)),
            "0" | "off" | "false" => Ok(Value::Bool(false)),
            other => Err(ScpiError::Parse(format!(
                "expected a boolean reply, got {other:?}"
            ))),
        }
    }
}
