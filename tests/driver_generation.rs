//! End-to-end tests for driver generation against a scripted session.
//!
//! Each test builds its own `DriverSpec` and `SessionPool`, registers a
//! shared `MockSession` as the simulator, and constructs drivers in
//! simulation mode, the same seam a hardware-free deployment would use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use scpi_driver::mock::MockSession;
use scpi_driver::{
    parsers, Arg, CallArgs, CommandSpec, DriverConfig, DriverSpec, ScpiDriver, ScpiError,
    SessionPool, Value,
};

/// Spec with one zero-argument identity query.
fn identity_spec() -> DriverSpec {
    DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_identity", "*IDN?")
                .build()
                .expect("valid command"),
        )
        .build()
        .expect("valid spec")
}

/// Register `sim` as the spec's simulator and connect a simulated driver.
fn connect_simulated(spec: DriverSpec, sim: &Arc<MockSession>) -> (Arc<DriverSpec>, ScpiDriver) {
    let spec = Arc::new(spec);
    let shared = sim.clone();
    spec.register_simulator(move || shared.clone());
    let pool = SessionPool::new();
    let driver = ScpiDriver::connect(spec.clone(), &pool, DriverConfig::simulated("anything"))
        .expect("simulated driver connects");
    (spec, driver)
}

#[test]
fn simulation_unavailable_before_simulator_registration() {
    let spec = Arc::new(identity_spec());
    let pool = SessionPool::new();

    let result = ScpiDriver::connect(spec.clone(), &pool, DriverConfig::simulated("anything"));
    match result {
        Err(ScpiError::Configuration(message)) => {
            assert!(message.contains("simulation unavailable"))
        }
        other => panic!("expected Configuration error, got {other:?}"),
    }

    // Registering a factory and retrying succeeds.
    spec.register_simulator(|| Arc::new(MockSession::new()));
    ScpiDriver::connect(spec, &pool, DriverConfig::simulated("anything"))
        .expect("construction succeeds once a simulator exists");
}

#[test]
fn generated_commands_send_their_wire_strings() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_identity", "*IDN?")
                .build()
                .expect("valid"),
        )
        .command(
            CommandSpec::builder("get_version", "*VER?")
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::new());
    let (_spec, driver) = connect_simulated(spec, &sim);

    driver
        .call("get_identity", CallArgs::new())
        .expect("dispatch");
    assert_eq!(sim.last_command().as_deref(), Some("*IDN?"));

    driver
        .call("get_version", CallArgs::new())
        .expect("dispatch");
    assert_eq!(sim.last_command().as_deref(), Some("*VER?"));
}

#[test]
fn default_parser_returns_raw_response() {
    let sim = Arc::new(MockSession::with_response("Test device"));
    let (_spec, driver) = connect_simulated(identity_spec(), &sim);

    let response = driver
        .call("get_identity", CallArgs::new())
        .expect("dispatch");
    assert_eq!(response, Some(Value::Str("Test device".into())));
}

#[test]
fn integer_parser_returns_parsed_value() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_identity", "*IDN?")
                .parser(parsers::int)
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::with_response("123"));
    let (_spec, driver) = connect_simulated(spec, &sim);

    let response = driver
        .call("get_identity", CallArgs::new())
        .expect("dispatch");
    assert_eq!(response, Some(Value::Int(123)));
}

#[test]
fn parser_and_validation_failures_reach_the_caller() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_identity", "*IDN?")
                .parser(|raw| {
                    let value = raw
                        .trim()
                        .parse::<i64>()
                        .map_err(|err| ScpiError::Parse(format!("bad reply {raw:?}: {err}")))?;
                    if value > 100 {
                        return Err(ScpiError::Validation("value out of range".into()));
                    }
                    Ok(Value::Int(value))
                })
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::new());
    let (_spec, driver) = connect_simulated(spec, &sim);

    sim.push_response("10");
    assert_eq!(
        driver.call("get_identity", CallArgs::new()).expect("ok"),
        Some(Value::Int(10))
    );

    sim.push_response("potato");
    assert!(matches!(
        driver.call("get_identity", CallArgs::new()),
        Err(ScpiError::Parse(_))
    ));

    sim.push_response("200");
    match driver.call("get_identity", CallArgs::new()) {
        Err(ScpiError::Validation(message)) => assert_eq!(message, "value out of range"),
        other => panic!("expected Validation error, got {other:?}"),
    }

    // Failures lose only the failing call; the driver stays usable.
    sim.push_response("7");
    assert_eq!(
        driver.call("get_identity", CallArgs::new()).expect("ok"),
        Some(Value::Int(7))
    );
}

#[test]
fn response_validator_runs_before_parser() {
    let parsed = Arc::new(AtomicUsize::new(0));
    let parsed_in_closure = parsed.clone();
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_status", "STAT?")
                .response_validator(|raw| {
                    if raw.contains("ERR") {
                        Err(ScpiError::Validation(format!("device error: {raw}")))
                    } else {
                        Ok(())
                    }
                })
                .parser(move |raw| {
                    parsed_in_closure.fetch_add(1, Ordering::SeqCst);
                    parsers::int(raw)
                })
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::new());
    let (_spec, driver) = connect_simulated(spec, &sim);

    sim.push_response("ERR 17");
    assert!(matches!(
        driver.call("get_status", CallArgs::new()),
        Err(ScpiError::Validation(_))
    ));
    assert_eq!(parsed.load(Ordering::SeqCst), 0);

    sim.push_response("5");
    assert_eq!(
        driver.call("get_status", CallArgs::new()).expect("ok"),
        Some(Value::Int(5))
    );
    assert_eq!(parsed.load(Ordering::SeqCst), 1);
}

#[test]
fn required_argument_enforced_and_interpolated() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_mode", "MODE?")
                .arg(Arg::new("channel"))
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::with_response("on"));
    let (_spec, driver) = connect_simulated(spec, &sim);

    assert!(matches!(
        driver.call("get_mode", CallArgs::new()),
        Err(ScpiError::ArgumentBinding(_))
    ));

    let response = driver
        .call("get_mode", CallArgs::new().arg(1))
        .expect("dispatch");
    assert_eq!(response, Some(Value::Str("on".into())));
    assert_eq!(sim.last_command().as_deref(), Some("MODE? 1"));
}

#[test]
fn omitted_argument_uses_declared_default() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_mode", "MODE?")
                .arg(Arg::new("channel").with_default("1"))
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::with_response("on"));
    let (_spec, driver) = connect_simulated(spec, &sim);

    let response = driver.call("get_mode", CallArgs::new()).expect("dispatch");
    assert_eq!(response, Some(Value::Str("on".into())));
    assert_eq!(sim.last_command().as_deref(), Some("MODE? 1"));
}

#[test]
fn trailing_default_fills_and_positional_overrides() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_mode", "MODE?")
                .arg(Arg::new("a"))
                .arg(Arg::new("b").with_default("second_arg_default"))
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::new());
    let (_spec, driver) = connect_simulated(spec, &sim);

    assert!(matches!(
        driver.call("get_mode", CallArgs::new()),
        Err(ScpiError::ArgumentBinding(_))
    ));

    driver
        .call("get_mode", CallArgs::new().arg("first_arg"))
        .expect("dispatch");
    assert_eq!(
        sim.last_command().as_deref(),
        Some("MODE? first_arg second_arg_default")
    );

    driver
        .call("get_mode", CallArgs::new().arg("first_arg").arg("second_arg"))
        .expect("dispatch");
    assert_eq!(
        sim.last_command().as_deref(),
        Some("MODE? first_arg second_arg")
    );

    assert!(matches!(
        driver.call("get_mode", CallArgs::new().arg(1).arg(2).arg(3)),
        Err(ScpiError::ArgumentBinding(_))
    ));
}

#[test]
fn keyword_arguments_bind_by_name() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_mode", "MODE?")
                .arg(Arg::new("a"))
                .arg(Arg::new("b").with_default("second_arg_default"))
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::new());
    let (_spec, driver) = connect_simulated(spec, &sim);

    driver
        .call("get_mode", CallArgs::new().kwarg("a", "first_arg"))
        .expect("dispatch");
    assert_eq!(
        sim.last_command().as_deref(),
        Some("MODE? first_arg second_arg_default")
    );

    driver
        .call(
            "get_mode",
            CallArgs::new().arg("first_arg").kwarg("b", "second_arg"),
        )
        .expect("dispatch");
    assert_eq!(
        sim.last_command().as_deref(),
        Some("MODE? first_arg second_arg")
    );

    driver
        .call(
            "get_mode",
            CallArgs::new().kwarg("b", "second_arg").kwarg("a", "first_arg"),
        )
        .expect("dispatch");
    assert_eq!(
        sim.last_command().as_deref(),
        Some("MODE? first_arg second_arg")
    );

    assert!(matches!(
        driver.call(
            "get_mode",
            CallArgs::new()
                .kwarg("a", "x")
                .kwarg("b", "y")
                .kwarg("c", "something else")
        ),
        Err(ScpiError::ArgumentBinding(_))
    ));
}

#[test]
fn default_before_required_argument_is_rejected_at_registration() {
    let result = CommandSpec::builder("get_mode", "MODE?")
        .arg(Arg::new("b").with_default("second_arg_default"))
        .arg(Arg::new("a"))
        .build();
    assert!(matches!(result, Err(ScpiError::InvalidSpecification(_))));
}

#[test]
fn argument_validator_formats_the_wire_value() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_mode", "MODE?")
                .arg(Arg::new("a").with_validator(|value| {
                    value
                        .as_f64()
                        .map(|v| format!("{v:.1}"))
                        .ok_or_else(|| ScpiError::Validation("expected a number".into()))
                }))
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::new());
    let (_spec, driver) = connect_simulated(spec, &sim);

    driver
        .call("get_mode", CallArgs::new().kwarg("a", 1.123))
        .expect("dispatch");
    assert_eq!(sim.last_command().as_deref(), Some("MODE? 1.1"));

    assert!(matches!(
        driver.call("get_mode", CallArgs::new().arg("fast")),
        Err(ScpiError::Validation(_))
    ));
}

#[test]
fn fire_and_forget_commands_do_not_read() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("calibrate", "CAL")
                .no_reply()
                .build()
                .expect("valid"),
        )
        .command(
            CommandSpec::builder("get_identity", "*IDN?")
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::new());
    let (_spec, driver) = connect_simulated(spec, &sim);

    sim.push_response("queued");
    let response = driver.call("calibrate", CallArgs::new()).expect("dispatch");
    assert_eq!(response, None);
    assert_eq!(sim.last_command().as_deref(), Some("CAL"));

    // The scripted response was not consumed by the write-only command.
    assert_eq!(
        driver
            .call("get_identity", CallArgs::new())
            .expect("dispatch"),
        Some(Value::Str("queued".into()))
    );
}

#[test]
fn same_identity_shares_one_session_and_different_identity_does_not() {
    let spec = Arc::new(identity_spec());
    let factory_calls = Arc::new(AtomicUsize::new(0));
    let calls = factory_calls.clone();
    spec.register_simulator(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockSession::new())
    });

    let pool = SessionPool::new();
    let first = ScpiDriver::connect(spec.clone(), &pool, DriverConfig::simulated("bench-a"))
        .expect("first connects");
    let second = ScpiDriver::connect(spec.clone(), &pool, DriverConfig::simulated("bench-a"))
        .expect("second connects");

    assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.len(), 1);

    let third = ScpiDriver::connect(spec, &pool, DriverConfig::simulated("bench-b"))
        .expect("third connects");
    assert_eq!(factory_calls.load(Ordering::SeqCst), 2);
    assert_eq!(pool.len(), 2);

    drop((first, second, third));
}

#[test]
fn close_empties_the_pool_and_invalidates_siblings() {
    let sim = Arc::new(MockSession::with_response("Test device"));
    let spec = Arc::new(identity_spec());
    let shared = sim.clone();
    spec.register_simulator(move || shared.clone());

    let pool = SessionPool::new();
    let first = ScpiDriver::connect(spec.clone(), &pool, DriverConfig::simulated("bench"))
        .expect("first connects");
    let second = ScpiDriver::connect(spec.clone(), &pool, DriverConfig::simulated("bench"))
        .expect("second connects");

    first.close().expect("close succeeds");
    assert!(pool.is_empty());

    // The sibling's session is gone; its calls surface the closed fault.
    assert!(matches!(
        second.call("get_identity", CallArgs::new()),
        Err(ScpiError::SessionClosed)
    ));

    // The identity key is reusable with a fresh session.
    let fresh = Arc::new(MockSession::with_response("Test device"));
    let replacement = fresh.clone();
    spec.register_simulator(move || replacement.clone());
    let revived = ScpiDriver::connect(spec, &pool, DriverConfig::simulated("bench"))
        .expect("key is reusable after close");
    assert_eq!(
        revived
            .call("get_identity", CallArgs::new())
            .expect("dispatch"),
        Some(Value::Str("Test device".into()))
    );
}

#[test]
fn failures_flush_the_session_exactly_once_more_than_success() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_identity", "*IDN?")
                .response_validator(|raw| {
                    if raw == "bad" {
                        Err(ScpiError::Validation("rejected".into()))
                    } else {
                        Ok(())
                    }
                })
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::with_response("fine"));
    let (_spec, driver) = connect_simulated(spec, &sim);

    // A successful dispatch flushes once, before the command.
    let before = sim.flush_count();
    driver
        .call("get_identity", CallArgs::new())
        .expect("dispatch");
    assert_eq!(sim.flush_count() - before, 1);

    // A failing dispatch adds the recovery flush.
    sim.push_response("bad");
    let before = sim.flush_count();
    let err = driver.call("get_identity", CallArgs::new());
    assert!(matches!(err, Err(ScpiError::Validation(_))));
    assert_eq!(sim.flush_count() - before, 2);

    // A transport fault takes the same recovery path, error unchanged.
    sim.push_fault("wire chewed");
    let before = sim.flush_count();
    match driver.call("get_identity", CallArgs::new()) {
        Err(ScpiError::Transport(message)) => assert_eq!(message, "wire chewed"),
        other => panic!("expected Transport error, got {other:?}"),
    }
    assert_eq!(sim.flush_count() - before, 2);
}

#[test]
fn unknown_command_is_rejected() {
    let sim = Arc::new(MockSession::new());
    let (_spec, driver) = connect_simulated(identity_spec(), &sim);

    assert!(matches!(
        driver.call("get_nonsense", CallArgs::new()),
        Err(ScpiError::UnknownCommand(_))
    ));
}

#[tokio::test]
async fn asynchronous_dispatch_returns_the_executor_result() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_version", "*VER?")
                .parser(parsers::int)
                .asynchronous()
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::with_response("123"));
    let (_spec, driver) = connect_simulated(spec, &sim);

    let response = driver
        .call_async("get_version", CallArgs::new())
        .await
        .expect("async dispatch");
    assert_eq!(response, Some(Value::Int(123)));
    assert_eq!(sim.last_command().as_deref(), Some("*VER?"));

    // Errors propagate through the awaitable unchanged.
    sim.push_fault("no carrier");
    match driver.call_async("get_version", CallArgs::new()).await {
        Err(ScpiError::Transport(message)) => assert_eq!(message, "no carrier"),
        other => panic!("expected Transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_async_calls_serialize_on_the_device_lock() {
    let spec = DriverSpec::builder("TestDriver")
        .command(
            CommandSpec::builder("get_identity", "*IDN?")
                .asynchronous()
                .build()
                .expect("valid"),
        )
        .build()
        .expect("valid spec");
    let sim = Arc::new(MockSession::with_response("Test device"));
    let (_spec, driver) = connect_simulated(spec, &sim);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let driver = driver.clone();
        handles.push(tokio::spawn(async move {
            driver.call_async("get_identity", CallArgs::new()).await
        }));
    }
    for handle in handles {
        let response = handle.await.expect("task").expect("dispatch");
        assert_eq!(response, Some(Value::Str("Test device".into())));
    }
    assert_eq!(sim.sent().len(), 8);
}
