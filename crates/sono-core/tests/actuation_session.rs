use sono_core::sim::{InstantDelay, SimAmplifierHandle, SimulatedAmplifier, SimulatedPin};
use sono_core::{
    ActuationConfig, ActuationController, AmplifierLink, ControlError, ControllerState, Direction,
    LinkConfig, MotionConfig, OperatingMode, PulseEngine, PulsePins, SessionOutcome,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn controller(config: ActuationConfig) -> (ActuationController<SimulatedAmplifier>, SimAmplifierHandle) {
    let amp = SimulatedAmplifier::new();
    let handle = amp.handle();
    let link = Arc::new(AmplifierLink::new(
        amp,
        &LinkConfig {
            read_timeout: Duration::from_millis(30),
            ..Default::default()
        },
    ));
    (ActuationController::new(link, config), handle)
}

fn short_cycles() -> ActuationConfig {
    ActuationConfig {
        pulse_on: Duration::from_millis(20),
        pulse_off: Duration::from_millis(20),
        assert_interval: Duration::from_millis(10),
        failure_threshold: 3,
    }
}

#[test]
fn immediate_stop_disables_exactly_once() {
    let (mut ctl, handle) = controller(short_cycles());
    ctl.set_target_voltage(25.0).unwrap();
    ctl.start().unwrap();
    let report = ctl.stop().unwrap().expect("session was running");
    assert_eq!(report.outcome, SessionOutcome::Stopped);

    let commands = handle.commands();
    assert_eq!(handle.count("DISABLE"), 1);
    assert_eq!(commands.last().map(String::as_str), Some("DISABLE"));
    assert_eq!(commands.first().map(String::as_str), Some("ENABLE"));
    assert_eq!(ctl.state(), ControllerState::Idle);
}

#[test]
fn no_voltage_command_follows_disable() {
    let (mut ctl, handle) = controller(short_cycles());
    ctl.set_target_voltage(10.0).unwrap();
    ctl.start().unwrap();
    thread::sleep(Duration::from_millis(60));
    ctl.stop().unwrap();
    thread::sleep(Duration::from_millis(40));

    let commands = handle.commands();
    let disable_at = commands
        .iter()
        .position(|c| c == "DISABLE")
        .expect("disable sent");
    assert_eq!(disable_at, commands.len() - 1);
    assert!(commands[..disable_at].iter().any(|c| c == "setVOLT10"));
}

#[test]
fn pulsed_mode_alternates_target_and_zero() {
    let (mut ctl, handle) = controller(short_cycles());
    ctl.set_mode(OperatingMode::Pulsed);
    ctl.set_target_voltage(25.0).unwrap();
    ctl.start().unwrap();
    thread::sleep(Duration::from_millis(150));
    ctl.stop().unwrap();

    let volts: Vec<String> = handle
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("setVOLT"))
        .collect();
    assert!(volts.len() >= 4, "too few voltage commands: {volts:?}");
    for (i, cmd) in volts.iter().enumerate() {
        let expected = if i % 2 == 0 { "setVOLT25" } else { "setVOLT0" };
        assert_eq!(cmd, expected);
    }
    assert_eq!(ctl.link().last_commanded_voltage(), 25.0);
}

#[test]
fn target_change_is_picked_up_by_running_session() {
    let (mut ctl, handle) = controller(short_cycles());
    ctl.set_target_voltage(10.0).unwrap();
    ctl.start().unwrap();
    thread::sleep(Duration::from_millis(40));
    ctl.apply_preset("30 kPa").unwrap();
    thread::sleep(Duration::from_millis(60));
    ctl.stop().unwrap();
    assert!(handle.count("setVOLT75") >= 1);
}

#[test]
fn silent_amplifier_ends_session_as_connection_lost() {
    let (mut ctl, handle) = controller(short_cycles());
    ctl.set_target_voltage(10.0).unwrap();
    ctl.start().unwrap();
    handle.set_silent(true);

    let deadline = Instant::now() + Duration::from_secs(5);
    let reaped = loop {
        if let Some(result) = ctl.service() {
            break result;
        }
        assert!(Instant::now() < deadline, "worker never gave up");
        thread::sleep(Duration::from_millis(10));
    };

    // The device is still silent, so the final disable cannot be confirmed.
    assert!(matches!(reaped, Err(ControlError::Link(_))));
    let report = ctl.last_report().expect("report recorded");
    assert_eq!(
        report.outcome,
        SessionOutcome::ConnectionLost {
            failures: 3,
            disabled: false
        }
    );
    assert!(ctl.is_faulted());
    assert_eq!(ctl.state(), ControllerState::Idle);

    handle.set_silent(false);
    ctl.start().unwrap();
    assert!(!ctl.is_faulted());
    ctl.stop().unwrap();
}

#[test]
fn force_stop_marks_controller_faulted() {
    let (mut ctl, handle) = controller(short_cycles());
    ctl.start().unwrap();
    ctl.force_stop().unwrap();
    assert!(ctl.is_faulted());
    assert!(ctl.status().faulted);
    assert_eq!(handle.count("DISABLE"), 1);
}

#[test]
fn controller_drives_attached_motor_from_ticks() {
    let (pul, pul_probe) = SimulatedPin::new();
    let (dir, dir_probe) = SimulatedPin::new();
    let (ena, ena_probe) = SimulatedPin::new();
    let engine = PulseEngine::new(
        PulsePins {
            pul,
            dir,
            ena: Some(ena),
        },
        InstantDelay::default(),
        MotionConfig::new(200, 1),
    )
    .unwrap();
    let (ctl, _) = controller(short_cycles());
    let mut ctl = ctl.with_motor(Box::new(engine));

    ctl.set_motor_rpm(60.0).unwrap();
    ctl.start_motor(Direction::Clockwise).unwrap();
    assert!(dir_probe.is_high());
    assert!(!ena_probe.is_high());

    // Half-period is 2.5 ms at 60 rpm with 200 steps/rev.
    for now_us in (0..=50_000).step_by(500) {
        ctl.tick_motor(now_us).unwrap();
    }
    let status = ctl.motor_status().unwrap();
    assert!(status.running);
    assert_eq!(status.pulses_completed, 10);
    assert_eq!(pul_probe.rising_edges(), 10);

    ctl.stop_motor().unwrap();
    assert!(!ctl.motor_status().unwrap().running);
    assert!(!pul_probe.is_high());

    assert_eq!(ctl.rotate_motor(90.0, Direction::Clockwise).unwrap(), 50);
    assert_eq!(pul_probe.rising_edges(), 60);

    ctl.shutdown().unwrap();
    assert!(ena_probe.is_high());
}
