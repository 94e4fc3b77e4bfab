use crate::infra::audit::{AuditEventType, AuditLogger, AuditTrail};
use crate::protocol::{parse_command, StationCommand, StationReply, StatusMsg};
use crate::runtime::config::{Args, ConfigError, RuntimeConfig};
use crate::runtime::devices::{build_motor, open_channel, MotorSetupError, StationChannel};
use crate::runtime::logging::init_tracing;
use crate::runtime::pulse::PulseThread;
use crate::runtime::telemetry::{self, TelemetrySnapshot, ThermistorInput};
use arc_swap::ArcSwap;
use clap::Parser;
use crossbeam_channel::{select, Receiver, Sender};
use serde_json::json;
use sono_core::{
    resolve_preset, ActuationController, AmplifierLink, ControlError, Direction, MotionError,
    SessionOutcome, SessionReport, TelemetryMonitor, Thermistor, TimeBase, TrendBuffer,
};
use sono_io::metrics::{COMMANDS_REJECTED, SESSIONS_STARTED};
use sono_io::IioAdcChannel;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum StationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("device setup failed: {0}")]
    Device(#[from] io::Error),
    #[error("cannot open audit log: {0}")]
    Audit(#[source] io::Error),
    #[error("motor setup failed: {0}")]
    Motor(#[from] MotorSetupError),
    #[error(transparent)]
    Control(#[from] ControlError),
}

type Controller = ActuationController<StationChannel>;

/// Cadence for reaping finished sessions and reacting to link loss.
const SUPERVISE_PERIOD: Duration = Duration::from_millis(20);

/// A blocking move finished on its own thread.
struct MoveDone {
    command: StationCommand,
    result: Result<u64, MotionError>,
}

pub fn run_from_args() -> ExitCode {
    let args = Args::parse();
    let json_logs = args.json_logs;
    let config = match RuntimeConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(json_logs);
            error!(error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.json_logs);
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "station failed");
            ExitCode::FAILURE
        }
    }
}

struct Station {
    controller: Controller,
    snapshot: Arc<ArcSwap<TelemetrySnapshot>>,
    trend: TrendBuffer,
    trend_origin_us: u64,
    pulse: Option<PulseThread>,
    moves: Sender<MoveDone>,
    audit: AuditTrail,
    timebase: TimeBase,
    status_stream: bool,
    lost_events_seen: u64,
    pulses_reported: u64,
}

pub fn run(config: RuntimeConfig) -> Result<(), StationError> {
    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let timebase = TimeBase::new();
    let station_cfg = &config.station;

    let audit_logger = config
        .audit_path
        .as_deref()
        .map(AuditLogger::new)
        .transpose()
        .map_err(StationError::Audit)?;
    let audit = AuditTrail::new(audit_logger, timebase);

    let channel = open_channel(station_cfg, config.simulate)?;
    let link = Arc::new(AmplifierLink::new(channel, &station_cfg.link_config()));
    let motor = build_motor(station_cfg.motor.as_ref(), config.simulate)?;

    let mut controller = Controller::new(Arc::clone(&link), station_cfg.actuation_config());
    if let Some(motor) = motor {
        controller = controller.with_motor(motor);
    }
    controller.set_mode(station_cfg.actuation.mode);
    let initial_voltage = resolve_preset(&station_cfg.actuation.initial_preset)
        .map_err(ControlError::from)?;
    controller.set_target_voltage(initial_voltage)?;

    audit.record(
        AuditEventType::SystemStart,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "simulate": config.simulate,
            "port": station_cfg.serial.port,
            "mode": station_cfg.actuation.mode,
            "initial_preset": station_cfg.actuation.initial_preset,
            "metrics_enabled": config.metrics_addr.is_some(),
        }),
    );

    let snapshot = Arc::new(ArcSwap::from_pointee(TelemetrySnapshot::default()));
    let thermistor = station_cfg
        .telemetry
        .thermistor_raw_path
        .as_ref()
        .map(|path| ThermistorInput {
            adc: Box::new(IioAdcChannel::new(path, station_cfg.telemetry.adc_max)),
            model: Thermistor::default(),
        });
    let (poller_stop, poller_shutdown) = crossbeam_channel::bounded::<()>(1);
    let poller = telemetry::start_poller(
        Arc::clone(&link),
        TelemetryMonitor::new(station_cfg.actuation.failure_threshold),
        thermistor,
        Duration::from_millis(station_cfg.telemetry.poll_interval_ms),
        Arc::clone(&snapshot),
        timebase,
        poller_shutdown,
    )?;

    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    spawn_stdin_reader(command_tx)?;

    let pulse = controller
        .motor_handle()
        .map(|axis| {
            PulseThread::start(
                axis,
                Duration::from_millis(station_cfg.station.tick_ms),
                timebase,
            )
        })
        .transpose()?;
    let (moves_tx, moves_rx) = crossbeam_channel::unbounded();

    let mut station = Station {
        controller,
        snapshot,
        trend: TrendBuffer::new(station_cfg.telemetry.history_capacity),
        trend_origin_us: 0,
        pulse,
        moves: moves_tx,
        audit,
        timebase,
        status_stream: config.status_stream,
        lost_events_seen: 0,
        pulses_reported: 0,
    };

    info!(
        simulate = config.simulate,
        tick_ms = station_cfg.station.tick_ms,
        status_interval_ms = station_cfg.station.status_interval_ms,
        "station running"
    );

    station.run_scheduler(
        Duration::from_millis(station_cfg.station.status_interval_ms),
        config.run_seconds.map(Duration::from_secs),
        command_rx,
        moves_rx,
    );

    station.shutdown();
    drop(poller_stop);
    if poller.join().is_err() {
        warn!("telemetry poller panicked");
    }
    station.audit.record(
        AuditEventType::SystemShutdown,
        json!({ "uptime_s": station.timebase.elapsed().as_secs_f64() }),
    );
    info!("station stopped");
    Ok(())
}

fn spawn_stdin_reader(tx: Sender<String>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "operator input failed");
                        break;
                    }
                }
            }
            debug!("operator input closed");
        })
}

fn emit(reply: &StationReply) {
    let mut out = io::stdout().lock();
    if writeln!(out, "{}", reply.to_line())
        .and_then(|_| out.flush())
        .is_err()
    {
        debug!("stdout closed; reply dropped");
    }
}

impl Station {
    /// Operator-side loop. Link exchanges may block here; motor pulses run
    /// on their own thread.
    fn run_scheduler(
        &mut self,
        status_period: Duration,
        run_for: Option<Duration>,
        commands: Receiver<String>,
        moves: Receiver<MoveDone>,
    ) {
        let supervise_tick = crossbeam_channel::tick(SUPERVISE_PERIOD);
        let status_tick = crossbeam_channel::tick(status_period);
        let deadline = run_for
            .map(crossbeam_channel::after)
            .unwrap_or_else(crossbeam_channel::never);
        let closed_input = crossbeam_channel::never();
        let mut input_open = true;
        let exit_on_eof = run_for.is_none();

        loop {
            let input = if input_open { &commands } else { &closed_input };
            select! {
                recv(supervise_tick) -> _ => self.supervise(),
                recv(status_tick) -> _ => self.on_status_tick(),
                recv(moves) -> done => {
                    if let Ok(done) = done {
                        self.on_move_done(done);
                    }
                }
                recv(input) -> line => match line {
                    Ok(line) => {
                        if self.on_command_line(&line) {
                            break;
                        }
                    }
                    Err(_) => {
                        if exit_on_eof {
                            info!("operator input closed; shutting down");
                            break;
                        }
                        input_open = false;
                    }
                },
                recv(deadline) -> _ => {
                    info!("run duration elapsed");
                    break;
                }
            }
        }
    }

    /// React to a worker that gave up, or to the poller declaring the link lost.
    fn supervise(&mut self) {
        if let Some(result) = self.controller.service() {
            match result {
                Ok(Some(report)) => self.record_session_end(&report),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "amplifier did not confirm disable after session ended");
                    if let Some(report) = self.controller.last_report() {
                        self.record_session_end(&report);
                    }
                }
            }
        }

        let lost_events = self.snapshot.load().lost_events;
        if lost_events > self.lost_events_seen {
            self.lost_events_seen = lost_events;
            if self.controller.is_running() {
                let result = self.controller.force_stop();
                self.audit.record(
                    AuditEventType::ConnectionLost,
                    json!({ "source": "telemetry" }),
                );
                match result {
                    Ok(Some(report)) => self.record_session_end(&report),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "disable after connection loss failed"),
                }
            }
        }
    }

    fn record_session_end(&mut self, report: &SessionReport) {
        self.trend.stop_recording();
        if let SessionOutcome::ConnectionLost { failures, disabled } = report.outcome {
            sono_io::metrics::CONNECTION_LOST.inc();
            self.audit.record(
                AuditEventType::ConnectionLost,
                json!({ "source": "actuation", "failures": failures, "disabled": disabled }),
            );
        }
        self.audit.record(
            AuditEventType::SessionStopped,
            json!({
                "outcome": report.outcome,
                "elapsed_s": report.elapsed_s,
                "cycles": report.cycles,
            }),
        );
    }

    fn status(&self) -> StatusMsg {
        let snapshot = self.snapshot.load();
        StatusMsg {
            uptime_s: self.timebase.elapsed().as_secs_f64(),
            controller: self.controller.status(),
            telemetry: snapshot.reading,
            bioreactor_c: snapshot.bioreactor_c,
            trend_points: self.trend.len(),
            trend_window: self.trend.window(),
        }
    }

    fn on_status_tick(&mut self) {
        let snapshot = self.snapshot.load_full();
        if let Some(celsius) = snapshot.trend_celsius() {
            let t_s = self.timebase.now_us().saturating_sub(self.trend_origin_us) as f64 / 1e6;
            self.trend.add_point(t_s, celsius);
        }
        let status = self.status();
        telemetry::update_controller_metrics(&status.controller, &mut self.pulses_reported);
        if self.status_stream {
            emit(&StationReply::Status(status));
        }
    }

    /// Returns true when the operator asked to shut down.
    fn on_command_line(&mut self, line: &str) -> bool {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(crate::protocol::ProtocolError::Empty) => return false,
            Err(e) => {
                warn!(error = %e, "unparseable operator command");
                COMMANDS_REJECTED.inc();
                emit(&StationReply::error(None, e));
                return false;
            }
        };
        debug!(command = command.name(), "operator command");

        if command == StationCommand::Shutdown {
            emit(&StationReply::ack(&command));
            return true;
        }

        match self.execute(&command) {
            Ok(Some(reply)) => emit(&reply),
            Ok(None) => {}
            Err(e) => emit(&self.reject(&command, e)),
        }
        false
    }

    fn reject(&self, command: &StationCommand, e: impl Display) -> StationReply {
        warn!(command = command.name(), error = %e, "command rejected");
        COMMANDS_REJECTED.inc();
        self.audit.record(
            AuditEventType::CommandRejected,
            json!({ "command": command.name(), "reason": e.to_string() }),
        );
        StationReply::error(Some(command), e)
    }

    fn on_move_done(&mut self, done: MoveDone) {
        let reply = match done.result {
            Ok(steps) => StationReply::ack_with(&done.command, json!({ "steps": steps })),
            Err(e) => self.reject(&done.command, e),
        };
        emit(&reply);
    }

    /// Run a blocking rotation on its own thread; the reply follows when
    /// the move completes.
    fn spawn_rotation(
        &self,
        command: &StationCommand,
        degrees: f64,
        direction: Direction,
    ) -> Result<(), ControlError> {
        let axis = self.controller.motor_handle().ok_or(ControlError::NoMotor)?;
        if axis.is_moving() {
            return Err(MotionError::Busy.into());
        }
        let done = self.moves.clone();
        let command = command.clone();
        thread::Builder::new()
            .name("rotate".to_string())
            .spawn(move || {
                let result = axis.rotate_degrees(degrees, direction);
                if done.send(MoveDone { command, result }).is_err() {
                    debug!("rotation finished after the station stopped");
                }
            })
            .map_err(ControlError::Worker)?;
        Ok(())
    }

    /// Returns `Ok(None)` when the reply is sent later.
    fn execute(&mut self, command: &StationCommand) -> Result<Option<StationReply>, ControlError> {
        let ctl = &mut self.controller;
        match command {
            StationCommand::Start => {
                ctl.start()?;
                SESSIONS_STARTED.inc();
                self.trend.start_recording();
                self.trend_origin_us = self.timebase.now_us();
                self.audit.record(
                    AuditEventType::SessionStarted,
                    json!({ "mode": ctl.mode(), "target_voltage": ctl.target_voltage() }),
                );
                Ok(Some(StationReply::ack(command)))
            }
            StationCommand::Stop => match ctl.stop()? {
                Some(report) => {
                    self.record_session_end(&report);
                    Ok(Some(StationReply::ack_with(command, json!(report))))
                }
                None => Ok(Some(StationReply::ack(command))),
            },
            StationCommand::SetMode { mode } => {
                ctl.set_mode(*mode);
                self.audit
                    .record(AuditEventType::ModeChanged, json!({ "mode": mode }));
                Ok(Some(StationReply::ack(command)))
            }
            StationCommand::SetVoltage { volts } => {
                ctl.manual_set_voltage(*volts)?;
                Ok(Some(StationReply::ack(command)))
            }
            StationCommand::Preset { label } => {
                let preset = ctl.apply_preset(label)?;
                self.audit.record(
                    AuditEventType::PresetSelected,
                    json!({ "preset": preset.label(), "voltage": preset.voltage }),
                );
                Ok(Some(StationReply::ack_with(command, json!(preset))))
            }
            StationCommand::SetFrequency { hz } => {
                ctl.manual_set_frequency(*hz)?;
                Ok(Some(StationReply::ack(command)))
            }
            StationCommand::MotorStart { direction } => {
                ctl.start_motor(*direction)?;
                self.audit.record(
                    AuditEventType::MotorStarted,
                    json!({ "direction": direction, "rpm": ctl.motor_status().map(|m| m.rpm) }),
                );
                Ok(Some(StationReply::ack(command)))
            }
            StationCommand::MotorStop => {
                ctl.stop_motor()?;
                self.audit.record(
                    AuditEventType::MotorStopped,
                    json!({ "pulses": ctl.motor_status().map(|m| m.pulses_completed) }),
                );
                Ok(Some(StationReply::ack(command)))
            }
            StationCommand::MotorRpm { rpm } => {
                ctl.set_motor_rpm(*rpm)?;
                Ok(Some(StationReply::ack(command)))
            }
            StationCommand::MotorDirection { direction } => {
                ctl.set_motor_direction(*direction)?;
                Ok(Some(StationReply::ack(command)))
            }
            StationCommand::Rotate { degrees, direction } => {
                self.spawn_rotation(command, *degrees, *direction)?;
                Ok(None)
            }
            StationCommand::Status => Ok(Some(StationReply::Status(self.status()))),
            StationCommand::Shutdown => Ok(Some(StationReply::ack(command))),
        }
    }

    /// Session first, then the motor and its tick thread, then the pin
    /// release.
    fn shutdown(&mut self) {
        match self.controller.stop() {
            Ok(Some(report)) => self.record_session_end(&report),
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to stop actuation session"),
        }
        if self.controller.motor_status().is_some_and(|m| m.running) {
            match self.controller.stop_motor() {
                Ok(()) => self.audit.record(
                    AuditEventType::MotorStopped,
                    json!({ "reason": "shutdown" }),
                ),
                Err(e) => error!(error = %e, "failed to stop motor"),
            }
        }
        if let Some(pulse) = self.pulse.take() {
            pulse.stop();
        }
        if let Err(e) = self.controller.shutdown() {
            error!(error = %e, "failed to release motor outputs");
        }
    }
}
