// Fixed-rate control loop with a command queue
//
// All motor and drivebase state lives in one task. Clients queue commands on
// an mpsc channel; each tick drains the queue, updates every motor and the
// drivebase, then publishes a status snapshot on a watch channel. Waiting for
// a motion to finish is a poll loop over those snapshots.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::{LOOP_TIME_MS, NUM_MOTOR_PORTS, RuntimeConfig};
use crate::error::{Error, Result};
use crate::messages::{Command, DrivebaseStatus, MotorStatus, RuntimeHealth, RuntimeStatus};
use crate::motor::{Drivebase, Hardware, MotorRegistry, Stop};

/// Commands that may wait in the queue before senders block
const COMMAND_QUEUE_DEPTH: usize = 32;

pub struct Runtime {
    hardware: Box<dyn Hardware>,
    motors: MotorRegistry,
    drivebase: Option<Drivebase>,
    time: u32,
    commands_applied: u64,
    last_error: Option<String>,
    health: RuntimeHealth,
    stalled: [bool; NUM_MOTOR_PORTS],
}

impl Runtime {
    /// Attach every configured motor and bind the drivebase, if any
    pub fn from_config(config: &RuntimeConfig, mut hardware: Box<dyn Hardware>) -> Result<Self> {
        let mut motors = MotorRegistry::new();
        for motor in &config.motors {
            motors.attach(hardware.as_mut(), motor)?;
        }
        let drivebase = match &config.drivebase {
            Some(db) => Some(Drivebase::setup(
                &mut motors,
                db.left,
                db.right,
                db.wheel_diameter,
                db.axle_track,
                db.settings,
            )?),
            None => None,
        };

        Ok(Self {
            hardware,
            motors,
            drivebase,
            time: 0,
            commands_applied: 0,
            last_error: None,
            health: RuntimeHealth::Ok,
            stalled: [false; NUM_MOTOR_PORTS],
        })
    }

    pub fn motors(&self) -> &MotorRegistry {
        &self.motors
    }

    pub fn drivebase(&self) -> Option<&Drivebase> {
        self.drivebase.as_ref()
    }

    /// Apply one queued command, recording any rejection in the status
    pub fn on_command(&mut self, cmd: Command) -> Result<()> {
        debug!("Received command: {:?}", &cmd);
        self.commands_applied += 1;
        let result = self.dispatch(cmd);
        if let Err(e) = &result {
            warn!("Command rejected: {}", e);
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn dispatch(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::DriveCurve {
                radius,
                angle_or_distance,
                drive_speed,
                turn_rate,
                after_stop,
            } => {
                let db = self.drivebase.as_mut().ok_or(Error::NoDevice)?;
                let defaults = db.get_drive_settings();
                db.drive_curve(
                    &mut self.motors,
                    radius,
                    angle_or_distance,
                    drive_speed.unwrap_or(defaults.drive_speed),
                    turn_rate.unwrap_or(defaults.turn_rate),
                    after_stop,
                )
            }
            Command::DriveForever { speed, turn_rate } => {
                let db = self.drivebase.as_mut().ok_or(Error::NoDevice)?;
                db.drive_forever(&mut self.motors, speed, turn_rate)
            }
            Command::Stop { after_stop } => {
                let db = self.drivebase.as_mut().ok_or(Error::NoDevice)?;
                db.stop(&mut self.motors, after_stop)
            }
            Command::StopControl => {
                let db = self.drivebase.as_mut().ok_or(Error::NoDevice)?;
                db.stop_control(&mut self.motors);
                Ok(())
            }
            Command::ClaimServos { claim } => {
                let db = self.drivebase.as_mut().ok_or(Error::NoDevice)?;
                db.claim_servos(&mut self.motors, claim)
            }
            Command::SetDriveSettings { settings } => {
                let db = self.drivebase.as_mut().ok_or(Error::NoDevice)?;
                db.set_drive_settings(settings)
            }
            Command::Run { port, speed } => self.motors.get_mut(port)?.run(speed),
            Command::RunTarget {
                port,
                speed,
                target,
                after_stop,
            } => self.motors.get_mut(port)?.run_target(speed, target, after_stop),
            Command::RunAngle {
                port,
                speed,
                angle,
                after_stop,
            } => self.motors.get_mut(port)?.run_angle(speed, angle, after_stop),
            Command::ServoStop { port, after_stop } => self.motors.get_mut(port)?.stop(after_stop),
            Command::SetVoltage { port, voltage } => self.motors.get_mut(port)?.set_voltage(voltage),
            Command::ResetAngle { port, angle } => self.motors.get_mut(port)?.reset_angle(angle),
        }
    }

    /// Run one control tick at `time` (ms) and return the resulting status
    pub fn tick(&mut self, time: u32) -> RuntimeStatus {
        self.time = time;
        match self.step(time) {
            Ok(()) => {
                self.health = if self.check_stalls() {
                    RuntimeHealth::Stalled
                } else {
                    RuntimeHealth::Ok
                };
            }
            Err(e) => {
                if self.health != RuntimeHealth::Fault {
                    warn!("Control tick failed at {} ms: {}", time, e);
                }
                self.health = RuntimeHealth::Fault;
                self.last_error = Some(e.to_string());
            }
        }
        self.status()
    }

    fn step(&mut self, time: u32) -> Result<()> {
        self.hardware.poll(time)?;
        // Drivebase loops read the servos' fresh measurements
        let servos = self.motors.update(time);
        if let Some(db) = self.drivebase.as_mut() {
            db.update(&mut self.motors, time)?;
        }
        servos
    }

    /// Log stall onsets; true if any motor is stalled now
    fn check_stalls(&mut self) -> bool {
        let mut any = false;
        for (port, servo) in self.motors.iter() {
            let stalled = servo.is_stalled().is_some();
            let was = std::mem::replace(&mut self.stalled[port.index()], stalled);
            if stalled && !was {
                warn!("Motor on port {} stalled", port);
            }
            any |= stalled;
        }
        any
    }

    pub fn status(&self) -> RuntimeStatus {
        let motors = self
            .motors
            .iter()
            .map(|(port, servo)| MotorStatus {
                port,
                angle: servo.measured_angle().to_degrees(),
                speed: servo.estimated_state().speed / 1000,
                busy: servo.is_busy(),
                claimed: servo.is_claimed(),
                stalled: servo.is_stalled(),
            })
            .collect();
        let drivebase = self.drivebase.as_ref().map(|db| DrivebaseStatus {
            state: db.state(),
            busy: db.is_busy(),
            claimed: db.is_claimed(),
            drive: db.get_state_user(&self.motors).unwrap_or_default(),
        });
        RuntimeStatus {
            time: self.time,
            motors,
            drivebase,
            commands_applied: self.commands_applied,
            last_error: self.last_error.clone(),
            health: self.health,
        }
    }

    /// Release the drivebase and coast every motor
    pub fn teardown(&mut self) {
        if let Some(db) = self.drivebase.as_mut() {
            db.release(&mut self.motors);
        }
        self.drivebase = None;
        self.motors.teardown();
    }
}

/// Spawn the control loop and return a client connected to it
pub fn start(runtime: Runtime) -> (RuntimeClient, JoinHandle<Runtime>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (status_tx, status_rx) = watch::channel(runtime.status());
    let handle = tokio::spawn(run(runtime, command_rx, status_tx));
    (RuntimeClient::new(command_tx, status_rx), handle)
}

/// Control loop; returns the torn-down runtime once every sender is dropped
pub async fn run(
    mut runtime: Runtime,
    mut commands: mpsc::Receiver<Command>,
    status: watch::Sender<RuntimeStatus>,
) -> Runtime {
    let mut tick = interval(Duration::from_millis(LOOP_TIME_MS as u64));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let started = Instant::now();

    info!("Runtime started: {} ms loop", LOOP_TIME_MS);

    loop {
        tick.tick().await;
        // Wraps after about 49 days
        let time = started.elapsed().as_millis() as u32;

        // 1. Drain all pending commands (non-blocking)
        let mut closed = false;
        loop {
            match commands.try_recv() {
                Ok(cmd) => {
                    // Rejections are reported through the status
                    let _ = runtime.on_command(cmd);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            info!("All clients gone, stopping runtime");
            runtime.teardown();
            status.send_replace(runtime.status());
            return runtime;
        }

        // 2. Update motors and drivebase
        let snapshot = runtime.tick(time);

        // 3. Publish status
        status.send_replace(snapshot);
    }
}

/// Cooperative cancellation flag shared between tasks
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle for queueing commands and watching the runtime status
#[derive(Clone)]
pub struct RuntimeClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<RuntimeStatus>,
    // Commands queued through this client and its clones
    sent: Arc<AtomicU64>,
}

impl RuntimeClient {
    fn new(commands: mpsc::Sender<Command>, status: watch::Receiver<RuntimeStatus>) -> Self {
        Self {
            commands,
            status,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a command for the next tick
    pub async fn send(&self, cmd: Command) -> Result<()> {
        // Count first so a concurrent poll never sees the command as applied early
        self.sent.fetch_add(1, Ordering::SeqCst);
        if self.commands.send(cmd).await.is_err() {
            self.sent.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Io);
        }
        Ok(())
    }

    /// Latest published status
    pub fn status(&self) -> RuntimeStatus {
        self.status.borrow().clone()
    }

    /// Wait for the next status snapshot
    pub async fn changed(&mut self) -> Result<RuntimeStatus> {
        self.status.changed().await.map_err(|_| Error::Io)?;
        Ok(self.status.borrow_and_update().clone())
    }

    /// `Again` while queued commands are pending or anything is still moving
    pub fn poll_idle(&self) -> Result<()> {
        let status = self.status.borrow();
        if status.commands_applied < self.sent.load(Ordering::SeqCst) || status.is_busy() {
            return Err(Error::Again);
        }
        Ok(())
    }

    /// Poll until all motion has finished
    ///
    /// If `cancel` fires, every moving drivebase and servo is told to stop
    /// and coast, and the wait continues until they have. The result is then
    /// `Cancelled`.
    pub async fn wait_until_idle(&mut self, cancel: &CancelToken) -> Result<()> {
        let mut stopping = false;
        loop {
            if cancel.is_cancelled() && !stopping {
                stopping = true;
                info!("Wait cancelled, stopping motion");
                self.stop_all().await?;
            }
            match self.poll_idle() {
                Ok(()) if stopping => return Err(Error::Cancelled),
                Ok(()) => return Ok(()),
                Err(Error::Again) => {}
                Err(e) => return Err(e),
            }
            self.status.changed().await.map_err(|_| Error::Io)?;
        }
    }

    async fn stop_all(&self) -> Result<()> {
        let status = self.status();
        if status.drivebase.is_some_and(|db| db.busy) {
            self.send(Command::Stop {
                after_stop: Stop::Coast,
            })
            .await?;
        }
        for motor in status.motors.iter().filter(|m| m.busy && !m.claimed) {
            self.send(Command::ServoStop {
                port: motor.port,
                after_stop: Stop::Coast,
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MODEL_MEDIUM_MOTOR, MotorConfig};
    use crate::motor::{Actuation, Direction, DrivebaseState, Fix16, Port, RADIUS_INF};
    use crate::sim::{SimHardware, SimMotor};

    fn sim_runtime(config: &RuntimeConfig) -> (Runtime, Vec<SimMotor>) {
        let mut hardware = SimHardware::new();
        let mut sims = Vec::new();
        for motor in &config.motors {
            let sim = SimMotor::new(MODEL_MEDIUM_MOTOR, Fix16::ONE);
            hardware.attach(motor.port.index() as u8, sim.clone());
            sims.push(sim);
        }
        let runtime = Runtime::from_config(config, Box::new(hardware)).unwrap();
        (runtime, sims)
    }

    /// Tick from `start` until idle; returns the time it got there
    fn run_until_idle(runtime: &mut Runtime, start: u32, limit: u32) -> u32 {
        let mut time = start;
        while time < start + limit {
            time += LOOP_TIME_MS;
            if !runtime.tick(time).is_busy() {
                return time;
            }
        }
        panic!("still busy after {} ms", limit);
    }

    #[test]
    fn test_drive_straight_through_commands() {
        let (mut runtime, sims) = sim_runtime(&RuntimeConfig::default());
        runtime.tick(0);
        runtime
            .on_command(Command::DriveCurve {
                radius: RADIUS_INF,
                angle_or_distance: 200,
                drive_speed: None,
                turn_rate: None,
                after_stop: Stop::Brake,
            })
            .unwrap();
        assert!(runtime.status().is_busy());

        run_until_idle(&mut runtime, 0, 5000);
        let status = runtime.status();
        let drive = status.drivebase.unwrap().drive;
        assert!((195..=205).contains(&drive.distance), "{:?}", drive);
        assert_eq!(status.health, RuntimeHealth::Ok);
        assert_eq!(status.commands_applied, 1);
        assert_eq!(sims[0].actuation(), Actuation::Brake);
        // Left motor is mounted mirrored
        assert!(sims[0].angle().to_mdeg() < 0 && sims[1].angle().to_mdeg() > 0);
    }

    #[test]
    fn test_rejected_commands_reported() {
        let (mut runtime, _sims) = sim_runtime(&RuntimeConfig::default());
        runtime.tick(0);
        runtime
            .on_command(Command::DriveForever {
                speed: 100,
                turn_rate: 0,
            })
            .unwrap();
        runtime.tick(LOOP_TIME_MS);

        // Wheels belong to the drivebase now
        let result = runtime.on_command(Command::Run {
            port: Port::A,
            speed: 100,
        });
        assert_eq!(result, Err(Error::Busy));
        let result = runtime.on_command(Command::SetVoltage {
            port: Port::C,
            voltage: 100,
        });
        assert_eq!(result, Err(Error::NoDevice));

        let status = runtime.tick(2 * LOOP_TIME_MS);
        assert_eq!(status.commands_applied, 3);
        assert_eq!(status.last_error.as_deref(), Some("No device connected"));
        assert_eq!(
            status.drivebase.map(|db| db.state),
            Some(DrivebaseState::ContinuousMove)
        );
    }

    #[test]
    fn test_claim_servos_through_commands() {
        let (mut runtime, _sims) = sim_runtime(&RuntimeConfig::default());
        runtime.tick(0);

        runtime
            .on_command(Command::ClaimServos { claim: true })
            .unwrap();
        let status = runtime.tick(LOOP_TIME_MS);
        let db = status.drivebase.unwrap();
        assert!(db.claimed && !db.busy);
        assert!(status.motors.iter().all(|m| m.claimed));
        for port in [Port::A, Port::B] {
            let result = runtime.on_command(Command::ResetAngle { port, angle: 0 });
            assert_eq!(result, Err(Error::Busy));
        }

        runtime
            .on_command(Command::ClaimServos { claim: false })
            .unwrap();
        runtime
            .on_command(Command::ResetAngle {
                port: Port::A,
                angle: 45,
            })
            .unwrap();
        let status = runtime.tick(2 * LOOP_TIME_MS);
        assert!(!status.drivebase.unwrap().claimed);
        assert_eq!(status.motor(Port::A).map(|m| m.angle), Some(45));
    }

    #[test]
    fn test_zero_model_divisor_fails_setup() {
        let mut config = RuntimeConfig::default();
        config.motors[0].model.d_angle_d_speed = 0;
        let mut hardware = SimHardware::new();
        for motor in &config.motors {
            hardware.attach(
                motor.port.index() as u8,
                SimMotor::new(MODEL_MEDIUM_MOTOR, Fix16::ONE),
            );
        }
        assert!(matches!(
            Runtime::from_config(&config, Box::new(hardware)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_servo_commands_without_drivebase() {
        let config = RuntimeConfig {
            motors: vec![MotorConfig::new(Port::C, Direction::Clockwise)],
            drivebase: None,
        };
        let (mut runtime, sims) = sim_runtime(&config);
        runtime.tick(0);

        assert_eq!(
            runtime.on_command(Command::StopControl),
            Err(Error::NoDevice)
        );
        runtime
            .on_command(Command::RunTarget {
                port: Port::C,
                speed: 500,
                target: 180,
                after_stop: Stop::Hold,
            })
            .unwrap();
        run_until_idle(&mut runtime, 0, 3000);

        let motor = *runtime.status().motor(Port::C).unwrap();
        assert!((175..=185).contains(&motor.angle), "{:?}", motor);
        assert!((175_000..=185_000).contains(&sims[0].angle().to_mdeg()));
        assert!(!motor.busy);
    }

    #[test]
    fn test_stall_sets_health() {
        let config = RuntimeConfig {
            motors: vec![MotorConfig::new(Port::A, Direction::Clockwise)],
            drivebase: None,
        };
        let (mut runtime, sims) = sim_runtime(&config);
        sims[0].set_blocked(true);
        runtime.tick(0);
        runtime
            .on_command(Command::SetVoltage {
                port: Port::A,
                voltage: 6000,
            })
            .unwrap();

        let mut time = 0;
        let mut status = runtime.status();
        while status.health == RuntimeHealth::Ok && time < 2000 {
            time += LOOP_TIME_MS;
            status = runtime.tick(time);
        }
        assert_eq!(status.health, RuntimeHealth::Stalled);
        assert!(status.motor(Port::A).unwrap().stalled.is_some());
    }

    #[test]
    fn test_teardown_coasts_and_releases() {
        let (mut runtime, sims) = sim_runtime(&RuntimeConfig::default());
        runtime.tick(0);
        runtime
            .on_command(Command::DriveForever {
                speed: 100,
                turn_rate: 30,
            })
            .unwrap();
        runtime.tick(LOOP_TIME_MS);
        runtime.tick(2 * LOOP_TIME_MS);
        runtime.teardown();

        assert!(runtime.drivebase().is_none());
        assert_eq!(runtime.motors().iter().count(), 0);
        for sim in &sims {
            assert_eq!(sim.actuation(), Actuation::Coast);
        }
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_client_waits_for_move() {
        let config = RuntimeConfig {
            motors: vec![MotorConfig::new(Port::B, Direction::Clockwise)],
            drivebase: None,
        };
        let (runtime, _sims) = sim_runtime(&config);
        let (mut client, handle) = start(runtime);

        client
            .send(Command::RunAngle {
                port: Port::B,
                speed: 720,
                angle: 90,
                after_stop: Stop::Coast,
            })
            .await
            .unwrap();
        // The command may not be applied yet, but the poll must not say idle
        assert_eq!(client.poll_idle(), Err(Error::Again));
        client.wait_until_idle(&CancelToken::new()).await.unwrap();

        let motor = *client.status().motor(Port::B).unwrap();
        assert!((85..=95).contains(&motor.angle), "{:?}", motor);

        drop(client);
        let runtime = handle.await.unwrap();
        assert!(!runtime.motors().is_attached(Port::B));
    }

    #[tokio::test]
    async fn test_client_claim_applied_on_tick() {
        let (runtime, _sims) = sim_runtime(&RuntimeConfig::default());
        let (mut client, handle) = start(runtime);

        client
            .send(Command::ClaimServos { claim: true })
            .await
            .unwrap();
        let mut status = client.changed().await.unwrap();
        while status.commands_applied < 1 {
            status = client.changed().await.unwrap();
        }
        assert!(status.drivebase.unwrap().claimed);
        assert!(status.last_error.is_none());
        // Claimed but idle, so there is nothing to wait for
        client.wait_until_idle(&CancelToken::new()).await.unwrap();

        drop(client);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_drains_to_stop() {
        let (runtime, sims) = sim_runtime(&RuntimeConfig::default());
        let (mut client, handle) = start(runtime);

        client
            .send(Command::DriveForever {
                speed: 150,
                turn_rate: 0,
            })
            .await
            .unwrap();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let result = client.wait_until_idle(&cancel).await;
        assert_eq!(result, Err(Error::Cancelled));
        let status = client.status();
        assert!(!status.is_busy());
        assert_eq!(
            status.drivebase.map(|db| db.state),
            Some(DrivebaseState::Idle)
        );
        for sim in &sims {
            assert_eq!(sim.actuation(), Actuation::Coast);
        }

        drop(client);
        handle.await.unwrap();
    }
}
