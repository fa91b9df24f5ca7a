// Drive a simulated two-wheel robot through a scenario
//
// Usage: cargo run -- --scenario curve --distance 150
//
// The runtime runs against simulated motors built from the configured motor
// models. Ctrl+C stops the robot and waits for it to come to rest.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use drivebase_runtime::config::{DrivebaseConfig, RuntimeConfig};
use drivebase_runtime::error::Error;
use drivebase_runtime::messages::{Command, RuntimeHealth, RuntimeStatus};
use drivebase_runtime::motor::{RADIUS_INF, Stop};
use drivebase_runtime::runtime::{self, CancelToken, Runtime, RuntimeClient};
use drivebase_runtime::sim::{SimHardware, SimMotor};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Drive straight for --distance mm and brake
    Straight,
    /// Quarter circle with radius --distance mm, then hold
    Curve,
    /// Turn once in place
    Spin,
    /// Drive for --duration-ms, then brake
    Forever,
    /// Drive with the left wheel blocked until a stall is reported
    Stall,
}

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Differential drivebase on simulated motors")]
struct Args {
    /// JSON runtime config; built-in two-motor drivebase if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Scenario::Straight)]
    scenario: Scenario,

    /// Distance or radius in mm
    #[arg(short, long, default_value_t = 300)]
    distance: i32,

    /// Time limit for the forever and stall scenarios
    #[arg(long, default_value_t = 2000)]
    duration_ms: u64,

    /// Print the final status as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (RUST_LOG=drivebase_runtime=debug for per-command detail)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    let drivebase = config
        .drivebase
        .clone()
        .ok_or("config has no drivebase to drive")?;

    // Plant angles are output angles, so each simulated encoder counts
    // through the gearing
    let mut hardware = SimHardware::new();
    for motor in &config.motors {
        let counts = motor.counts_per_degree * motor.gear_ratio;
        hardware.attach(motor.port.index() as u8, SimMotor::new(motor.model, counts));
    }
    let left_wheel = hardware.motor(drivebase.left.index() as u8).cloned();

    let runtime = Runtime::from_config(&config, Box::new(hardware))?;
    let (mut client, handle) = runtime::start(runtime);

    let cancel = CancelToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, stopping");
            on_ctrl_c.cancel();
        }
    });

    info!("Running {:?} scenario", args.scenario);
    let limit = Duration::from_millis(args.duration_ms);
    match args.scenario {
        Scenario::Straight => {
            client
                .send(curve(RADIUS_INF, args.distance, Stop::Brake))
                .await?;
            report_wait(client.wait_until_idle(&cancel).await)?;
        }
        Scenario::Curve => {
            client.send(curve(args.distance, 90, Stop::Hold)).await?;
            report_wait(client.wait_until_idle(&cancel).await)?;
        }
        Scenario::Spin => {
            client.send(curve(0, 360, Stop::Coast)).await?;
            report_wait(client.wait_until_idle(&cancel).await)?;
        }
        Scenario::Forever => {
            client.send(forever(&drivebase)).await?;
            match wait_for(&mut client, &cancel, limit, |_| false).await {
                Ok(_) | Err(Error::Timeout | Error::Cancelled) => {}
                Err(e) => return Err(e.into()),
            }
            client
                .send(Command::Stop {
                    after_stop: Stop::Brake,
                })
                .await?;
            report_wait(client.wait_until_idle(&cancel).await)?;
        }
        Scenario::Stall => {
            if let Some(wheel) = &left_wheel {
                wheel.set_blocked(true);
            }
            client.send(forever(&drivebase)).await?;
            let stalled =
                wait_for(&mut client, &cancel, limit, |s| s.health == RuntimeHealth::Stalled).await;
            match stalled {
                Ok(status) => info!("Stall reported at {} ms", status.time),
                Err(Error::Timeout) => warn!("No stall within {} ms", args.duration_ms),
                Err(Error::Cancelled) => {}
                Err(e) => return Err(e.into()),
            }
            client.send(Command::StopControl).await?;
            report_wait(client.wait_until_idle(&cancel).await)?;
        }
    }

    let status = client.status();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_summary(&status);
    }

    // Dropping the last client shuts the runtime down and coasts the motors
    drop(client);
    handle.await?;
    Ok(())
}

fn curve(radius: i32, angle_or_distance: i32, after_stop: Stop) -> Command {
    Command::DriveCurve {
        radius,
        angle_or_distance,
        drive_speed: None,
        turn_rate: None,
        after_stop,
    }
}

fn forever(drivebase: &DrivebaseConfig) -> Command {
    Command::DriveForever {
        speed: drivebase.settings.drive_speed,
        turn_rate: 0,
    }
}

/// A cancelled wait still ends with the robot at rest, so it is not a failure
fn report_wait(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(Error::Cancelled) => {
            warn!("Scenario cancelled");
            Ok(())
        }
        other => other,
    }
}

/// Watch status snapshots until `done` holds, up to `limit`
async fn wait_for(
    client: &mut RuntimeClient,
    cancel: &CancelToken,
    limit: Duration,
    done: impl Fn(&RuntimeStatus) -> bool,
) -> Result<RuntimeStatus, Error> {
    tokio::time::timeout(limit, next_matching(client, cancel, done))
        .await
        .map_err(|_| Error::Timeout)?
}

async fn next_matching(
    client: &mut RuntimeClient,
    cancel: &CancelToken,
    done: impl Fn(&RuntimeStatus) -> bool,
) -> Result<RuntimeStatus, Error> {
    loop {
        let status = client.changed().await?;
        if done(&status) {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
    }
}

fn print_summary(status: &RuntimeStatus) {
    println!("Time:   {} ms", status.time);
    println!("Health: {:?}", status.health);
    if let Some(db) = &status.drivebase {
        println!(
            "Drivebase: {:?}, {} mm, {} deg, {} mm/s, {} deg/s",
            db.state, db.drive.distance, db.drive.angle, db.drive.drive_speed, db.drive.turn_rate
        );
    }
    for motor in &status.motors {
        println!(
            "  Port {}: {} deg, {} deg/s{}",
            motor.port,
            motor.angle,
            motor.speed,
            if motor.claimed { " (claimed)" } else { "" }
        );
    }
    if let Some(e) = &status.last_error {
        println!("Last error: {}", e);
    }
}
