use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::presence::HeuristicDetector;
use rollcall_core::{FrameSource, HeuristicConfig};
use rollcall_hw::{Camera, CaptureSettings, V4lFrameSource};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Start scanning (also retries after a camera failure)
    Start,
    /// Stop scanning and release the camera
    Stop,
    /// Run camera and presence diagnostics without the daemon
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of presence samples to take
        #[arg(short, long, default_value_t = 10)]
        frames: u32,
    },
    /// List video capture devices
    Devices,
}

#[zbus::proxy(
    interface = "org.rollcall.Kiosk1",
    default_service = "org.rollcall.Kiosk1",
    default_path = "/org/rollcall/Kiosk1"
)]
trait Kiosk {
    async fn start(&self) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

async fn connect(session_bus: bool) -> Result<KioskProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    KioskProxy::new(&conn)
        .await
        .context("rollcalld is not reachable on the bus")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn run_diagnostics(device: String, frames: u32) -> Result<()> {
    let mut source = V4lFrameSource::new(CaptureSettings {
        device,
        ..CaptureSettings::default()
    });
    source.start().map_err(|e| anyhow::anyhow!("{}\n  ({e})", e.user_message()))?;
    let detector = HeuristicDetector::new(HeuristicConfig::default());

    println!("Sampling {frames} frames from {}", source.settings().device);
    for i in 0..frames {
        let Some(frame) = source.luma_frame()? else {
            println!("  [{i}] no frame");
            continue;
        };
        let (present, stats) = detector.evaluate(&frame);
        println!(
            "  [{i}] {}x{} seq={} mean={:.1} variance={:.1} present={present}",
            frame.width, frame.height, frame.sequence, stats.mean, stats.variance
        );
        std::thread::sleep(Duration::from_millis(300));
    }

    match source.capture_frame()? {
        Some(still) => println!(
            "Still: {}x{} JPEG, {} bytes",
            still.width,
            still.height,
            still.jpeg.len()
        ),
        None => println!("Still: none"),
    }
    source.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Start => {
            let proxy = connect(cli.session_bus).await?;
            match proxy.start().await {
                Ok(status) => print_json(&status)?,
                Err(zbus::Error::MethodError(_, Some(message), _)) => {
                    anyhow::bail!("{message}\nRun `rollcall start` again to retry.")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Stop => {
            let proxy = connect(cli.session_bus).await?;
            if proxy.stop().await? {
                println!("Stopped.");
            } else {
                println!("No session was running.");
            }
        }
        Commands::Test { device, frames } => {
            tracing::debug!(device = %device, frames, "running camera diagnostics");
            tokio::task::spawn_blocking(move || run_diagnostics(device, frames)).await??;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found.");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}
