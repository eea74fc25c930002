//! camcast: USB camera to WebSocket JPEG stream

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camcast::capture::V4l2Camera;
use camcast::pipeline::{DefaultTransform, StreamSettings, Streamer, TransformConfig};
use camcast::publish::BroadcastPublisher;
use camcast::web::{self, WebState};
use camcast::{utils, CaptureDevice, Config, DeviceId};

#[derive(Parser)]
#[command(name = "camcast", version, about = "Stream a USB camera to browsers over WebSocket")]
struct Cli {
    /// TOML configuration file; CAMCAST_<SECTION>__<KEY> variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for camcast (RUST_LOG wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture, transform and serve frames until Ctrl-C
    Stream(StreamArgs),
    /// Print what the camera reports and exit
    Info {
        /// Device index or path
        #[arg(short, long)]
        device: Option<DeviceId>,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
struct StreamArgs {
    /// Device index or path
    #[arg(short, long)]
    device: Option<DeviceId>,
    /// Requested capture width
    #[arg(long)]
    width: Option<u32>,
    /// Requested capture height
    #[arg(long)]
    height: Option<u32>,
    /// Requested capture frame rate
    #[arg(long)]
    fps: Option<u32>,
    /// Publish rate, defaults to the capture frame rate
    #[arg(long)]
    stream_fps: Option<u32>,
    /// JPEG quality 0-100
    #[arg(short, long)]
    quality: Option<u8>,
    #[arg(long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Output size as WIDTHxHEIGHT
    #[arg(long)]
    stream_resolution: Option<camcast::Resolution>,
    #[arg(long)]
    grayscale: bool,
    /// Skip frames that barely differ from the last published one
    #[arg(long)]
    motion_detection: bool,
    /// Fraction of changed pixels that counts as motion
    #[arg(long)]
    motion_threshold: Option<f64>,
    /// Consecutive skips before a frame is forced through
    #[arg(long)]
    motion_max_skip: Option<u32>,
    /// Static UI served at /
    #[arg(long)]
    ui_dir: Option<PathBuf>,
    /// Start without warming up and caching a first frame
    #[arg(long)]
    no_preload: bool,
}

impl StreamArgs {
    /// Flags given on the command line win over file and environment
    fn apply(self, config: &mut Config) {
        let device = &mut config.device;
        if let Some(id) = self.device {
            device.id = id;
        }
        if let Some(width) = self.width {
            device.width = width;
        }
        if let Some(height) = self.height {
            device.height = height;
        }
        if let Some(fps) = self.fps {
            device.fps = fps;
        }

        let stream = &mut config.stream;
        if self.stream_fps.is_some() {
            stream.fps = self.stream_fps;
        }
        if let Some(quality) = self.quality {
            stream.quality = quality;
        }
        if self.stream_resolution.is_some() {
            stream.resolution = self.stream_resolution;
        }
        stream.grayscale |= self.grayscale;
        stream.motion_detection |= self.motion_detection;
        if let Some(threshold) = self.motion_threshold {
            stream.motion_threshold = threshold;
        }
        if let Some(max_skip) = self.motion_max_skip {
            stream.motion_max_skip = max_skip;
        }
        if self.no_preload {
            stream.preload = false;
        }

        let server = &mut config.server;
        if let Some(host) = self.host {
            server.host = host;
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if self.ui_dir.is_some() {
            server.ui_dir = self.ui_dir;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "camcast=debug" } else { "camcast=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let mut config = Config::load(cli.config.as_deref()).wrap_err("Failed to load configuration")?;

    match cli.command {
        Command::Stream(args) => {
            args.apply(&mut config);
            config.validate()?;
            stream(config).await
        }
        Command::Info { device } => {
            if let Some(id) = device {
                config.device.id = id;
            }
            camera_info(config)
        }
        Command::Devices => {
            list_devices();
            Ok(())
        }
    }
}

async fn stream(config: Config) -> Result<()> {
    info!("camcast launching...");
    info!("Using capture device: {}", config.device.id);

    let publisher = Arc::new(BroadcastPublisher::new(config.server.channel_capacity));
    let streamer = Streamer::new(
        V4l2Camera::new(config.device.clone()),
        DefaultTransform::new(TransformConfig::from(&config.stream)),
        Arc::clone(&publisher),
        StreamSettings::from_config(&config),
    );
    let status = Arc::clone(streamer.status());

    // Opening the device and the warm-up reads block
    let mut streamer = tokio::task::spawn_blocking(move || {
        let mut streamer = streamer;
        streamer.start().map(|()| streamer)
    })
    .await?
    .wrap_err("Failed to start streaming")?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {}", addr))?;

    let app = web::router(
        WebState::new(publisher, status),
        config.server.ui_dir.as_deref(),
    );
    let served = web::serve(listener, app, shutdown_signal()).await;

    tokio::task::spawn_blocking(move || streamer.close_device()).await?;
    info!("camcast stopped");

    served.wrap_err("Web server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

fn camera_info(config: Config) -> Result<()> {
    let mut camera = V4l2Camera::new(config.device);
    camera.open()?;
    let info = camera.info();
    camera.close();

    println!("===== Camera Information =====");
    for (key, value) in info? {
        println!("{}: {}", key, value);
    }
    Ok(())
}

fn list_devices() {
    let devices = utils::scan_devices();
    if devices.is_empty() {
        println!("No capture devices found");
        return;
    }

    for device in devices {
        let marker = if device.is_supported() { "" } else { "  (no supported format)" };
        println!(
            "{}  {} [{}]  {}{}",
            device.path.display(),
            device.card,
            device.driver,
            device.formats.join(", "),
            marker
        );
    }
}
