//! backcam Agent
//!
//! Records video from a front or back camera in the background while the
//! machine is otherwise idle. A local control socket accepts start, stop
//! and status requests; the same binary doubles as the client.

mod capture;
mod command;
mod config;
mod controller;
mod crash;
mod encoder;
mod liveness;
mod logging;
#[cfg(test)]
mod testing;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use capture::{create_camera_backend, DeviceAcquisition, Facing, SessionManager, StreamPreferences};
use command::CommandInterface;
use config::Config;
use controller::{create_controller_channels, CaptureController, CapturePipeline, ControllerStatus};
use encoder::{EncoderBackend, EncoderWriter, FfmpegBackend};
use liveness::{create_liveness_backend, LivenessGuard};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config = Config::load()?;

    match args.first().map(String::as_str) {
        None | Some("serve") => serve(config),
        #[cfg(unix)]
        Some("start") => {
            let facing = match args.get(1) {
                Some(arg) => Some(arg.parse::<Facing>().map_err(anyhow::Error::msg)?),
                None => None,
            };
            client(
                &config,
                command::Request::StartCapture {
                    facing,
                    output_dir: None,
                },
            )
        }
        #[cfg(unix)]
        Some("stop") => client(&config, command::Request::StopCapture),
        #[cfg(unix)]
        Some("status") => client(&config, command::Request::Status),
        Some(other) => {
            print_help();
            bail!("Unknown command: {}", other)
        }
    }
}

/// Run the capture service until Ctrl+C or a fatal socket error
fn serve(config: Config) -> Result<()> {
    let log_dir = logging::log_dir()?;
    let _log_guard = logging::init_logging(&log_dir)?;
    match crash::init_crash_handler(&log_dir) {
        Ok(path) => info!("Crash log: {:?}", path),
        Err(e) => warn!("Failed to set up crash log: {}", e),
    }

    info!("backcam Agent starting...");
    if let Ok(path) = config.config_path() {
        info!("Configuration loaded from {:?}", path);
    }

    let runtime = tokio::runtime::Runtime::new()?;

    let pipeline = build_pipeline(&config);
    let (cmd_tx, cmd_rx, status_tx, _status_rx) = create_controller_channels();
    let commands = CommandInterface::new(cmd_tx, status_tx.clone())
        .with_default_facing(config.capture.default_facing);
    let mut controller = CaptureController::new(pipeline, cmd_rx, status_tx);

    // Ctrl+C stops any recording before the controller exits
    let ctrl_c_commands = commands.clone();
    let ctrl_c_runtime = runtime.handle().clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let commands = ctrl_c_commands.clone();
        ctrl_c_runtime.spawn(async move { commands.shutdown().await });
    })?;

    runtime.block_on(async move {
        tokio::spawn(log_status_updates(commands.subscribe()));

        #[cfg(unix)]
        {
            let server = command::CommandServer::bind(&config.socket_path(), commands.clone())?;
            info!("Accepting commands on {:?}", server.path());

            tokio::select! {
                result = controller.run() => return result,
                result = server.run() => {
                    if let Err(e) = result {
                        error!("Command server failed: {:#}", e);
                    }
                }
            }

            // Finish any recording cleanly before exiting
            commands.shutdown().await;
        }

        controller.run().await
    })?;

    info!("Shutdown complete");
    Ok(())
}

fn build_pipeline(config: &Config) -> CapturePipeline {
    let camera = create_camera_backend(config.devices.facing_overrides.clone());
    let encoder = FfmpegBackend::new(config.encoder.ffmpeg_path.clone(), config.encoder.stop_timeout());
    let liveness = create_liveness_backend();

    info!(
        "Backends: camera={}, encoder={}, liveness={}",
        camera.name(),
        encoder.name(),
        liveness.name()
    );

    CapturePipeline {
        acquisition: DeviceAcquisition::new(camera, config.capture.facing_fallback),
        sessions: SessionManager::new(StreamPreferences {
            max_height: config.encoder.max_output_height,
            fps: config.encoder.fps,
        }),
        encoder: EncoderWriter::new(Box::new(encoder), config.encoder.clone()),
        liveness: LivenessGuard::new(liveness, &config.liveness),
        output_dir: config.output_directory(),
    }
}

async fn log_status_updates(mut status_rx: tokio::sync::broadcast::Receiver<ControllerStatus>) {
    loop {
        match status_rx.recv().await {
            Ok(ControllerStatus::StateChanged { state, session_id }) => {
                info!("Capture state: {} (session {:?})", state, session_id);
            }
            Ok(ControllerStatus::RecordingFinished { path, .. }) => {
                info!("Recording saved to {:?}", path);
            }
            Ok(ControllerStatus::Failed { kind, message, .. }) => {
                warn!("Recording failed ({:?}): {}", kind, message);
            }
            Err(RecvError::Lagged(n)) => warn!("Status log skipped {} updates", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Send one request to the running agent and print the reply as JSON
#[cfg(unix)]
fn client(config: &Config, request: command::Request) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let response = runtime.block_on(command::send_request(&config.socket_path(), &request))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&response).context("Failed to format response")?
    );
    if !response.ok {
        std::process::exit(1);
    }
    Ok(())
}

fn print_help() {
    println!("backcam Agent - background camera recording");
    println!();
    println!("USAGE:");
    println!("    backcam-agent [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    serve                 Run the capture service (default)");
    println!("    start [front|back]    Start recording");
    println!("    stop                  Stop recording");
    println!("    status                Print the current capture state");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help    Print this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG            Set log level (e.g., debug, info, warn)");
    println!("    BACKCAM_LOG_PATH    Override the log directory");
}
