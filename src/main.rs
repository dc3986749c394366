use anyhow::{Result, bail};
use clap::Parser;
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use voxlive::audio::capture::{CpalBackend, DeviceDirection, list_devices, suppress_audio_warnings};
use voxlive::cli::{Cli, Commands};
use voxlive::config::Config;
use voxlive::session::{SessionRunner, SessionState, SessionStatus};
use voxlive::transport::live::LiveConnector;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        None => {
            let config = load_config(&cli)?;
            run_session(config, &cli).await?;
        }
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Config) => {
            let config = load_config(&cli)?;
            print!("{}", toml::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load configuration from file, env and flags, in increasing precedence.
fn load_config(cli: &Cli) -> Result<Config> {
    let config = if let Some(path) = cli.config.as_deref() {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    let config = cli.apply_overrides(config.with_env_overrides());
    config.validate()?;
    Ok(config)
}

/// List available audio input and output devices.
fn list_audio_devices() -> Result<()> {
    suppress_audio_warnings();
    let inputs = list_devices(DeviceDirection::Input)?;
    let outputs = list_devices(DeviceDirection::Output)?;

    if inputs.is_empty() && outputs.is_empty() {
        eprintln!("No audio devices found");
        std::process::exit(1);
    }

    println!("Input devices:");
    for (idx, device) in inputs.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }
    println!("Output devices:");
    for (idx, device) in outputs.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

/// Run one session until Ctrl+C, SIGTERM, `--duration`, or the session ends.
async fn run_session(config: Config, cli: &Cli) -> Result<()> {
    // Credentials first: nothing touches the audio devices without them.
    let connector = LiveConnector::from_config(&config)?;

    suppress_audio_warnings();
    let backend = CpalBackend::new(
        config.audio.input_device.clone(),
        config.audio.output_device.clone(),
    );

    let (runner, handle) = SessionRunner::new(config, Arc::new(backend), Arc::new(connector));
    let task = tokio::spawn(runner.run());
    let mut status = handle.subscribe();

    handle.start()?;
    if !cli.quiet {
        eprintln!("{} (Ctrl+C to stop)", "Starting voice session".bold());
    }

    let outcome = watch_session(&mut status, cli).await;

    handle.shutdown()?;
    if let Err(e) = task.await {
        eprintln!("voxlive: session task failed: {e}");
    }

    if let Some(message) = outcome {
        bail!(message);
    }
    Ok(())
}

/// Prints status changes until the session should end.
///
/// Returns the session's error message if it ended with one.
async fn watch_session(
    status: &mut watch::Receiver<SessionStatus>,
    cli: &Cli,
) -> Option<String> {
    let deadline = async {
        match cli.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut last = status.borrow().clone();
    let mut started = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if !cli.quiet {
                    eprintln!("\nStopping...");
                }
                return None;
            }
            res = wait_for_sigterm() => {
                if let Err(e) = res {
                    eprintln!("Error setting up signal handler: {}", e);
                }
                return None;
            }
            _ = &mut deadline => {
                if !cli.quiet {
                    eprintln!("Session duration reached.");
                }
                return None;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return None;
                }
                let current = status.borrow_and_update().clone();
                if !cli.quiet {
                    print_changes(&last, &current);
                }
                if current.state.is_active() {
                    started = true;
                }
                if current.state == SessionState::Idle && (started || current.error.is_some()) {
                    return current.error;
                }
                last = current;
            }
        }
    }
}

fn print_changes(last: &SessionStatus, current: &SessionStatus) {
    if current.state != last.state {
        match current.state {
            SessionState::Connecting => eprintln!("{} connecting...", "●".yellow()),
            SessionState::Connected => eprintln!(
                "{} connected, speak now ({})",
                "●".green(),
                current.language
            ),
            SessionState::Idle => eprintln!("{} session ended", "●".dimmed()),
            SessionState::Closed | SessionState::Error => {}
        }
    }
    if current.error != last.error
        && let Some(message) = &current.error
    {
        eprintln!("{} {}", "error:".red().bold(), message);
    }
    if current.assistant_speaking != last.assistant_speaking {
        if current.assistant_speaking {
            eprintln!("  {}", "assistant speaking".cyan());
        } else {
            eprintln!("  {}", "assistant idle".dimmed());
        }
    }
    if current.user_speaking && !last.user_speaking {
        eprintln!("  {}", "you're speaking".magenta());
    }
}

/// Wait for SIGTERM signal.
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    // On non-Unix, just wait forever (Ctrl+C will still work)
    std::future::pending::<()>().await;
    Ok(())
}
