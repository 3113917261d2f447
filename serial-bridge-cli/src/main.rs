use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result, bail};
use serial_bridge::{
    BridgeCommand, BridgeConfig, BridgeStatus, BridgeSupervisor, CancellationToken,
    LifecycleEvent, Profile, SupervisorSettings, TracingLogSink, find_profile, load_profiles,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{info, warn};

mod log;
mod signals;

use log::{Level, LogFormat};
use signals::SignalHandler;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(long, global = true, value_enum, default_value_t = Level::default())]
    log_level: Level,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::default())]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct BridgeArgs {
    /// Serial device to forward
    #[arg(long, short)]
    device: PathBuf,

    /// TCP port to listen on, overriding the profile
    #[arg(long, short)]
    port: Option<u16>,

    /// TCP host to bind, overriding the profile
    #[arg(long)]
    host: Option<String>,

    /// Profile name; defaults to the profile marked as default
    #[arg(long, requires = "profiles")]
    profile: Option<String>,

    /// Profiles file (JSON array)
    #[arg(long, env = "SERIAL_BRIDGE_PROFILES")]
    profiles: Option<PathBuf>,

    /// Bridge executable
    #[arg(long, default_value = "socat", env = "SERIAL_BRIDGE_SOCAT")]
    socat: PathBuf,
}

impl BridgeArgs {
    /// Selected profile (if a profiles file was given) with the overrides
    /// applied to its configuration.
    fn resolve(&self) -> Result<Option<Profile>> {
        let Some(path) = &self.profiles else {
            return Ok(None);
        };
        let profiles = load_profiles(path)?;
        let mut profile = find_profile(&profiles, self.profile.as_deref())?.clone();
        self.apply_overrides(&mut profile.configuration);
        Ok(Some(profile))
    }

    fn config(&self) -> Result<BridgeConfig> {
        match self.resolve()? {
            Some(profile) => Ok(profile.configuration),
            None => {
                let mut config = BridgeConfig::default();
                self.apply_overrides(&mut config);
                Ok(config)
            }
        }
    }

    fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(port) = self.port {
            config.tcp_port = port;
        }
        if let Some(host) = &self.host {
            config.tcp_host = host.clone();
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run one bridge in the foreground until interrupted
    Run {
        #[command(flatten)]
        bridge: BridgeArgs,

        /// Seconds the bridge gets to exit after SIGTERM
        #[arg(long, default_value_t = 5)]
        grace: u64,

        /// Refuse ports that other programs already listen on
        #[arg(long)]
        probe_port: bool,
    },
    /// Print the bridge command line without running it
    Command {
        #[command(flatten)]
        bridge: BridgeArgs,
    },
    /// List the profiles in a profiles file
    Profiles {
        #[arg(long, env = "SERIAL_BRIDGE_PROFILES")]
        profiles: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init_tracing(cli.log_level, cli.log_format);

    match cli.command {
        Command::Run {
            bridge,
            grace,
            probe_port,
        } => run(&bridge, Duration::from_secs(grace), probe_port, cli.log_format).await,
        Command::Command { bridge } => {
            let config = bridge.config()?;
            let command = BridgeCommand::new(&bridge.socat, &config, &bridge.device);
            println!("{}", command.render());
            Ok(())
        }
        Command::Profiles { profiles } => list_profiles(&profiles, cli.log_format),
    }
}

async fn run(bridge: &BridgeArgs, grace: Duration, probe_port: bool, format: LogFormat) -> Result<()> {
    let profile = bridge.resolve()?;
    let signals = SignalHandler::start().into_diagnostic()?;
    let ct = signals.cancellation_token();

    let settings = SupervisorSettings {
        executable: bridge.socat.clone(),
        grace_period_ms: u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
        probe_os_port: probe_port,
        ..Default::default()
    };
    let supervisor = BridgeSupervisor::new(settings, Arc::new(TracingLogSink));
    let mut events = supervisor.subscribe();

    let record = match &profile {
        Some(profile) => {
            info!("Using profile {}", profile.name);
            supervisor.start_profile(profile, &bridge.device, &ct).await?
        }
        None => {
            supervisor
                .start(&bridge.config()?, &bridge.device, &ct)
                .await?
        }
    };
    info!("Bridge command: {}", record.command_line);

    let mut terminal = None;
    while terminal.is_none() {
        tokio::select! {
            _ = ct.cancelled() => {
                supervisor.stop(record.id, grace, &CancellationToken::new()).await?;
                loop {
                    match events.try_recv() {
                        Ok(event) => {
                            print_event(&event, format);
                            if event.id == record.id && event.status.is_terminal() {
                                terminal = Some(event.status);
                            }
                        }
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!("Missed {} lifecycle events", skipped);
                        }
                        Err(_) => break,
                    }
                }
                terminal.get_or_insert(BridgeStatus::Stopped);
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event, format);
                    if event.id == record.id && event.status.is_terminal() {
                        terminal = Some(event.status);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} lifecycle events", skipped),
                Err(RecvError::Closed) => terminal = Some(BridgeStatus::Stopped),
            },
        }
    }

    if terminal == Some(BridgeStatus::Failed) {
        bail!("Bridge {} on {} failed", record.id, record.endpoint());
    }
    Ok(())
}

fn print_event(event: &LifecycleEvent, format: LogFormat) {
    match format {
        LogFormat::Text => println!("{} {}", event.at, event),
        LogFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize event: {}", e),
        },
    }
}

fn list_profiles(path: &Path, format: LogFormat) -> Result<()> {
    let profiles = load_profiles(path)?;
    if format == LogFormat::Json {
        println!("{}", serde_json::to_string_pretty(&profiles).into_diagnostic()?);
        return Ok(());
    }
    for profile in &profiles {
        let marker = if profile.is_default { "*" } else { " " };
        println!(
            "{} {:<20} {}:{:<6} {}",
            marker,
            profile.name,
            profile.configuration.tcp_host,
            profile.configuration.tcp_port,
            profile.description
        );
    }
    Ok(())
}
