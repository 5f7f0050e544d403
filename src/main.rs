//! lanspeed - LAN throughput and datagram loss testing

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

use lanspeed::client::{Client, ClientConfig, ClientEvent};
use lanspeed::config::Config;
use lanspeed::discover::BroadcastConfig;
use lanspeed::output::{OutputFormat, output_csv, output_json, output_plain};
use lanspeed::protocol::{DEFAULT_CHUNK_SIZE, DISCOVERY_PORT};
use lanspeed::serve::{Server, ServerConfig};
use lanspeed::shutdown;
use lanspeed::tcp::TcpConfig;
use lanspeed::udp::UdpConfig;

const DEFAULT_SIZE: u64 = 1024 * 1024;
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CHUNK_SIZE: usize = 65_000;

/// Resolve a leading `~/` against the home directory
fn expand_log_path(path: &str) -> PathBuf {
    path.strip_prefix("~/")
        .and_then(|rest| dirs::home_dir().map(|home| home.join(rest)))
        .unwrap_or_else(|| PathBuf::from(path))
}

/// Daily-rotated, non-blocking writer for `path`, creating its directory
fn log_file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let file_name = path.file_name().unwrap_or_else(|| OsStr::new("lanspeed.log"));
    let appender = tracing_appender::rolling::daily(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber: stderr always, plus a log file when one is
/// configured. The returned guard flushes the file on drop.
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let directive = format!("lanspeed={}", log_level.unwrap_or("info"));
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let (file_writer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = log_file_writer(&expand_log_path(path))?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

#[derive(Parser)]
#[command(name = "lanspeed")]
#[command(author, version, about = "LAN throughput and datagram loss testing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL", value_parser = ["bash", "zsh", "fish", "powershell", "elvish"])]
    completions: Option<String>,

    /// Bytes requested per session (e.g., 512K, 10M)
    #[arg(short, long, value_parser = parse_size, env = "LANSPEED_SIZE")]
    size: Option<u64>,

    /// Concurrent TCP sessions per round
    #[arg(long, env = "LANSPEED_TCP")]
    tcp: Option<u32>,

    /// Concurrent UDP sessions per round
    #[arg(long, env = "LANSPEED_UDP")]
    udp: Option<u32>,

    /// Rounds to run (0 runs until interrupted)
    #[arg(short, long, env = "LANSPEED_ROUNDS")]
    rounds: Option<u32>,

    /// How long to wait for a server offer
    #[arg(long, value_parser = parse_duration, env = "LANSPEED_DISCOVERY_TIMEOUT")]
    discovery_timeout: Option<Duration>,

    /// Silence that ends a UDP transfer
    #[arg(long, value_parser = parse_duration, env = "LANSPEED_IDLE_WINDOW")]
    idle_window: Option<Duration>,

    /// Port to listen on for server offers
    #[arg(long, env = "LANSPEED_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    /// Disable Nagle algorithm
    #[arg(long)]
    tcp_nodelay: bool,

    /// JSON output
    #[arg(long, conflicts_with = "csv")]
    json: bool,

    /// CSV output
    #[arg(long)]
    csv: bool,

    /// Write all rounds to this file (JSON, or CSV with --csv)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log file path (e.g., "~/.config/lanspeed/lanspeed.log")
    #[arg(long, env = "LANSPEED_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LANSPEED_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start server mode
    Serve {
        /// TCP port (0 picks a free one)
        #[arg(long, env = "LANSPEED_TCP_PORT")]
        tcp_port: Option<u16>,

        /// UDP port (0 picks a free one)
        #[arg(long, env = "LANSPEED_UDP_PORT")]
        udp_port: Option<u16>,

        /// Port offers are broadcast to
        #[arg(long, env = "LANSPEED_DISCOVERY_PORT")]
        discovery_port: Option<u16>,

        /// Broadcast destination address
        #[arg(long, env = "LANSPEED_BROADCAST_ADDR")]
        broadcast_addr: Option<Ipv4Addr>,

        /// Offer interval
        #[arg(long, value_parser = parse_duration)]
        interval: Option<Duration>,

        /// Bytes per TCP write and per UDP payload
        #[arg(long, value_parser = parse_chunk_size)]
        chunk_size: Option<usize>,

        /// Maximum concurrent workers per transport
        #[arg(long)]
        max_workers: Option<usize>,

        /// Do not broadcast offers
        #[arg(long)]
        no_broadcast: bool,

        /// Disable Nagle algorithm
        #[arg(long)]
        tcp_nodelay: bool,

        /// Log file path (e.g., "~/.config/lanspeed/lanspeed.log")
        #[arg(long, env = "LANSPEED_LOG_FILE")]
        log_file: Option<String>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long, env = "LANSPEED_LOG_LEVEL")]
        log_level: Option<String>,
    },

    /// Wait for one server offer and print it
    Discover {
        /// Discovery timeout
        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        timeout: Duration,

        /// Port to listen on
        #[arg(long, default_value_t = DISCOVERY_PORT)]
        port: u16,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();
    let (num, suffix) = if s.ends_with('G') {
        (s.trim_end_matches('G'), 1024 * 1024 * 1024u64)
    } else if s.ends_with('M') {
        (s.trim_end_matches('M'), 1024 * 1024u64)
    } else if s.ends_with('K') {
        (s.trim_end_matches('K'), 1024u64)
    } else {
        (s.as_str(), 1u64)
    };

    num.parse::<u64>()
        .map_err(|e| e.to_string())?
        .checked_mul(suffix)
        .ok_or_else(|| format!("size {} is too large", s))
}

fn parse_chunk_size(s: &str) -> Result<usize, String> {
    let size = parse_size(s)?;
    check_chunk_size(usize::try_from(size).map_err(|e| e.to_string())?)
}

fn check_chunk_size(size: usize) -> Result<usize, String> {
    if size == 0 {
        return Err("chunk size must be at least 1 byte".to_string());
    }
    // Payload plus header must fit in one datagram
    if size > MAX_CHUNK_SIZE {
        return Err(format!(
            "chunk size must fit in a single datagram (max {})",
            MAX_CHUNK_SIZE
        ));
    }
    Ok(size)
}

fn generate_completions(shell: &str) {
    use clap::CommandFactory;
    use clap_complete::{Shell, generate};

    let mut cmd = Cli::command();
    let shell = match shell {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            eprintln!("Unknown shell: {}", shell);
            std::process::exit(1);
        }
    };
    generate(shell, &mut cmd, "lanspeed", &mut std::io::stdout());
}

/// Flip `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_watcher(on_signal: impl FnOnce() + Send + 'static) {
    tokio::spawn(async move {
        match shutdown::shutdown_signal().await {
            Ok(()) => {
                info!("Shutting down...");
                on_signal();
            }
            Err(e) => warn!("Failed to listen for shutdown signals: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle shell completions early (before logging init)
    if let Some(ref shell) = cli.completions {
        generate_completions(shell);
        return Ok(());
    }

    // Load config file (falls back to defaults if not found)
    let file_config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Ignoring config file {}: {}",
                Config::config_path().display(),
                e
            );
            Config::default()
        }
    };

    match cli.command {
        Some(Commands::Serve {
            tcp_port,
            udp_port,
            discovery_port,
            broadcast_addr,
            interval,
            chunk_size,
            max_workers,
            no_broadcast,
            tcp_nodelay,
            log_file,
            log_level,
        }) => {
            let server_defaults = &file_config.server;
            let _log_guard = init_logging(
                log_file.as_deref().or(server_defaults.log_file.as_deref()),
                log_level.as_deref().or(server_defaults.log_level.as_deref()),
            )?;

            let discovery_port = discovery_port
                .or(server_defaults.discovery_port)
                .unwrap_or(DISCOVERY_PORT);
            let broadcast_ip = match broadcast_addr {
                Some(ip) => ip,
                None => match server_defaults.broadcast_addr.as_deref() {
                    Some(s) => s.parse()?,
                    None => Ipv4Addr::BROADCAST,
                },
            };
            let interval = match interval {
                Some(interval) => interval,
                None => match server_defaults.interval.as_deref() {
                    Some(s) => parse_duration(s).map_err(anyhow::Error::msg)?,
                    None => BroadcastConfig::default().interval,
                },
            };
            let chunk_size = match chunk_size {
                Some(chunk_size) => chunk_size,
                None => match server_defaults.chunk_size {
                    Some(size) => check_chunk_size(size).map_err(anyhow::Error::msg)?,
                    None => DEFAULT_CHUNK_SIZE,
                },
            };

            let broadcast = (!no_broadcast).then(|| BroadcastConfig {
                target: SocketAddr::new(IpAddr::V4(broadcast_ip), discovery_port),
                interval,
            });

            let config = ServerConfig {
                bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                tcp_port: tcp_port.or(server_defaults.tcp_port).unwrap_or(0),
                udp_port: udp_port.or(server_defaults.udp_port).unwrap_or(0),
                chunk_size,
                nodelay: tcp_nodelay || server_defaults.tcp_nodelay.unwrap_or(false),
                broadcast,
                max_workers: max_workers.or(server_defaults.max_workers),
            };

            let server = Server::bind(config).await?;
            println!(
                "Server started, listening on TCP port {} and UDP port {}",
                server.tcp_port(),
                server.udp_port()
            );

            let (cancel_tx, cancel_rx) = watch::channel(false);
            spawn_signal_watcher(move || {
                cancel_tx.send_replace(true);
            });
            server.run(cancel_rx).await?;
        }

        Some(Commands::Discover { timeout, port }) => {
            let _log_guard = init_logging(
                cli.log_file
                    .as_deref()
                    .or(file_config.client.log_file.as_deref()),
                cli.log_level
                    .as_deref()
                    .or(file_config.client.log_level.as_deref()),
            )?;

            match lanspeed::discover::discover_on(port, timeout).await {
                Ok(endpoint) => println!("Found server: {}", endpoint),
                Err(lanspeed::DiscoveryError::Timeout(_)) => {
                    println!("No lanspeed servers found.");
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        None => {
            let defaults = &file_config.client;
            let _log_guard = init_logging(
                cli.log_file.as_deref().or(defaults.log_file.as_deref()),
                cli.log_level.as_deref().or(defaults.log_level.as_deref()),
            )?;

            let size = match cli.size {
                Some(size) => size,
                None => match defaults.size.as_deref() {
                    Some(s) => parse_size(s).map_err(anyhow::Error::msg)?,
                    None => DEFAULT_SIZE,
                },
            };
            let discovery_timeout = match cli.discovery_timeout {
                Some(timeout) => timeout,
                None => match defaults.discovery_timeout.as_deref() {
                    Some(s) => parse_duration(s).map_err(anyhow::Error::msg)?,
                    None => DEFAULT_DISCOVERY_TIMEOUT,
                },
            };
            let idle_window = match cli.idle_window {
                Some(window) => window,
                None => match defaults.idle_window.as_deref() {
                    Some(s) => parse_duration(s).map_err(anyhow::Error::msg)?,
                    None => UdpConfig::default().idle_window,
                },
            };
            let rounds = cli.rounds.or(defaults.rounds).unwrap_or(1);

            let config = ClientConfig {
                size,
                stream_sessions: cli.tcp.or(defaults.tcp_sessions).unwrap_or(1),
                datagram_sessions: cli.udp.or(defaults.udp_sessions).unwrap_or(1),
                discovery_port: cli
                    .discovery_port
                    .or(defaults.discovery_port)
                    .unwrap_or(DISCOVERY_PORT),
                discovery_timeout,
                rounds: (rounds > 0).then_some(rounds),
                keep_summaries: cli.output.is_some(),
                tcp: TcpConfig {
                    nodelay: cli.tcp_nodelay || defaults.tcp_nodelay.unwrap_or(false),
                    ..TcpConfig::default()
                },
                udp: UdpConfig {
                    idle_window,
                    ..UdpConfig::default()
                },
            };

            let format =
                OutputFormat::select(cli.json, cli.csv, defaults.json_output.unwrap_or(false));

            run_client(config, format, cli.output).await?;
        }
    }

    Ok(())
}

async fn run_client(config: ClientConfig, format: OutputFormat, output: Option<PathBuf>) -> Result<()> {
    if format == OutputFormat::Plain {
        println!(
            "Client started, listening for offer requests on port {}...",
            config.discovery_port
        );
    }

    let client = Arc::new(Client::new(config));
    {
        let client = client.clone();
        spawn_signal_watcher(move || client.cancel());
    }

    let (tx, mut rx) = mpsc::channel::<ClientEvent>(100);

    // Print results as rounds complete so endless runs still report
    let print_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ClientEvent::Discovered(endpoint) => {
                    if format == OutputFormat::Plain {
                        println!("Received offer from {}", endpoint);
                    }
                }
                ClientEvent::DiscoveryFailed(reason) => {
                    if format == OutputFormat::Plain {
                        println!("{}, still listening...", reason);
                    }
                }
                ClientEvent::Round(summary) => match format {
                    OutputFormat::Plain => print!("{}", output_plain(&summary)),
                    OutputFormat::Json => println!("{}", output_json(&summary)),
                    OutputFormat::Csv => println!("{}", output_csv(&summary)),
                },
                ClientEvent::State(state) => debug!("Client state: {:?}", state),
            }
        }
    });

    let summaries = client.run(Some(tx)).await?;
    if let Err(e) = print_handle.await {
        warn!("Output task failed: {}", e);
    }

    if let Some(path) = output {
        if format == OutputFormat::Csv {
            lanspeed::output::csv::save_csv(&summaries, &path)?;
        } else {
            lanspeed::output::json::save_json(&summaries, &path)?;
        }
        info!("Results saved to {}", path.display());
    }

    Ok(())
}
