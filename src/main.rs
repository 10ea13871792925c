use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vizstream::config::{AppConfig, ConfigStore};
use vizstream::lifecycle::ShutdownHandle;
use vizstream::state::{AppState, ServerMode};
use vizstream::web;

/// How long the HTTP server may take to drain after connections were closed
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// vizstream command line arguments
#[derive(Parser, Debug)]
#[command(name = "vizstream")]
#[command(version, about = "Stream a visualization to the browser and relay its input", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Data directory path (default: ./.vizstream)
    #[arg(short = 'd', long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Keep configuration in memory only
    #[arg(long, global = true)]
    no_persist: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Write this run's effective configuration back to the store
    #[arg(long, global = true, conflicts_with = "no_persist")]
    save_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Video (WebRTC, optional MJPEG) and input server
    Webrtc(WebrtcArgs),
    /// Input-only server
    Interaction(InteractionArgs),
}

/// Options shared by both servers
#[derive(Args, Debug, Clone)]
struct ServerArgs {
    /// Listen address (overrides database config)
    #[arg(long, value_name = "ADDRESS")]
    host: Option<String>,

    /// Listen port (overrides database config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Event queue data region
    #[arg(long, value_name = "NAME")]
    queue_buffer_name: Option<String>,

    /// Event queue control region (head, tail, len, lock)
    #[arg(long, value_name = "NAME")]
    queue_head_tail_buffer_name: Option<String>,

    /// Slots in the event queue when it is created here
    #[arg(long, value_name = "N")]
    queue_capacity: Option<usize>,

    /// Create the queue regions instead of attaching to existing ones
    #[arg(long)]
    queue_create: bool,

    /// Serve over HTTPS (overrides database config)
    #[arg(long)]
    https: bool,

    /// Path to SSL certificate file (generates self-signed if not provided)
    #[arg(long, value_name = "FILE", requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,

    /// Path to SSL private key file
    #[arg(long, value_name = "FILE", requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct WebrtcArgs {
    #[command(flatten)]
    server: ServerArgs,

    /// Share one encoded track among all peers
    #[arg(long, overrides_with = "no_broadcast")]
    broadcast: bool,

    /// Give every peer its own track and encoder
    #[arg(long)]
    no_broadcast: bool,

    /// Frame buffer metadata region
    #[arg(long, value_name = "NAME")]
    info_buffer_name: Option<String>,

    /// Frame image region, once per slot
    #[arg(long, value_name = "NAME")]
    image_buffer_name: Vec<String>,

    /// Frames per second
    #[arg(long, value_name = "FPS")]
    fps: Option<u32>,

    /// Serve /video/mjpeg
    #[arg(long)]
    mjpeg: bool,

    /// STUN server URL (repeatable)
    #[arg(long, value_name = "URL")]
    stun_server: Vec<String>,
}

#[derive(Args, Debug)]
struct InteractionArgs {
    #[command(flatten)]
    server: ServerArgs,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    // Install default crypto provider (required by rustls 0.23+)
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting vizstream v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    let config_store = if args.no_persist {
        ConfigStore::in_memory().await?
    } else {
        tracing::info!("Data directory: {}", data_dir.display());
        tokio::fs::create_dir_all(&data_dir).await?;
        ConfigStore::new(&data_dir.join("vizstream.db")).await?
    };

    let mut config = (*config_store.get()).clone();
    let mode = apply_overrides(&mut config, &args.command);
    if args.save_config {
        config_store.set(config.clone()).await?;
        tracing::info!("Saved configuration with command line overrides");
    }
    let port = match mode {
        ServerMode::Streaming => config.web.webrtc_port,
        ServerMode::Interaction => config.web.interaction_port,
    };

    let shutdown = ShutdownHandle::new();
    let state = Arc::new(AppState::build(mode, config, shutdown.clone())?);
    let app = web::create_router(state.clone());

    let web_config = &state.config.web;
    let addr = resolve_addr(&web_config.host, port).await?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for CTRL+C: {}", e),
            }
            shutdown.trigger();
        });
    }

    // Connections are closed before the server stops accepting, so sockets
    // still get their close frames
    let stop_server = CancellationToken::new();
    let mut server = if web_config.https_enabled {
        let tls_config = load_tls_config(
            web_config.ssl_cert_path.as_deref(),
            web_config.ssl_key_path.as_deref(),
            &data_dir,
        )
        .await?;
        tracing::info!("Starting HTTPS server on https://{}", addr);

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        let stop = stop_server.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            drain.graceful_shutdown(Some(SERVER_DRAIN_TIMEOUT));
        });
        let server = axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service());
        tokio::spawn(async move { server.await.map_err(anyhow::Error::from) })
    } else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        tracing::info!("Starting HTTP server on http://{}", addr);

        let stop = stop_server.clone();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            stop.cancelled().await;
        });
        tokio::spawn(async move { server.await.map_err(anyhow::Error::from) })
    };

    let server_result = tokio::select! {
        _ = shutdown.triggered() => None,
        result = &mut server => Some(result),
    };

    state.close_connections().await;
    stop_server.cancel();

    match server_result {
        Some(Ok(Ok(()))) => {}
        Some(Ok(Err(e))) => tracing::error!("Server error: {}", e),
        Some(Err(e)) => tracing::error!("Server task failed: {}", e),
        None => {
            if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server).await.is_err() {
                tracing::warn!("Server did not drain in time");
                server.abort();
            }
        }
    }

    shutdown.trigger();
    state.release_regions();

    if let Some(err) = shutdown.fatal_error() {
        anyhow::bail!("stopped after fatal error: {}", err);
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Apply command line flags to the loaded configuration. Nothing is written back.
fn apply_overrides(config: &mut AppConfig, command: &Command) -> ServerMode {
    let (server, mode) = match command {
        Command::Webrtc(args) => (&args.server, ServerMode::Streaming),
        Command::Interaction(args) => (&args.server, ServerMode::Interaction),
    };

    if let Some(host) = &server.host {
        config.web.host = host.clone();
    }
    if let Some(port) = server.port {
        match mode {
            ServerMode::Streaming => config.web.webrtc_port = port,
            ServerMode::Interaction => config.web.interaction_port = port,
        }
    }
    if server.https {
        config.web.https_enabled = true;
    }
    if let (Some(cert), Some(key)) = (&server.ssl_cert, &server.ssl_key) {
        config.web.ssl_cert_path = Some(cert.to_string_lossy().to_string());
        config.web.ssl_key_path = Some(key.to_string_lossy().to_string());
    }

    if server.queue_buffer_name.is_some() {
        config.queue.buffer_name = server.queue_buffer_name.clone();
    }
    if server.queue_head_tail_buffer_name.is_some() {
        config.queue.head_tail_buffer_name = server.queue_head_tail_buffer_name.clone();
    }
    if let Some(capacity) = server.queue_capacity {
        config.queue.capacity = capacity;
    }
    if server.queue_create {
        config.queue.create = true;
    }

    match command {
        Command::Webrtc(args) => {
            if args.no_broadcast {
                config.stream.broadcast = false;
            } else if args.broadcast {
                config.stream.broadcast = true;
            }
            if args.info_buffer_name.is_some() {
                config.shm.info_buffer_name = args.info_buffer_name.clone();
            }
            if !args.image_buffer_name.is_empty() {
                config.shm.image_buffer_names = args.image_buffer_name.clone();
            }
            if let Some(fps) = args.fps {
                config.stream.fps = fps.max(1);
            }
            if args.mjpeg {
                config.stream.mjpeg_enabled = true;
            }
            if !args.stun_server.is_empty() {
                config.webrtc.stun_servers = args.stun_server.clone();
            }
        }
        Command::Interaction(_) => {
            // The input server always needs somewhere to put events
            config.queue.enabled = true;
        }
    }

    mode
}

async fn resolve_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {}:{}", host, port))?
        .next()
        .with_context(|| format!("No address for {}:{}", host, port))
}

async fn load_tls_config(
    cert_path: Option<&str>,
    key_path: Option<&str>,
    data_dir: &Path,
) -> anyhow::Result<RustlsConfig> {
    if let (Some(cert_path), Some(key_path)) = (cert_path, key_path) {
        return Ok(RustlsConfig::from_pem_file(cert_path, key_path).await?);
    }

    let cert_dir = data_dir.join("certs");
    let cert_path = cert_dir.join("server.crt");
    let key_path = cert_dir.join("server.key");

    // Check if certificate already exists, only generate if missing
    if !cert_path.exists() || !key_path.exists() {
        tracing::info!("Generating new self-signed TLS certificate");
        let cert = generate_self_signed_cert()?;
        tokio::fs::create_dir_all(&cert_dir).await?;
        tokio::fs::write(&cert_path, cert.cert.pem()).await?;
        tokio::fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
    } else {
        tracing::info!("Using existing TLS certificate from {}", cert_dir.display());
    }

    Ok(RustlsConfig::from_pem_file(&cert_path, &key_path).await?)
}

fn generate_self_signed_cert() -> anyhow::Result<rcgen::CertifiedKey> {
    let subject_alt_names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    Ok(rcgen::generate_simple_self_signed(subject_alt_names)?)
}

/// Initialize logging with the given log level
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vizstream=error,tower_http=error,webrtc=error",
        LogLevel::Warn => "vizstream=warn,tower_http=warn,webrtc=warn",
        LogLevel::Info => "vizstream=info,tower_http=info,webrtc=warn",
        LogLevel::Verbose => "vizstream=debug,tower_http=info,webrtc=warn",
        LogLevel::Debug => "vizstream=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "vizstream=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("VIZSTREAM_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from(".vizstream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_for_webrtc() {
        let args = CliArgs::parse_from([
            "vizstream",
            "webrtc",
            "--port",
            "9001",
            "--no-broadcast",
            "--info-buffer-name",
            "info",
            "--image-buffer-name",
            "img0",
            "--image-buffer-name",
            "img1",
            "--fps",
            "0",
        ]);
        let mut config = AppConfig::default();
        let mode = apply_overrides(&mut config, &args.command);
        assert_eq!(mode, ServerMode::Streaming);
        assert_eq!(config.web.webrtc_port, 9001);
        assert!(!config.stream.broadcast);
        assert_eq!(config.shm.image_buffer_names, vec!["img0", "img1"]);
        assert!(config.shm.is_shared());
        assert_eq!(config.stream.fps, 1);
    }

    #[test]
    fn test_interaction_defaults() {
        let args = CliArgs::parse_from(["vizstream", "interaction", "--queue-capacity", "16"]);
        let mut config = AppConfig::default();
        let mode = apply_overrides(&mut config, &args.command);
        assert_eq!(mode, ServerMode::Interaction);
        assert_eq!(config.web.interaction_port, 8080);
        assert_eq!(config.queue.capacity, 16);
        assert!(config.queue.enabled);
    }

    #[test]
    fn test_global_logging_flags_after_subcommand() {
        let args = CliArgs::parse_from(["vizstream", "interaction", "--log-json", "-vv"]);
        assert!(args.log_json);
        assert_eq!(args.verbose, 2);

        let args = CliArgs::parse_from(["vizstream", "webrtc"]);
        assert!(!args.log_json);
        assert!(!args.save_config);
    }

    #[test]
    fn test_save_config_needs_persistence() {
        assert!(CliArgs::try_parse_from(["vizstream", "webrtc", "--save-config"]).is_ok());
        assert!(
            CliArgs::try_parse_from(["vizstream", "webrtc", "--save-config", "--no-persist"]).is_err()
        );
    }
}
