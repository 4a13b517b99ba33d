//! logrelay-server: token-scoped log relay.
//!
//! Devices stream log lines over WebSocket to the device port; inspectors
//! join the same token on the inspector port and receive them live, along
//! with a catch-up snapshot of recent history.

mod auth;
mod config;
mod relay;
mod server;
mod session;
mod storage;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::LogRelayServer;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// logrelay-server — relays device logs to live inspectors
#[derive(Parser, Debug)]
#[command(name = "logrelay-server", version, about = "Token-scoped log relay")]
struct Cli {
    /// Config file path
    #[arg(long, env = "LOGRELAY_CONFIG", default_value = "~/.logrelay/config.toml")]
    config: String,

    /// Address both listeners bind to
    #[arg(long, env = "LOGRELAY_HOST")]
    host: Option<String>,

    /// Port devices connect to
    #[arg(long, env = "LOGRELAY_DEVICE_PORT")]
    device_port: Option<u16>,

    /// Port inspectors connect to
    #[arg(long, env = "LOGRELAY_INSPECTOR_PORT")]
    inspector_port: Option<u16>,

    /// Password required from inspectors and `!notoken` devices
    #[arg(long, env = "LOGRELAY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Lines of history kept per token
    #[arg(long, env = "LOGRELAY_HISTORY_SIZE")]
    history_size: Option<usize>,

    /// Default token lifetime in milliseconds
    #[arg(long, env = "LOGRELAY_MAX_TOKEN_DURATION_MS")]
    max_token_duration_ms: Option<u64>,

    /// Longest relayed device frame, in UTF-16 code units
    #[arg(long, env = "LOGRELAY_MAX_LOG_LENGTH")]
    max_log_length: Option<usize>,

    /// Allow devices to mint tokens with `/!notoken`
    #[arg(long, env = "LOGRELAY_NO_TOKEN_MODE")]
    no_token_mode: Option<bool>,

    /// Wrong passwords tolerated per 24 h
    #[arg(long, env = "LOGRELAY_WRONG_PASSWORD_LIMIT")]
    wrong_password_limit: Option<u64>,

    /// Inspector connections tolerated per 24 h
    #[arg(long, env = "LOGRELAY_INSPECTOR_CONNECTION_LIMIT")]
    inspector_connection_limit: Option<u64>,

    /// Device connections tolerated per 24 h
    #[arg(long, env = "LOGRELAY_DEVICE_CONNECTION_LIMIT")]
    device_connection_limit: Option<u64>,

    /// Device messages tolerated per 24 h
    #[arg(long, env = "LOGRELAY_DEVICE_MESSAGE_LIMIT")]
    device_message_limit: Option<u64>,

    /// Inspector messages tolerated per 24 h
    #[arg(long, env = "LOGRELAY_INSPECTOR_MESSAGE_LIMIT")]
    inspector_message_limit: Option<u64>,

    /// Write relayed lines to per-token daily files
    #[arg(long, env = "LOGRELAY_DISK_LOGGING")]
    disk_logging: Option<bool>,

    /// Directory of the daily log files
    #[arg(long, env = "LOGRELAY_LOG_DIR")]
    log_dir: Option<String>,

    /// JSON file holding persistent tokens
    #[arg(long, env = "LOGRELAY_PERSISTENT_STORE")]
    persistent_store: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOGRELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            device_port: self.device_port,
            inspector_port: self.inspector_port,
            password: self.password.clone(),
            history_size: self.history_size,
            max_token_duration_ms: self.max_token_duration_ms,
            max_log_length: self.max_log_length,
            no_token_mode: self.no_token_mode,
            wrong_password_limit: self.wrong_password_limit,
            inspector_connection_limit: self.inspector_connection_limit,
            device_connection_limit: self.device_connection_limit,
            device_message_limit: self.device_message_limit,
            inspector_message_limit: self.inspector_message_limit,
            disk_logging: self.disk_logging,
            log_dir: self.log_dir.clone(),
            persistent_store: self.persistent_store.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting logrelay-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let relay = match LogRelayServer::bind(server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("logrelay-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
