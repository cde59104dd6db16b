use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tandem_common::ParticipantId;

/// CLI arguments for the pairing daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "tandemd")]
#[command(about = "Anonymous pairing relay daemon")]
#[command(version)]
pub struct Args {
    /// Socket address the gateway listens on.
    #[arg(long, default_value = "127.0.0.1:7800", env = "TANDEM_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9091", env = "TANDEM_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Chat id that receives a copy of every media message.
    #[arg(long, env = "TANDEM_MONITOR_CHAT", allow_negative_numbers = true)]
    pub monitor_chat: i64,
    /// Comma-separated administrator ids.
    #[arg(long, env = "TANDEM_ADMIN_IDS", value_delimiter = ',')]
    pub admin_ids: Vec<i64>,
    /// Minimum milliseconds between relayed messages from one participant.
    #[arg(long, default_value = "1300", env = "TANDEM_COOLDOWN_MS")]
    pub cooldown_ms: u64,
    /// Path of the queue/session snapshot file.
    #[arg(long, default_value = "anon_state.json", env = "TANDEM_STATE_FILE")]
    pub state_file: PathBuf,
    /// Maximum concurrently attached gateway adapters.
    #[arg(long, default_value = "16", env = "TANDEM_MAX_GATEWAYS")]
    pub max_gateways: usize,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Write logs to a file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address the gateway listens on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Monitoring destination for media mirrors.
    pub monitor_chat: i64,
    /// Participants allowed to run admin commands and receive notices.
    pub admin_ids: Vec<ParticipantId>,
    /// Relay cooldown in milliseconds.
    pub cooldown_ms: u64,
    /// Snapshot file path.
    pub state_file: PathBuf,
    /// Maximum concurrently attached gateway adapters.
    pub max_gateways: usize,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.monitor_chat == 0 {
            return Err("monitor_chat must be a non-zero chat id".to_string());
        }

        if self.admin_ids.iter().any(|id| id.0 == 0) {
            return Err("admin_ids must not contain 0".to_string());
        }

        if self.cooldown_ms == 0 {
            return Err("cooldown_ms must be greater than 0".to_string());
        }
        if self.cooldown_ms > 60_000 {
            return Err("cooldown_ms exceeds reasonable limit (60000 ms)".to_string());
        }

        if self.state_file.as_os_str().is_empty() {
            return Err("state_file must not be empty".to_string());
        }

        if self.max_gateways == 0 {
            return Err("max_gateways must be greater than 0".to_string());
        }
        if self.max_gateways > 1024 {
            return Err("max_gateways exceeds reasonable limit (1024)".to_string());
        }

        Ok(())
    }

    /// Relay cooldown as a [`Duration`].
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Returns `true` if `id` is an administrator.
    #[must_use]
    pub fn is_admin(&self, id: ParticipantId) -> bool {
        self.admin_ids.contains(&id)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            monitor_chat: args.monitor_chat,
            admin_ids: args.admin_ids.into_iter().map(ParticipantId).collect(),
            cooldown_ms: args.cooldown_ms,
            state_file: args.state_file,
            max_gateways: args.max_gateways,
        }
    }
}
