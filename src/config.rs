use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Rally location relay server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "rally-relay", version, about = "Rally real-time location relay")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "RALLY_PORT", default_value = "3001")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "RALLY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./rally-relay.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "RALLY_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Seconds an accepted connection may wait before its first join_event
    #[arg(long, env = "RALLY_AUTH_TIMEOUT_SECS", default_value = "10")]
    pub auth_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            bind_address: "0.0.0.0".to_string(),
            config: "./rally-relay.toml".to_string(),
            json_logs: false,
            generate_config: false,
            auth_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RALLY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("RALLY_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Rally Location Relay Configuration
# Place this file at ./rally-relay.toml or specify with --config <path>
# All settings can be overridden via environment variables (RALLY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 3001)
# port = 3001

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Seconds a fresh connection may stay silent before it must send join_event.
# Connections that miss the window are closed without ever joining a room.
# auth_timeout_secs = 10
"#
    .to_string()
}
