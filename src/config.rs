use serde::Deserialize;
use std::collections::HashMap;

/// Gateway configuration loaded from TOML file.
/// See config.toml.example for format.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address the TLS listener binds to (e.g. "0.0.0.0:8443")
    pub bind: String,
    pub tls: TlsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Configured user accounts
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// RDP target per user, as "host:port"
    #[serde(default)]
    pub targets: HashMap<String, String>,
}

/// TLS certificate and key in PEM format.
#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

/// Tunnel-level settings advertised to or enforced on RDG clients.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    /// Idle timeout in minutes advertised in the tunnel auth response.
    /// Negative values are clamped to 0 on emit.
    #[serde(default)]
    pub idle_timeout: i32,
    /// Advertise smart card auth capability in the handshake response
    #[serde(default)]
    pub smart_card_auth: bool,
    /// Advertise PAA/token auth capability in the handshake response
    #[serde(default)]
    pub token_auth: bool,
    /// SO_SNDBUF for accepted connections; 0 leaves the kernel default
    #[serde(default)]
    pub send_buf: usize,
    /// SO_RCVBUF for accepted connections; 0 leaves the kernel default
    #[serde(default)]
    pub receive_buf: usize,
    #[serde(default)]
    pub redirect: RedirectConfig,
}

/// Device redirection toggles, assembled into the tunnel auth redirect
/// flags. `disable_all` wins over everything, `enable_all` over the
/// individual toggles.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedirectConfig {
    #[serde(default)]
    pub disable_all: bool,
    #[serde(default)]
    pub enable_all: bool,
    #[serde(default)]
    pub port: bool,
    #[serde(default)]
    pub clipboard: bool,
    #[serde(default)]
    pub drive: bool,
    #[serde(default)]
    pub pnp: bool,
    #[serde(default)]
    pub printer: bool,
}

/// A configured user account. The NTLMv2 hash is derived from these at
/// load time; the plaintext is kept for Basic auth.
#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub domain: String,
}

/// Load and parse the TOML configuration file.
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path, e))?;
    if config.users.is_empty() {
        anyhow::bail!("No users configured");
    }
    Ok(config)
}
