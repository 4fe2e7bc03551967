use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    MissingSession(String),
    MissingKey { session: String, key: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Config parse error: {}", e),
            ConfigError::MissingSession(name) => {
                write!(f, "Session '{}' not present in accounts file", name)
            }
            ConfigError::MissingKey { session, key } => {
                write!(f, "Session '{}' is missing required key '{}'", session, key)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}

/// Global runtime knobs, fixed at startup and handed to the controller and
/// session client at construction.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_base: String,
    pub ref_id: String,
    pub use_proxy: bool,
    pub session_start_delay: f64,
    pub proxy_probe_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: "https://api.fomofighters.xyz".to_string(),
            ref_id: "ref228618799".to_string(),
            use_proxy: false,
            session_start_delay: 30.0,
            proxy_probe_url: "https://api.ipify.org".to_string(),
        }
    }
}

/// Platform API credentials belonging to the messaging-platform client. The
/// client itself lives outside this crate; the keys are validated here so a
/// broken accounts file fails before any network activity.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiCredentials {
    #[allow(dead_code)]
    pub id: i64,
    #[allow(dead_code)]
    pub hash: String,
}

/// Per-account entry of the accounts file, keyed by session name.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub api: Option<ApiCredentials>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub launch_url: Option<String>,
    #[serde(default)]
    pub proxy_pool: Vec<String>,
    #[serde(default)]
    pub race: Option<String>,
}

impl SessionConfig {
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or_default()
    }
}

fn parse_accounts(raw: &str) -> Result<HashMap<String, SessionConfig>, ConfigError> {
    Ok(serde_json::from_str(raw)?)
}

/// Loads one session's entry from the accounts file, failing the whole
/// account when the entry or one of its required keys (`api`, `user_agent`)
/// is missing.
pub fn load_session_config(
    path: impl AsRef<Path>,
    session: &str,
) -> Result<SessionConfig, ConfigError> {
    let raw = fs::read_to_string(path)?;
    let mut accounts = parse_accounts(&raw)?;
    let entry = accounts
        .remove(session)
        .ok_or_else(|| ConfigError::MissingSession(session.to_string()))?;

    if entry.api.is_none() {
        return Err(ConfigError::MissingKey {
            session: session.to_string(),
            key: "api",
        });
    }
    if entry.user_agent.as_deref().unwrap_or("").is_empty() {
        return Err(ConfigError::MissingKey {
            session: session.to_string(),
            key: "user_agent",
        });
    }
    Ok(entry)
}

/// A session is on its first run until its name lands in the recurring
/// sessions ledger. A missing ledger file means nothing has run yet.
pub fn is_first_run(ledger: impl AsRef<Path>, session: &str) -> bool {
    match fs::read_to_string(ledger) {
        Ok(contents) => !contents.lines().any(|line| line.trim() == session),
        Err(_) => true,
    }
}

/// Appends the session name to the recurring sessions ledger.
pub fn record_session_run(ledger: impl AsRef<Path>, session: &str) -> Result<(), ConfigError> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(ledger)?;
    writeln!(file, "{}", session)?;
    Ok(())
}
