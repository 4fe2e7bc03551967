mod api;
mod config;
mod controller;
mod miniapp;
mod proxy;
mod session;
mod signer;
mod walker;

#[cfg(test)]
mod mock_backend;

use clap::Parser;
use log::info;

use crate::api::GameApi;
use crate::config::Settings;
use crate::controller::AccountController;
use crate::miniapp::StaticLaunchUrl;
use crate::proxy::ProbeProxyDirectory;
use crate::walker::{RandomPacing, Walker};

// Custom Application Error Type
#[derive(Debug)]
enum AppError {
    Config(config::ConfigError),
    Session(session::SessionError),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "Configuration error: {}", err),
            AppError::Session(err) => write!(f, "Session error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Session(err) => Some(err),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<session::SessionError> for AppError {
    fn from(err: session::SessionError) -> Self {
        AppError::Session(err)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Session name: the account's key in the accounts file.
    #[clap(value_parser)]
    session: String,

    /// Path to the accounts configuration file.
    #[clap(long, default_value = "accounts_config.json")]
    accounts: String,

    /// Path to the recurring-sessions ledger.
    #[clap(long, default_value = "recurring_sessions.txt")]
    ledger: String,

    /// Game backend base URL.
    #[clap(long, default_value = "https://api.fomofighters.xyz")]
    api_base: String,

    /// Referral identifier attached on first login.
    #[clap(long, default_value = "ref228618799")]
    ref_id: String,

    /// Route traffic through the account's proxy pool.
    #[clap(long)]
    use_proxy: bool,

    /// Upper bound for the randomized startup delay, in seconds.
    #[clap(long, default_value_t = 30.0)]
    start_delay: f64,

    /// Probe URL for proxy health checks.
    #[clap(long, default_value = "https://api.ipify.org")]
    probe_url: String,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let args = Args::parse();
    env_logger::init();

    let settings = Settings {
        api_base: args.api_base,
        ref_id: args.ref_id,
        use_proxy: args.use_proxy,
        session_start_delay: args.start_delay,
        proxy_probe_url: args.probe_url,
    };

    let session = config::load_session_config(&args.accounts, &args.session)?;

    let first_run = config::is_first_run(&args.ledger, &args.session);
    if first_run {
        info!("{} | Detected first session run", args.session);
        config::record_session_run(&args.ledger, &args.session)?;
    }

    let provider = StaticLaunchUrl::new(session.launch_url.clone().unwrap_or_default());
    let api = GameApi::new(&settings, &args.session, &session, first_run, Box::new(provider))?;
    let walker = Walker::new(Box::new(RandomPacing));
    let directory = ProbeProxyDirectory::new(
        session.proxy_pool.clone(),
        settings.proxy_probe_url.clone(),
    );

    info!("{} | Account loop starting", args.session);
    AccountController::new(api, walker, Box::new(directory), settings)
        .run()
        .await?;
    Ok(())
}
