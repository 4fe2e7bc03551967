use log::{error, info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

use crate::api::GameApi;
use crate::config::Settings;
use crate::proxy::ProxyDirectory;
use crate::session::SessionError;
use crate::walker::Walker;

/// Back-off when no working proxy can be acquired for a turn.
const PROXY_RETRY_BACKOFF: Duration = Duration::from_secs(300);

/// Outer per-account loop: proxy upkeep, token derivation, login, one walker
/// turn. Loops until the session goes invalid or the process is stopped.
pub struct AccountController {
    api: GameApi,
    walker: Walker,
    directory: Box<dyn ProxyDirectory>,
    settings: Settings,
}

impl AccountController {
    pub fn new(
        api: GameApi,
        walker: Walker,
        directory: Box<dyn ProxyDirectory>,
        settings: Settings,
    ) -> Self {
        Self {
            api,
            walker,
            directory,
            settings,
        }
    }

    /// Verifies the bound proxy before a turn, swapping it for a working one
    /// when dead or absent. `Ok(false)` means the turn must be skipped.
    async fn check_and_update_proxy(&mut self) -> Result<bool, SessionError> {
        if !self.settings.use_proxy {
            return Ok(true);
        }

        let current = self.api.session().current_proxy().map(str::to_string);
        let alive = match &current {
            Some(addr) => self.directory.check_alive(addr).await,
            None => false,
        };
        if alive {
            return Ok(true);
        }

        let Some(fresh) = self.directory.acquire_working(current.as_deref()).await else {
            return Ok(false);
        };
        self.api.session_mut().set_proxy(Some(&fresh))?;
        info!(
            "{} | Switched to new proxy: {}",
            self.api.session_name(),
            fresh
        );
        Ok(true)
    }

    /// One iteration of the account loop.
    pub async fn turn(&mut self) -> Result<(), SessionError> {
        if !self.check_and_update_proxy().await? {
            warn!(
                "{} | Failed to find a working proxy, sleeping 5 minutes",
                self.api.session_name()
            );
            sleep(PROXY_RETRY_BACKOFF).await;
            return Ok(());
        }

        let tg_web_data = self.api.derive_web_app_data().await?;
        if !self.api.login(&tg_web_data).await? {
            return Err(SessionError::InvalidSession("login failed".to_string()));
        }

        self.walker.play_turn(&self.api).await
    }

    /// Runs the account until its session goes invalid. Transient errors are
    /// absorbed with a randomized back-off; only session invalidity escapes.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let delay = rand::thread_rng().gen_range(1.0..self.settings.session_start_delay.max(2.0));
        info!(
            "{} | Starting in {}s",
            self.api.session_name(),
            delay as u64
        );
        sleep(Duration::from_secs_f64(delay)).await;

        loop {
            match self.turn().await {
                Ok(()) => {}
                Err(SessionError::InvalidSession(msg)) => {
                    error!("{} | Invalid session: {}", self.api.session_name(), msg);
                    return Err(SessionError::InvalidSession(msg));
                }
                Err(e) => {
                    let backoff = rand::thread_rng().gen_range(60.0..120.0);
                    error!(
                        "{} | Unknown error: {}. Sleeping for {}s",
                        self.api.session_name(),
                        e,
                        backoff as u64
                    );
                    sleep(Duration::from_secs_f64(backoff)).await;
                }
            }
        }
    }
}
