use async_trait::async_trait;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, ORIGIN, REFERER,
    USER_AGENT,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use crate::config::{SessionConfig, Settings};
use crate::miniapp::{self, LaunchUrlProvider};
use crate::session::{Reauthenticate, SessionClient, SessionError};
use crate::signer;

pub const AVAILABLE_RACES: [&str; 6] = ["cat", "dog", "frog", "seal", "troll", "man"];
const DEFAULT_RACE: &str = "frog";

/// Referral used for session names that hash outside the configured bucket.
const FALLBACK_REF_ID: &str = "ref228618799";

/// Browser fingerprint the backend expects on every call. The user-agent slot
/// is overridden per session.
static BASE_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("ru,en;q=0.9,en-GB;q=0.8,en-US;q=0.7"),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static("is-beta-server"),
        HeaderValue::from_static("null"),
    );
    headers.insert(ORIGIN, HeaderValue::from_static("https://game.fomofighters.xyz"));
    headers.insert(HeaderName::from_static("priority"), HeaderValue::from_static("u=1, i"));
    headers.insert(REFERER, HeaderValue::from_static("https://game.fomofighters.xyz/"));
    headers.insert(
        HeaderName::from_static("sec-ch-ua"),
        HeaderValue::from_static(
            "\"Microsoft Edge\";v=\"142\", \"Microsoft Edge WebView2\";v=\"142\", \"Chromium\";v=\"142\", \"Not_A Brand\";v=\"99\"",
        ),
    );
    headers.insert(
        HeaderName::from_static("sec-ch-ua-mobile"),
        HeaderValue::from_static("?0"),
    );
    headers.insert(
        HeaderName::from_static("sec-ch-ua-platform"),
        HeaderValue::from_static("\"Windows\""),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-dest"),
        HeaderValue::from_static("empty"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("cors"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("same-site"),
    );
    headers
});

pub fn fingerprint_headers(user_agent: &str) -> HeaderMap {
    let mut headers = BASE_HEADERS.clone();
    if let Ok(ua) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, ua);
    }
    headers
}

/// Wrapper every backend JSON response uses. A well-formed 200 without
/// `success: true` is a business-logic failure, never a transport one.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or(Envelope {
            success: false,
            data: None,
        })
    }
}

/// Troops committed to one attack or scout order, keyed by composite troop id.
pub type TroopAllocation = BTreeMap<String, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Attackable resource site.
    Oasis,
    /// Attackable camp.
    Camp,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Oasis => "oasis",
            TargetKind::Camp => "camp",
        }
    }
}

#[derive(Serialize)]
struct Payload<T: Serialize> {
    data: T,
}

fn wrap<T: Serialize>(data: T) -> Payload<T> {
    Payload { data }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthData<'a> {
    init_data: &'a str,
    photo_url: String,
    platform: &'static str,
    chat_id: &'static str,
    chat_type: String,
    chat_instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_param: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildOrder<'a> {
    position: u32,
    building_key: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TroopOrder<'a> {
    troop_key: &'a str,
    count: u32,
}

#[derive(Serialize)]
struct AttackOrder<'a> {
    target: &'a Value,
    troops: &'a TroopAllocation,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QuestClaim<'a> {
    quest_key: &'a str,
}

#[derive(Serialize)]
struct AfterData<'a> {
    lang: &'a str,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn resolve_ref_id(session_name: &str, configured: &str) -> String {
    let name_sum: u32 = session_name.bytes().map(u32::from).sum();
    if name_sum % 10 < 6 {
        configured.to_string()
    } else {
        FALLBACK_REF_ID.to_string()
    }
}

fn random_race() -> String {
    let mut rng = rand::thread_rng();
    AVAILABLE_RACES.choose(&mut rng).unwrap_or(&DEFAULT_RACE).to_string()
}

/// Typed operations over the game backend. Owns the session transport, the
/// access token, and the cached faction choice for one account.
pub struct GameApi {
    client: SessionClient,
    provider: Box<dyn LaunchUrlProvider>,
    api_base: String,
    base_url: Url,
    session_name: String,
    ref_id: String,
    first_run: bool,
    pinned_race: Option<String>,
    access_token: Mutex<Option<String>>,
    selected_race: Mutex<Option<String>>,
}

impl GameApi {
    pub fn new(
        settings: &Settings,
        session_name: &str,
        session: &SessionConfig,
        first_run: bool,
        provider: Box<dyn LaunchUrlProvider>,
    ) -> Result<Self, SessionError> {
        let api_base = settings.api_base.trim_end_matches('/').to_string();
        let base_url = Url::parse(&api_base)?;
        let client = SessionClient::new(
            fingerprint_headers(session.user_agent()),
            session.proxy.as_deref(),
        )?;
        Ok(Self {
            client,
            provider,
            api_base,
            base_url,
            ref_id: resolve_ref_id(session_name, &settings.ref_id),
            session_name: session_name.to_string(),
            first_run,
            pinned_race: session.race.clone(),
            access_token: Mutex::new(None),
            selected_race: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &SessionClient {
        &self.client
    }

    pub fn session_mut(&mut self) -> &mut SessionClient {
        &mut self.client
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Identity key fallback chain: auth cookie set by the backend, then the
    /// `hash=` field of the cached session payload, then `"empty"` for the
    /// very first pre-auth call.
    fn dynamic_api_key(&self) -> String {
        if let Some(cookie) = self.client.cookie_value(&self.base_url, "user_auth_hash") {
            debug!("[{}] Using user_auth_hash cookie as api key", self.session_name);
            return cookie;
        }
        if let Some(token) = lock(&self.access_token).clone() {
            let hash = miniapp::extract_hash(&token);
            if !hash.is_empty() {
                return hash;
            }
        }
        "empty".to_string()
    }

    /// Signs and submits one API call. The serialized payload is the exact
    /// string the signature covers and the exact request body.
    async fn send_signed<T: Serialize>(
        &self,
        path: &str,
        payload: Option<&T>,
        api_key: Option<&str>,
        skip_relogin: bool,
    ) -> Result<Option<Envelope>, SessionError> {
        let api_time = signer::unix_now();
        let key = match api_key {
            Some(key) => key.to_string(),
            None => self.dynamic_api_key(),
        };
        let body = signer::payload_string(payload)?;
        let api_hash = signer::sign(api_time, &body);

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("api-key"),
            HeaderValue::from_str(&key)
                .map_err(|_| SessionError::Config("api key is not header-safe".to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("api-time"),
            HeaderValue::from_str(&api_time.to_string())
                .map_err(|_| SessionError::Config("api time is not header-safe".to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("api-hash"),
            HeaderValue::from_str(&api_hash)
                .map_err(|_| SessionError::Config("api hash is not header-safe".to_string()))?,
        );

        let url = format!("{}{}", self.api_base, path);
        debug!("[{}] API request {} body={}", self.session_name, path, body);

        let value = self
            .client
            .request_json(&url, headers, body, skip_relogin, self)
            .await?;
        Ok(value.map(Envelope::from_value))
    }

    /// Fetches the launch URL from the platform client, pins the webapp
    /// version, and extracts the session payload.
    pub async fn derive_web_app_data(&self) -> Result<String, SessionError> {
        let url = self
            .provider
            .launch_url(miniapp::APP_NAME, miniapp::APP_PATH, &self.ref_id)
            .await?;
        let pinned = miniapp::pin_webapp_version(&url, miniapp::PINNED_WEBAPP_VERSION)?;
        debug!("[{}] Launch URL: {}", self.session_name, pinned);
        Ok(miniapp::extract_web_app_data(&pinned)?)
    }

    /// Authenticates with the session payload. On success the payload becomes
    /// the active access token, superseding any prior one.
    pub async fn login(&self, tg_web_data: &str) -> Result<bool, SessionError> {
        let chat_type = miniapp::extract_param(tg_web_data, "chat_type");
        let chat_instance = miniapp::extract_param(tg_web_data, "chat_instance");
        let photo_url = miniapp::extract_photo_url(tg_web_data);

        let auth = AuthData {
            init_data: tg_web_data,
            photo_url,
            platform: "android",
            chat_id: "",
            chat_type: if chat_type.is_empty() {
                "sender".to_string()
            } else {
                chat_type
            },
            chat_instance,
            start_param: self.first_run.then_some(self.ref_id.as_str()),
        };

        let response = self
            .send_signed("/telegram/auth", Some(&wrap(auth)), Some("empty"), true)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                *lock(&self.access_token) = Some(tg_web_data.to_string());
                info!("{} | Authorization successful", self.session_name);
                Ok(true)
            }
            other => {
                error!(
                    "{} | Authorization failed, response: {:?}",
                    self.session_name,
                    other.map(|e| e.data)
                );
                Ok(false)
            }
        }
    }

    pub async fn get_user_data(&self) -> Result<Option<Envelope>, SessionError> {
        self.send_signed("/user/data/all", Some(&wrap(json!({}))), None, false)
            .await
    }

    pub async fn after_data(&self, lang: &str) -> Result<Option<Envelope>, SessionError> {
        self.send_signed("/user/data/after", Some(&wrap(AfterData { lang })), None, false)
            .await
    }

    pub async fn finish_onboarding(&self, step: u32) -> Result<bool, SessionError> {
        let response = self
            .send_signed("/onboarding/finish", Some(&wrap(step)), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!("{} | Onboarding step {} finished", self.session_name, step);
                Ok(true)
            }
            other => {
                warn!(
                    "{} | Onboarding step {} not finished: {:?}",
                    self.session_name,
                    step,
                    other.map(|e| e.data)
                );
                Ok(false)
            }
        }
    }

    /// Selects a faction: an explicit choice wins, then the configured pin,
    /// then a uniform random pick. The choice is cached for the process so
    /// composite troop keys stay consistent.
    pub async fn select_race(&self, race: Option<&str>) -> Result<bool, SessionError> {
        let race = race
            .map(str::to_string)
            .or_else(|| self.pinned_race.clone())
            .unwrap_or_else(random_race);

        let response = self
            .send_signed("/race/select", Some(&wrap(race.as_str())), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                *lock(&self.selected_race) = Some(race.clone());
                info!("{} | Selected race: {}", self.session_name, race);
                Ok(true)
            }
            other => {
                error!(
                    "{} | Race selection failed: {:?}",
                    self.session_name,
                    other.map(|e| e.data)
                );
                Ok(false)
            }
        }
    }

    pub fn current_race(&self) -> String {
        lock(&self.selected_race)
            .clone()
            .unwrap_or_else(|| DEFAULT_RACE.to_string())
    }

    /// Composite troop identifier, e.g. `frog_archer_10`.
    pub fn troop_key(&self, class: &str, tier: u32) -> String {
        format!("{}_{}_{}", self.current_race(), class, tier)
    }

    /// Buy and upgrade share this endpoint; server-side state decides which
    /// of the two actually happens.
    pub async fn buy_building(&self, position: u32, building_key: &str) -> Result<bool, SessionError> {
        let order = BuildOrder {
            position,
            building_key,
        };
        let response = self
            .send_signed("/building/buy", Some(&wrap(order)), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!(
                    "{} | Building order placed: {} at position {}",
                    self.session_name, building_key, position
                );
                Ok(true)
            }
            other => {
                warn!(
                    "{} | Building order for {} failed: {:?}",
                    self.session_name,
                    building_key,
                    other.map(|e| e.data)
                );
                Ok(false)
            }
        }
    }

    pub async fn claim_resource(&self, resource: &str) -> Result<bool, SessionError> {
        let response = self
            .send_signed("/resource/claim", Some(&wrap(resource)), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!("{} | Claimed resource: {}", self.session_name, resource);
                Ok(true)
            }
            _ => {
                warn!("{} | Resource {} not claimed", self.session_name, resource);
                Ok(false)
            }
        }
    }

    pub async fn building_info(&self) -> Result<Option<Envelope>, SessionError> {
        self.send_signed("/building/info", Some(&json!({})), None, false)
            .await
    }

    pub async fn train_troops(&self, troop_key: &str, count: u32) -> Result<bool, SessionError> {
        let order = TroopOrder { troop_key, count };
        let response = self
            .send_signed("/troops/buy", Some(&wrap(order)), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!(
                    "{} | Trained troops: {} x{}",
                    self.session_name, troop_key, count
                );
                Ok(true)
            }
            other => {
                warn!(
                    "{} | Troop training for {} failed: {:?}",
                    self.session_name,
                    troop_key,
                    other.map(|e| e.data)
                );
                Ok(false)
            }
        }
    }

    pub async fn troops_info(&self) -> Result<Option<Envelope>, SessionError> {
        self.send_signed("/troops/info", Some(&json!({})), None, false)
            .await
    }

    pub async fn create_attack(
        &self,
        target: &Value,
        troops: &TroopAllocation,
    ) -> Result<bool, SessionError> {
        let order = AttackOrder { target, troops };
        let response = self
            .send_signed("/attack/create", Some(&wrap(order)), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!("{} | Attack sent to target {}", self.session_name, target);
                Ok(true)
            }
            other => {
                warn!(
                    "{} | Attack on {} failed: {:?}",
                    self.session_name,
                    target,
                    other.map(|e| e.data)
                );
                Ok(false)
            }
        }
    }

    pub async fn create_scout(
        &self,
        target: &Value,
        troops: &TroopAllocation,
    ) -> Result<bool, SessionError> {
        let order = AttackOrder { target, troops };
        let response = self
            .send_signed("/attack/create/scout", Some(&wrap(order)), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!("{} | Scout sent to target {}", self.session_name, target);
                Ok(true)
            }
            other => {
                warn!(
                    "{} | Scouting {} failed: {:?}",
                    self.session_name,
                    target,
                    other.map(|e| e.data)
                );
                Ok(false)
            }
        }
    }

    pub async fn attack_info(&self) -> Result<Option<Envelope>, SessionError> {
        self.send_signed("/attack/info", Some(&json!({})), None, false)
            .await
    }

    pub async fn claim_main_quest(&self, quest_key: &str) -> Result<bool, SessionError> {
        let claim = QuestClaim { quest_key };
        let response = self
            .send_signed("/quest/main/claim", Some(&wrap(claim)), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!("{} | Main quest claimed: {}", self.session_name, quest_key);
                Ok(true)
            }
            _ => {
                warn!("{} | Main quest {} not claimed", self.session_name, quest_key);
                Ok(false)
            }
        }
    }

    pub async fn claim_side_quest(&self, quest_key: &str) -> Result<bool, SessionError> {
        let response = self
            .send_signed("/quest/side/claim", Some(&wrap(quest_key)), None, false)
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!("{} | Side quest claimed: {}", self.session_name, quest_key);
                Ok(true)
            }
            _ => {
                warn!("{} | Side quest {} not claimed", self.session_name, quest_key);
                Ok(false)
            }
        }
    }

    /// Checks a quest condition; `data.result` carries the verdict.
    pub async fn check_quest_condition(&self, condition_key: &str) -> Result<bool, SessionError> {
        let response = self
            .send_signed(
                "/quest/check",
                Some(&wrap((condition_key, Value::Null))),
                None,
                false,
            )
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                let met = envelope
                    .data
                    .as_ref()
                    .and_then(|d| d.get("result"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if met {
                    info!(
                        "{} | Quest condition {} confirmed",
                        self.session_name, condition_key
                    );
                }
                Ok(met)
            }
            _ => Ok(false),
        }
    }

    pub async fn claim_quest_reward(&self, condition_key: &str) -> Result<bool, SessionError> {
        let response = self
            .send_signed(
                "/quest/claim",
                Some(&wrap((condition_key, Value::Null))),
                None,
                false,
            )
            .await?;
        match response {
            Some(envelope) if envelope.success => {
                info!(
                    "{} | Quest reward claimed: {}",
                    self.session_name, condition_key
                );
                Ok(true)
            }
            _ => {
                warn!(
                    "{} | Quest reward {} not claimed",
                    self.session_name, condition_key
                );
                Ok(false)
            }
        }
    }

    /// First attackable target of the requested kind, in the order the
    /// backend lists them.
    pub async fn find_target(&self, kind: TargetKind) -> Result<Option<Value>, SessionError> {
        let info = self.building_info().await?;
        Ok(find_attackable(info.as_ref(), kind))
    }
}

/// Scans a building-info envelope for the first target of `kind` whose
/// can-attack flag is set. Preserves list order.
pub fn find_attackable(envelope: Option<&Envelope>, kind: TargetKind) -> Option<Value> {
    let envelope = envelope?;
    if !envelope.success {
        return None;
    }
    let targets = envelope.data.as_ref()?.get("targets")?.as_array()?;
    for target in targets {
        let matches = target.get("type").and_then(Value::as_str) == Some(kind.as_str())
            && target
                .get("isCanAttack")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        if matches {
            if let Some(id) = target.get("id") {
                return Some(id.clone());
            }
        }
    }
    None
}

#[async_trait]
impl Reauthenticate for GameApi {
    async fn relogin(&self) -> Result<bool, SessionError> {
        let tg_web_data = self.derive_web_app_data().await?;
        self.login(&tg_web_data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::miniapp::StaticLaunchUrl;
    use crate::mock_backend::{MockBackend, Reply};

    const TG_WEB_DATA: &str =
        "query_id=AAH1&user=%7B%22id%22%3A1%7D&auth_date=1700000000&hash=deadbeef01";
    // The same payload as it appears inside a launch URL fragment: the value
    // itself is percent-encoded, so `&`/`=` inside it survive extraction.
    const TG_WEB_DATA_ENCODED: &str = "query_id%3DAAH1%26user%3D%257B%2522id%2522%253A1%257D%26auth_date%3D1700000000%26hash%3Ddeadbeef01";

    fn test_session_config() -> SessionConfig {
        serde_json::from_str(
            r#"{
                "api": {"id": 1, "hash": "h"},
                "user_agent": "Mozilla/5.0 Test"
            }"#,
        )
        .unwrap()
    }

    fn test_api(base_url: &str) -> GameApi {
        let settings = Settings {
            api_base: base_url.to_string(),
            ..Settings::default()
        };
        let launch_url = format!("https://t.me/app?x=1#tgWebAppData={}", TG_WEB_DATA_ENCODED);
        GameApi::new(
            &settings,
            "acct1",
            &test_session_config(),
            false,
            Box::new(StaticLaunchUrl::new(launch_url)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn business_failure_is_returned_without_retry() {
        let backend = MockBackend::spawn(|path, _| match path {
            "/quest/main/claim" => Reply::json(r#"{"success":false}"#),
            _ => Reply::success(),
        })
        .await;

        let api = test_api(&backend.base_url);
        let claimed = api.claim_main_quest("build_castle_2").await.unwrap();
        assert!(!claimed);
        assert_eq!(backend.calls_to("/quest/main/claim"), 1);
        assert_eq!(backend.calls_to("/telegram/auth"), 0);
    }

    #[tokio::test]
    async fn auth_status_triggers_one_relogin_and_one_retry() {
        let backend = MockBackend::spawn(|path, nth| match (path, nth) {
            ("/user/data/all", 0) => Reply::status(401),
            ("/user/data/all", _) => Reply::json(r#"{"success":true,"data":{"hero":{}}}"#),
            ("/telegram/auth", _) => Reply::success(),
            _ => Reply::success(),
        })
        .await;

        let api = test_api(&backend.base_url);
        let envelope = api.get_user_data().await.unwrap().unwrap();
        assert!(envelope.success);
        assert_eq!(backend.calls_to("/telegram/auth"), 1);
        assert_eq!(backend.calls_to("/user/data/all"), 2);
    }

    #[tokio::test]
    async fn repeated_auth_failure_is_an_invalid_session() {
        let backend = MockBackend::spawn(|path, _| match path {
            "/user/data/all" => Reply::status(401),
            _ => Reply::success(),
        })
        .await;

        let api = test_api(&backend.base_url);
        let err = api.get_user_data().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidSession(_)));
        assert_eq!(backend.calls_to("/user/data/all"), 2);
    }

    #[tokio::test]
    async fn failed_relogin_is_an_invalid_session() {
        let backend = MockBackend::spawn(|path, _| match path {
            "/user/data/all" => Reply::status(403),
            "/telegram/auth" => Reply::json(r#"{"success":false}"#),
            _ => Reply::success(),
        })
        .await;

        let api = test_api(&backend.base_url);
        let err = api.get_user_data().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidSession(_)));
        assert_eq!(backend.calls_to("/user/data/all"), 1);
    }

    #[tokio::test]
    async fn transport_failures_yield_no_result() {
        let backend = MockBackend::spawn(|path, _| match path {
            "/building/info" => Reply::status(500),
            _ => Reply::success(),
        })
        .await;

        let api = test_api(&backend.base_url);
        assert!(api.building_info().await.unwrap().is_none());
        assert_eq!(backend.calls_to("/building/info"), 1);
    }

    #[tokio::test]
    async fn dynamic_key_falls_back_from_cookie_to_hash_to_empty() {
        let backend = MockBackend::spawn(|path, nth| match (path, nth) {
            // Second auth sets the cookie so the chain can be observed moving.
            ("/telegram/auth", 1) => {
                Reply::success().with_header("Set-Cookie", "user_auth_hash=cookie123; Path=/")
            }
            _ => Reply::success(),
        })
        .await;

        let api = test_api(&backend.base_url);
        assert_eq!(api.dynamic_api_key(), "empty");

        assert!(api.login(TG_WEB_DATA).await.unwrap());
        assert_eq!(api.dynamic_api_key(), "deadbeef01");

        assert!(api.login(TG_WEB_DATA).await.unwrap());
        assert_eq!(api.dynamic_api_key(), "cookie123");
    }

    #[tokio::test]
    async fn login_serializes_auth_payload_in_declared_order() {
        let backend = MockBackend::spawn(|_, _| Reply::success()).await;
        let api = test_api(&backend.base_url);
        assert!(api.login(TG_WEB_DATA).await.unwrap());

        let requests = backend.requests();
        let (path, body) = &requests[0];
        assert_eq!(path, "/telegram/auth");
        assert!(body.starts_with("{\"data\":{\"initData\":"));
        assert!(body.contains("\"platform\":\"android\""));
        assert!(body.contains("\"chatType\":\"sender\""));
        // Not a first run, so no referral parameter rides along.
        assert!(!body.contains("startParam"));
    }

    #[test]
    fn envelope_without_success_flag_is_failure() {
        let envelope = Envelope::from_value(json!({"data": {"x": 1}}));
        assert!(!envelope.success);

        let envelope = Envelope::from_value(json!([1, 2, 3]));
        assert!(!envelope.success);
    }

    #[test]
    fn find_attackable_returns_first_match_in_order() {
        let envelope = Envelope::from_value(json!({
            "success": true,
            "data": {"targets": [
                {"id": 10, "type": "oasis", "isCanAttack": false},
                {"id": 11, "type": "camp", "isCanAttack": true},
                {"id": 12, "type": "oasis", "isCanAttack": true},
                {"id": 13, "type": "oasis", "isCanAttack": true}
            ]}
        }));
        let id = find_attackable(Some(&envelope), TargetKind::Oasis);
        assert_eq!(id, Some(json!(12)));
        let id = find_attackable(Some(&envelope), TargetKind::Camp);
        assert_eq!(id, Some(json!(11)));
    }

    #[test]
    fn find_attackable_returns_none_when_nothing_is_attackable() {
        let envelope = Envelope::from_value(json!({
            "success": true,
            "data": {"targets": [
                {"id": 1, "type": "oasis", "isCanAttack": false},
                {"id": 2, "type": "village"}
            ]}
        }));
        assert_eq!(find_attackable(Some(&envelope), TargetKind::Oasis), None);
        assert_eq!(find_attackable(None, TargetKind::Oasis), None);
    }

    #[test]
    fn ref_id_bucketing_is_deterministic() {
        let a = resolve_ref_id("acct1", "ref_mine");
        let b = resolve_ref_id("acct1", "ref_mine");
        assert_eq!(a, b);
        assert!(a == "ref_mine" || a == FALLBACK_REF_ID);
    }
}
