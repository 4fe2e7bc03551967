use async_trait::async_trait;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

/// Client version pinned into every launch URL so the backend's
/// version gating sees a known-good value.
pub const PINNED_WEBAPP_VERSION: &str = "9.0";

/// Mini-app coordinates inside the messaging platform.
pub const APP_NAME: &str = "fomo_fighters_bot";
pub const APP_PATH: &str = "game";

static WEB_APP_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"tgWebAppData=([^&]*)").expect("Failed to compile tgWebAppData regex")
});
static HASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"hash=([a-f0-9]+)").expect("Failed to compile hash regex"));
static USER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"user=([^&]+)").expect("Failed to compile user regex"));

#[derive(Debug)]
pub enum ExtractError {
    NoFragment,
    MissingWebAppData,
    UndecodablePayload,
    UrlParse(url::ParseError),
    Provider(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::NoFragment => write!(f, "No fragment found in launch URL"),
            ExtractError::MissingWebAppData => {
                write!(f, "tgWebAppData not found in URL fragment")
            }
            ExtractError::UndecodablePayload => {
                write!(f, "tgWebAppData could not be percent-decoded")
            }
            ExtractError::UrlParse(e) => write!(f, "Launch URL parsing error: {}", e),
            ExtractError::Provider(msg) => write!(f, "Launch URL provider error: {}", msg),
        }
    }
}

impl std::error::Error for ExtractError {}

impl From<url::ParseError> for ExtractError {
    fn from(err: url::ParseError) -> Self {
        ExtractError::UrlParse(err)
    }
}

/// Source of mini-app launch URLs. The production implementation is the
/// messaging-platform client; anything that can hand back a webview URL for
/// `(app, path, referral)` satisfies it.
#[async_trait]
pub trait LaunchUrlProvider: Send + Sync {
    async fn launch_url(&self, app_name: &str, path: &str, ref_id: &str)
        -> Result<String, ExtractError>;
}

/// Provider that serves a pre-captured launch URL from the account
/// configuration. Stands in for the platform client during development and in
/// tests.
pub struct StaticLaunchUrl {
    url: String,
}

impl StaticLaunchUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl LaunchUrlProvider for StaticLaunchUrl {
    async fn launch_url(
        &self,
        _app_name: &str,
        _path: &str,
        _ref_id: &str,
    ) -> Result<String, ExtractError> {
        if self.url.is_empty() {
            return Err(ExtractError::Provider("no launch URL configured".to_string()));
        }
        Ok(self.url.clone())
    }
}

/// Rewrites `tgWebAppVersion` to `version` in both the query and the
/// fragment. The query value is updated in place (appended when absent); the
/// fragment is only touched where the parameter already occurs. Every other
/// parameter keeps its value and position, so rewriting twice with the same
/// version is a no-op relative to the first rewrite.
pub fn pin_webapp_version(launch_url: &str, version: &str) -> Result<String, ExtractError> {
    let mut parsed = Url::parse(launch_url)?;

    let query = parsed.query().unwrap_or("").to_string();
    let mut parts: Vec<String> = Vec::new();
    let mut replaced = false;
    for part in query.split('&').filter(|p| !p.is_empty()) {
        if part.starts_with("tgWebAppVersion=") {
            parts.push(format!("tgWebAppVersion={}", version));
            replaced = true;
        } else {
            parts.push(part.to_string());
        }
    }
    if !replaced {
        parts.push(format!("tgWebAppVersion={}", version));
    }
    parsed.set_query(Some(&parts.join("&")));

    if let Some(fragment) = parsed.fragment().map(str::to_string) {
        if fragment.contains("tgWebAppVersion=") {
            let rebuilt: Vec<String> = fragment
                .split('&')
                .map(|part| {
                    if part.starts_with("tgWebAppVersion=") {
                        format!("tgWebAppVersion={}", version)
                    } else {
                        part.to_string()
                    }
                })
                .collect();
            parsed.set_fragment(Some(&rebuilt.join("&")));
        }
    }

    Ok(parsed.to_string())
}

/// Recovers the session payload the backend expects at login from a launch
/// URL fragment. Fails when the fragment, the `tgWebAppData` parameter, or a
/// clean percent-decoding of its value is missing.
pub fn extract_web_app_data(launch_url: &str) -> Result<String, ExtractError> {
    let fragment = match launch_url.find('#') {
        Some(idx) => &launch_url[idx + 1..],
        None => return Err(ExtractError::NoFragment),
    };

    let captures = WEB_APP_DATA_RE
        .captures(fragment)
        .ok_or(ExtractError::MissingWebAppData)?;
    let raw = captures.get(1).map(|m| m.as_str()).unwrap_or("");

    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| ExtractError::UndecodablePayload)?;
    Ok(decoded.into_owned())
}

/// Pulls the `hash=` hex run out of a decoded session payload. Empty string
/// when absent; the caller falls back to the next key source.
pub fn extract_hash(init_data: &str) -> String {
    HASH_RE
        .captures(init_data)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Generic `key=value` lookup inside a decoded session payload, URL-decoding
/// the value. Empty string when the key is absent.
pub fn extract_param(init_data: &str, param: &str) -> String {
    let re = match Regex::new(&format!("{}=([^&]+)", regex::escape(param))) {
        Ok(re) => re,
        Err(_) => return String::new(),
    };
    re.captures(init_data)
        .and_then(|c| c.get(1))
        .map(|m| percent_decode_str(m.as_str()).decode_utf8_lossy().into_owned())
        .unwrap_or_default()
}

/// Digs the nested `photo_url` out of the payload's embedded `user` JSON
/// object. Absence or malformation yields an empty string, never an error.
pub fn extract_photo_url(init_data: &str) -> String {
    let raw_user = match USER_RE.captures(init_data).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => return String::new(),
    };
    let user_json = percent_decode_str(raw_user).decode_utf8_lossy().into_owned();
    match serde_json::from_str::<serde_json::Value>(&user_json) {
        Ok(user) => user
            .get("photo_url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_version_replaces_query_value_only() {
        let url = "https://t.me/app?foo=bar&tgWebAppVersion=7.2&baz=qux#frag=1";
        let pinned = pin_webapp_version(url, "9.0").unwrap();
        assert_eq!(pinned, "https://t.me/app?foo=bar&tgWebAppVersion=9.0&baz=qux#frag=1");
    }

    #[test]
    fn pin_version_appends_when_query_lacks_it() {
        let url = "https://t.me/app?foo=bar#x=y";
        let pinned = pin_webapp_version(url, "9.0").unwrap();
        assert_eq!(pinned, "https://t.me/app?foo=bar&tgWebAppVersion=9.0#x=y");
    }

    #[test]
    fn pin_version_rewrites_fragment_occurrence() {
        let url =
            "https://t.me/app?a=1#tgWebAppData=xyz&tgWebAppVersion=7.10&tgWebAppPlatform=web";
        let pinned = pin_webapp_version(url, "9.0").unwrap();
        assert!(pinned.ends_with("#tgWebAppData=xyz&tgWebAppVersion=9.0&tgWebAppPlatform=web"));
    }

    #[test]
    fn pin_version_twice_is_a_no_op() {
        let url = "https://t.me/app?tgWebAppVersion=6.0&k=v#tgWebAppVersion=6.0&d=e";
        let once = pin_webapp_version(url, "9.0").unwrap();
        let twice = pin_webapp_version(&once, "9.0").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn extract_fails_without_fragment() {
        assert!(matches!(
            extract_web_app_data("https://example.com/game?x=1"),
            Err(ExtractError::NoFragment)
        ));
    }

    #[test]
    fn extract_fails_without_web_app_data() {
        assert!(matches!(
            extract_web_app_data("https://example.com/#foo=bar"),
            Err(ExtractError::MissingWebAppData)
        ));
    }

    #[test]
    fn extract_decodes_payload() {
        let data =
            extract_web_app_data("https://example.com/#tgWebAppData=%7B%22a%22%3A1%7D").unwrap();
        assert_eq!(data, "{\"a\":1}");
    }

    #[test]
    fn extract_hash_finds_hex_run() {
        let init = "query_id=abc&user=%7B%7D&hash=0deadbeef123&chat_type=sender";
        assert_eq!(extract_hash(init), "0deadbeef123");
        assert_eq!(extract_hash("no hash here"), "");
    }

    #[test]
    fn extract_param_url_decodes_value() {
        let init = "chat_type=sender&chat_instance=-123456";
        assert_eq!(extract_param(init, "chat_type"), "sender");
        assert_eq!(extract_param(init, "chat_instance"), "-123456");
        assert_eq!(extract_param(init, "missing"), "");
    }

    #[test]
    fn extract_photo_url_tolerates_malformed_user() {
        let init = "user=%7B%22id%22%3A42%2C%22photo_url%22%3A%22https%3A%2F%2Fcdn%2Fp.jpg%22%7D";
        assert_eq!(extract_photo_url(init), "https://cdn/p.jpg");

        assert_eq!(extract_photo_url("user=%7Bnot-json"), "");
        assert_eq!(extract_photo_url("no user field"), "");
    }
}
