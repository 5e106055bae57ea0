//! Device fingerprint derivation from request headers and client signals.
//!
//! Fingerprints identify a device/browser combination without any PII.
//! The fast variant hashes coarse, stable request headers; the enhanced
//! variant additionally folds in client-reported signals. Neither variant
//! includes the client IP, so a fingerprint survives network changes.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Delimiter between fingerprint components. Components are hashed in a
/// fixed order so the result is reproducible across processes.
const COMPONENT_DELIMITER: &str = "|";

/// The ordered header values a fast fingerprint is derived from.
///
/// Missing headers degrade to empty strings rather than failing, so a
/// fingerprint can always be computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeaderComponents {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub accept_encoding: String,
}

impl HeaderComponents {
    /// Extract fingerprint components from request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        Self {
            user_agent: get("user-agent"),
            accept: get("accept"),
            accept_language: get("accept-language"),
            accept_encoding: get("accept-encoding"),
        }
    }
}

/// Classify the browser family by substring matching on the user agent.
///
/// Order matters: Edge and Opera embed "Chrome" in their user agents, and
/// Chrome embeds "Safari".
pub fn browser_family(user_agent: &str) -> &'static str {
    let ua = user_agent.to_ascii_lowercase();
    if ua.contains("edg/") || ua.contains("edge") {
        "edge"
    } else if ua.contains("opr/") || ua.contains("opera") {
        "opera"
    } else if ua.contains("chrome") || ua.contains("crios") {
        "chrome"
    } else if ua.contains("firefox") || ua.contains("fxios") {
        "firefox"
    } else if ua.contains("safari") {
        "safari"
    } else if ua.contains("msie") || ua.contains("trident") {
        "ie"
    } else {
        "other"
    }
}

/// Classify the operating system family by substring matching on the user agent.
pub fn os_family(user_agent: &str) -> &'static str {
    let ua = user_agent.to_ascii_lowercase();
    if ua.contains("windows") {
        "windows"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "ios"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "macos"
    } else if ua.contains("android") {
        "android"
    } else if ua.contains("linux") {
        "linux"
    } else {
        "other"
    }
}

/// Compute the fast device fingerprint.
///
/// Pure function of the header components plus the derived browser and OS
/// families. Deliberately excludes the client IP and any per-request value:
/// determinism across requests from the same device is the entire point.
pub fn fast_fingerprint(components: &HeaderComponents) -> String {
    let parts = [
        components.user_agent.as_str(),
        components.accept.as_str(),
        components.accept_language.as_str(),
        components.accept_encoding.as_str(),
        browser_family(&components.user_agent),
        os_family(&components.user_agent),
    ];
    sha256_hex(&parts.join(COMPONENT_DELIMITER))
}

/// Optional client-reported signals for the enhanced fingerprint.
///
/// Every field defaults to an empty string when absent so the hash is
/// deterministic regardless of which signals the client supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientSignals {
    pub screen_resolution: String,
    pub color_depth: String,
    pub timezone: String,
    pub timezone_offset: String,
    pub platform: String,
    pub hardware_concurrency: String,
    pub device_memory: String,
    pub canvas_hash: String,
    pub webgl_hash: String,
    pub audio_hash: String,
    pub fonts_hash: String,
    pub touch_support: String,
    pub language: String,
    pub plugins_hash: String,
}

impl ClientSignals {
    /// Signal values in their fixed hashing order.
    fn ordered(&self) -> [&str; 14] {
        [
            &self.screen_resolution,
            &self.color_depth,
            &self.timezone,
            &self.timezone_offset,
            &self.platform,
            &self.hardware_concurrency,
            &self.device_memory,
            &self.canvas_hash,
            &self.webgl_hash,
            &self.audio_hash,
            &self.fonts_hash,
            &self.touch_support,
            &self.language,
            &self.plugins_hash,
        ]
    }

    /// Whether the client reported anything at all.
    pub fn is_empty(&self) -> bool {
        self.ordered().iter().all(|s| s.is_empty())
    }
}

/// Compute the enhanced fingerprint from the fast components plus client
/// signals. Computed asynchronously after the initial response and merged
/// into the session record; never required for session validity.
pub fn enhanced_fingerprint(components: &HeaderComponents, signals: &ClientSignals) -> String {
    let mut parts = vec![
        components.user_agent.as_str(),
        components.accept.as_str(),
        components.accept_language.as_str(),
        components.accept_encoding.as_str(),
        browser_family(&components.user_agent),
        os_family(&components.user_agent),
    ];
    parts.extend(signals.ordered());
    sha256_hex(&parts.join(COMPONENT_DELIMITER))
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
