//! Client classification for login requests.
//!
//! The classifier is a pure function of the explicit hints carried in the
//! request body and the transport metadata the HTTP layer extracted. It never
//! reaches into ambient request state.

use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};

use super::models::SessionFlavor;

/// Length of a derived web device id.
pub const DERIVED_DEVICE_ID_LEN: usize = 16;

const MOBILE_USER_AGENT_MARKERS: [&str; 3] = ["Mobile", "Android", "iPhone"];
const MOBILE_PLATFORMS: [&str; 2] = ["ios", "android"];
const DEFAULT_MOBILE_PLATFORM: &str = "mobile";
const DEFAULT_WEB_PLATFORM: &str = "web";
const DEFAULT_BROWSER_NAME: &str = "Web Browser";

/// What the transport layer knows about the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportMetadata {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl TransportMetadata {
    #[must_use]
    pub fn new(user_agent: Option<String>, ip_address: Option<String>) -> Self {
        Self {
            user_agent: non_blank(user_agent),
            ip_address: non_blank(ip_address),
        }
    }
}

/// Optional device fields supplied by the client itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientHints {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub platform: Option<String>,
    pub app_version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub is_mobile: bool,
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    pub app_version: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl ClientInfo {
    #[must_use]
    pub const fn flavor(&self) -> SessionFlavor {
        if self.is_mobile {
            SessionFlavor::Mobile
        } else {
            SessionFlavor::Web
        }
    }
}

/// Classify a login as mobile or web and fill in every derived field.
///
/// Mobile when any of: a device id is present, a platform is present, the
/// user agent carries a mobile marker, or the platform is `ios`/`android`.
#[must_use]
pub fn classify(hints: &ClientHints, transport: &TransportMetadata) -> ClientInfo {
    let device_id = non_blank(hints.device_id.clone());
    let device_name = non_blank(hints.device_name.clone());
    let platform = non_blank(hints.platform.clone());
    let app_version = non_blank(hints.app_version.clone());
    let user_agent = non_blank(transport.user_agent.clone());
    let ip_address = non_blank(transport.ip_address.clone());

    let ua_is_mobile = user_agent.as_deref().is_some_and(|ua| {
        MOBILE_USER_AGENT_MARKERS
            .iter()
            .any(|marker| ua.contains(marker))
    });
    let platform_is_mobile = platform.as_deref().is_some_and(|value| {
        MOBILE_PLATFORMS
            .iter()
            .any(|known| value.eq_ignore_ascii_case(known))
    });
    let is_mobile = device_id.is_some() || platform.is_some() || ua_is_mobile || platform_is_mobile;

    let ua = user_agent.as_deref().unwrap_or_default();
    let ip = ip_address.as_deref().unwrap_or_default();

    let device_id = device_id.unwrap_or_else(|| derive_device_id(ua, ip));
    let device_name = device_name.unwrap_or_else(|| device_name_from_user_agent(ua).to_string());
    let platform = platform.unwrap_or_else(|| {
        if is_mobile {
            DEFAULT_MOBILE_PLATFORM.to_string()
        } else {
            DEFAULT_WEB_PLATFORM.to_string()
        }
    });

    ClientInfo {
        is_mobile,
        device_id,
        device_name,
        platform,
        app_version,
        user_agent,
        ip_address,
    }
}

/// Deterministic fingerprint: `base64(sha256("{ua}:{ip}"))`, truncated.
///
/// Browsers behind the same NAT with the same user agent collapse to one id.
#[must_use]
pub fn derive_device_id(user_agent: &str, ip_address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{user_agent}:{ip_address}").as_bytes());
    let encoded = Base64::encode_string(&hasher.finalize());
    encoded.chars().take(DERIVED_DEVICE_ID_LEN).collect()
}

/// Coarse browser family from a user agent string.
#[must_use]
pub fn device_name_from_user_agent(user_agent: &str) -> &'static str {
    // Edge also advertises Chrome and Safari, so it must be checked first.
    if user_agent.contains("Edg") {
        "Edge Browser"
    } else if user_agent.contains("Chrome") {
        "Chrome Browser"
    } else if user_agent.contains("Firefox") {
        "Firefox Browser"
    } else if user_agent.contains("Safari") {
        "Safari Browser"
    } else {
        DEFAULT_BROWSER_NAME
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESKTOP_CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
    const DESKTOP_EDGE: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36 Edg/126.0";
    const IPHONE_SAFARI: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 Version/17.0 Mobile/15E148 Safari/604.1";

    fn transport(ua: &str, ip: &str) -> TransportMetadata {
        TransportMetadata::new(Some(ua.to_string()), Some(ip.to_string()))
    }

    #[test]
    fn browser_without_hints_is_web() {
        let info = classify(&ClientHints::default(), &transport(DESKTOP_CHROME, "10.0.0.1"));
        assert!(!info.is_mobile);
        assert_eq!(info.flavor(), SessionFlavor::Web);
        assert_eq!(info.platform, "web");
        assert_eq!(info.device_name, "Chrome Browser");
        assert_eq!(info.device_id.len(), DERIVED_DEVICE_ID_LEN);
        assert_eq!(info.app_version, None);
        assert_eq!(info.ip_address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn explicit_device_id_is_mobile() {
        let hints = ClientHints {
            device_id: Some("install-42".to_string()),
            app_version: Some("3.2.1".to_string()),
            ..ClientHints::default()
        };
        let info = classify(&hints, &transport(DESKTOP_CHROME, "10.0.0.1"));
        assert!(info.is_mobile);
        assert_eq!(info.device_id, "install-42");
        assert_eq!(info.platform, "mobile");
        assert_eq!(info.device_name, "Chrome Browser");
        assert_eq!(info.app_version.as_deref(), Some("3.2.1"));
    }

    #[test]
    fn explicit_platform_is_mobile() {
        let hints = ClientHints {
            platform: Some("Android".to_string()),
            ..ClientHints::default()
        };
        let info = classify(&hints, &TransportMetadata::default());
        assert!(info.is_mobile);
        assert_eq!(info.platform, "Android");
        assert_eq!(info.device_name, "Web Browser");
    }

    #[test]
    fn mobile_user_agent_is_mobile() {
        let info = classify(&ClientHints::default(), &transport(IPHONE_SAFARI, "10.0.0.9"));
        assert!(info.is_mobile);
        assert_eq!(info.device_id, derive_device_id(IPHONE_SAFARI, "10.0.0.9"));
    }

    #[test]
    fn blank_hints_count_as_absent() {
        let hints = ClientHints {
            device_id: Some("   ".to_string()),
            platform: Some(String::new()),
            ..ClientHints::default()
        };
        let info = classify(&hints, &transport(DESKTOP_CHROME, "10.0.0.1"));
        assert!(!info.is_mobile);
    }

    #[test]
    fn derived_device_id_is_deterministic() {
        let first = derive_device_id(DESKTOP_CHROME, "192.168.1.10");
        let second = derive_device_id(DESKTOP_CHROME, "192.168.1.10");
        let other_ip = derive_device_id(DESKTOP_CHROME, "192.168.1.11");
        assert_eq!(first, second);
        assert_ne!(first, other_ip);
        assert_eq!(first.len(), DERIVED_DEVICE_ID_LEN);
    }

    #[test]
    fn device_names_by_family() {
        assert_eq!(device_name_from_user_agent(DESKTOP_EDGE), "Edge Browser");
        assert_eq!(device_name_from_user_agent(DESKTOP_CHROME), "Chrome Browser");
        assert_eq!(
            device_name_from_user_agent("Mozilla/5.0 (X11; Linux) Gecko/20100101 Firefox/128.0"),
            "Firefox Browser"
        );
        assert_eq!(device_name_from_user_agent(IPHONE_SAFARI), "Safari Browser");
        assert_eq!(device_name_from_user_agent("curl/8.0"), "Web Browser");
        assert_eq!(device_name_from_user_agent(""), "Web Browser");
    }
}
