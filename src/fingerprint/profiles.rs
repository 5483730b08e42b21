//! Browser fingerprint profiles.

use super::http2::Http2Settings;
use super::tls::TlsFingerprint;
use crate::headers::{chrome_131_header_order, chrome_131_headers};

/// Browser fingerprint profile for impersonation.
///
/// Note: Chrome randomizes TLS extension order since v110, so the profile
/// enables extension permutation rather than pinning an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintProfile {
    /// Chrome 131 on macOS.
    #[default]
    Chrome131,
    /// No fingerprinting - use default TLS settings
    None,
}

impl FingerprintProfile {
    /// Get the User-Agent string for this profile.
    pub fn user_agent(&self) -> &'static str {
        match self {
            Self::Chrome131 => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            }
            Self::None => concat!("wraith/", env!("CARGO_PKG_VERSION")),
        }
    }

    /// TLS fingerprint, or `None` for the standard TLS context.
    pub fn tls_fingerprint(&self) -> Option<TlsFingerprint> {
        match self {
            Self::Chrome131 => Some(TlsFingerprint::chrome_131()),
            Self::None => None,
        }
    }

    /// HTTP/2 settings, with the header order set for Chrome.
    pub fn http2_settings(&self) -> Http2Settings {
        match self {
            Self::Chrome131 => Http2Settings::default().header_order(
                chrome_131_header_order()
                    .into_iter()
                    .filter(|h| !matches!(h.as_str(), "Host" | "Connection" | "Transfer-Encoding")),
            ),
            Self::None => Http2Settings::default(),
        }
    }

    /// Default request headers sent with every request.
    pub fn default_headers(&self) -> Vec<(&'static str, &'static str)> {
        match self {
            Self::Chrome131 => chrome_131_headers(),
            Self::None => vec![("User-Agent", self.user_agent()), ("Accept", "*/*")],
        }
    }

    /// HTTP/1.1 header order.
    pub fn header_order(&self) -> Option<Vec<String>> {
        match self {
            Self::Chrome131 => Some(chrome_131_header_order()),
            Self::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_profile_uses_standard_tls() {
        assert!(FingerprintProfile::None.tls_fingerprint().is_none());
        assert!(FingerprintProfile::None.header_order().is_none());
        assert!(FingerprintProfile::None.user_agent().starts_with("wraith/"));
    }

    #[test]
    fn test_chrome_profile_carries_h2_order() {
        let s = FingerprintProfile::Chrome131.http2_settings();
        assert_eq!(s.header_order.as_ref().map(|o| o[0].as_str()), Some("Content-Length"));
    }
}
