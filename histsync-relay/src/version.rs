//! Client version parsing and capability negotiation.
//!
//! Clients send `X-Histsync-Version: v0.<minor>`. Versions are compared as a
//! plain (major, minor) ordinal pair, not as semver.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Last client version that only understands a bare submit acknowledgement.
pub const LAST_BARE_SUBMIT_VERSION: ClientVersion = ClientVersion::new(0, 221);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientVersion {
    pub major: u32,
    pub minor: u32,
}

impl ClientVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse a version string containing exactly one `v<major>.<minor>` token.
    pub fn parse(s: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| Regex::new(r"v(\d+)[.](\d+)").expect("static regex"));

        let mut matches = re.captures_iter(s);
        let caps = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
        })
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// Optional protocol features a client is able to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCapabilities {
    /// Submit responses carry pending dump and deletion requests.
    pub structured_submit_response: bool,
}

impl ClientCapabilities {
    /// Negotiate capabilities from the raw version header.
    ///
    /// Unparseable versions (development builds report `v0.Unknown`) get every
    /// capability.
    pub fn from_version_header(raw: &str) -> Self {
        let structured_submit_response = match ClientVersion::parse(raw) {
            Some(v) => v > LAST_BARE_SUBMIT_VERSION,
            None => true,
        };
        Self {
            structured_submit_response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_strings() {
        assert_eq!(ClientVersion::parse("v0.221"), Some(ClientVersion::new(0, 221)));
        assert_eq!(ClientVersion::parse("v1.2"), Some(ClientVersion::new(1, 2)));
        assert_eq!(ClientVersion::parse("v0.Unknown"), None);
        assert_eq!(ClientVersion::parse(""), None);
        assert_eq!(ClientVersion::parse("v0.1 v0.2"), None);
    }

    #[test]
    fn ordinal_ordering() {
        assert!(ClientVersion::new(1, 0) > ClientVersion::new(0, 999));
        assert!(ClientVersion::new(0, 222) > ClientVersion::new(0, 221));
        assert!(ClientVersion::new(0, 9) < ClientVersion::new(0, 10));
        assert_eq!(ClientVersion::new(0, 221).to_string(), "v0.221");
    }

    #[test]
    fn structured_response_gate() {
        assert!(!ClientCapabilities::from_version_header("v0.221").structured_submit_response);
        assert!(!ClientCapabilities::from_version_header("v0.100").structured_submit_response);
        assert!(ClientCapabilities::from_version_header("v0.222").structured_submit_response);
        assert!(ClientCapabilities::from_version_header("v0.Unknown").structured_submit_response);
        assert!(ClientCapabilities::from_version_header("").structured_submit_response);
    }
}
