//! Protocol version negotiated by the open request.
//!
//! On the wire a version is a `"major.minor"` string. A client may omit it,
//! in which case it is assumed to speak [`ProtocolVersion::CURRENT`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version spoken by this server.
    pub const CURRENT: ProtocolVersion = ProtocolVersion::new(1, 0);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether a server speaking `self` can serve a client speaking `client`.
    ///
    /// Majors must agree, and the client may not rely on minor revisions the
    /// server has not caught up with.
    pub fn accepts(&self, client: &ProtocolVersion) -> bool {
        self.major == client.major && client.minor <= self.minor
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidFormat(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.to_string()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VersionError {
    #[error("invalid protocol version {0:?}, expected \"major.minor\"")]
    InvalidFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("2.13".parse::<ProtocolVersion>(), Ok(ProtocolVersion::new(2, 13)));
        for bad in ["1", "1.0.0", "one.two", "", ".1"] {
            assert!(bad.parse::<ProtocolVersion>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_accepts_older_minor_only() {
        let server = ProtocolVersion::new(1, 2);

        assert!(server.accepts(&ProtocolVersion::new(1, 0)));
        assert!(server.accepts(&ProtocolVersion::new(1, 2)));
        assert!(!server.accepts(&ProtocolVersion::new(1, 3)));
        assert!(!server.accepts(&ProtocolVersion::new(2, 0)));
        assert!(!server.accepts(&ProtocolVersion::new(0, 9)));
    }

    #[test]
    fn test_wire_form_is_a_string() {
        let json = serde_json::to_string(&ProtocolVersion::new(1, 4)).unwrap();
        assert_eq!(json, "\"1.4\"");

        let err = serde_json::from_str::<ProtocolVersion>("\"latest\"").unwrap_err();
        assert!(err.to_string().contains("latest"));
    }
}
