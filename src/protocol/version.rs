//! Client version numbers.

use std::fmt;
use std::str::FromStr;

/// A client build, ordered component by component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub patch: u32,
}

impl ClientVersion {
    pub const fn new(major: u32, minor: u32, revision: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            patch,
        }
    }

    /// First build that understands the 32-bit supported-features packet.
    pub const EXTENDED_FEATURES: ClientVersion = ClientVersion::new(6, 0, 14, 2);
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.patch
        )
    }
}

/// Version string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed client version string {0:?}")]
pub struct ParseVersionError(String);

impl FromStr for ClientVersion {
    type Err = ParseVersionError;

    /// Accepts `"7.0.15.1"` and the older letter-patch form `"5.0.9a"`,
    /// where `a` is patch 1.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let trimmed = s.trim().to_ascii_lowercase();

        let mut parts = trimmed.splitn(3, '.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let rest = parts.next().ok_or_else(err)?;

        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let revision = rest[..digits].parse().map_err(|_| err())?;

        let suffix = &rest[digits..];
        let patch = match suffix.chars().next() {
            None => 0,
            Some('.') => suffix[1..]
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(err)?,
            Some(c) if c.is_ascii_lowercase() => u32::from(c as u8 - b'a') + 1,
            Some(_) => 0,
        };

        Ok(ClientVersion::new(major, minor, revision, patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted() {
        let v: ClientVersion = "7.0.15.1".parse().unwrap();
        assert_eq!(v, ClientVersion::new(7, 0, 15, 1));
        assert_eq!(v.to_string(), "7.0.15.1");
    }

    #[test]
    fn test_parse_letter_patch() {
        let v: ClientVersion = "5.0.9a".parse().unwrap();
        assert_eq!(v, ClientVersion::new(5, 0, 9, 1));
        let v: ClientVersion = "4.0.11C".parse().unwrap();
        assert_eq!(v.patch, 3);
        let v: ClientVersion = "6.0.1 ".parse().unwrap();
        assert_eq!(v, ClientVersion::new(6, 0, 1, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ClientVersion>().is_err());
        assert!("seven".parse::<ClientVersion>().is_err());
        assert!("7.0".parse::<ClientVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(ClientVersion::new(7, 0, 0, 0) > ClientVersion::EXTENDED_FEATURES);
        assert!(ClientVersion::new(6, 0, 14, 1) < ClientVersion::EXTENDED_FEATURES);
    }
}
