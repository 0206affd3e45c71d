//! Partial `major[.minor[.micro]]` service versions.
//!
//! Unspecified components are absent rather than zero, so `"1"` matches any
//! `1.x.y` while still ordering below `1.0`.

use crate::{HostError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ServiceVersion {
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub micro: Option<u32>,
}

impl ServiceVersion {
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major: Some(major),
            minor: Some(minor),
            micro: Some(micro),
        }
    }

    /// The unconstrained version ("any").
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_any(&self) -> bool {
        self.major.is_none()
    }

    /// Parse a version string. The empty string is "any".
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::any());
        }

        let mut parts = s.split('.');
        let mut component = || -> Result<Option<u32>> {
            match parts.next() {
                None => Ok(None),
                Some(p) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => p
                    .parse()
                    .map(Some)
                    .map_err(|_| HostError::InvalidVersion(s.to_string())),
                Some(_) => Err(HostError::InvalidVersion(s.to_string())),
            }
        };

        let major = component()?;
        let minor = component()?;
        let micro = component()?;
        if parts.next().is_some() {
            return Err(HostError::InvalidVersion(s.to_string()));
        }
        Ok(Self {
            major,
            minor,
            micro,
        })
    }

    /// True when every component present on both sides is equal.
    pub fn matches(&self, other: &ServiceVersion) -> bool {
        fn agree(a: Option<u32>, b: Option<u32>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        agree(self.major, other.major)
            && agree(self.minor, other.minor)
            && agree(self.micro, other.micro)
    }

    /// Whether `current` should replace `got` as the best candidate for a
    /// request of `want` with lower bound `want_min`.
    pub fn is_newer_match(
        current: &ServiceVersion,
        got: &ServiceVersion,
        want: &ServiceVersion,
        want_min: &ServiceVersion,
    ) -> bool {
        current >= got && current.matches(want) && current >= want_min
    }
}

impl Ord for ServiceVersion {
    // `None < Some(_)`, which orders absent components below every number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.micro.cmp(&other.micro))
    }
}

impl PartialOrd for ServiceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(major) = self.major {
            write!(f, "{}", major)?;
            if let Some(minor) = self.minor {
                write!(f, ".{}", minor)?;
                if let Some(micro) = self.micro {
                    write!(f, ".{}", micro)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for ServiceVersion {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<&semver::Version> for ServiceVersion {
    fn from(v: &semver::Version) -> Self {
        let clamp = |n: u64| u32::try_from(n).unwrap_or(u32::MAX);
        Self::new(clamp(v.major), clamp(v.minor), clamp(v.patch))
    }
}

impl Serialize for ServiceVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServiceVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ServiceVersion {
        ServiceVersion::parse(s).unwrap()
    }

    #[test]
    fn test_parse_partial_versions() {
        assert_eq!(v("1.2.3"), ServiceVersion::new(1, 2, 3));
        assert_eq!(v("4").minor, None);
        assert!(v("").is_any());
        assert_eq!(v("1.2").to_string(), "1.2");
        assert_eq!(v("").to_string(), "");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["a", "1.", ".1", "1..2", "1.2.3.4", "1.x", "-1", "1.2.3b"] {
            assert!(ServiceVersion::parse(bad).is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_absent_components_order_low() {
        assert!(v("1") < v("1.0"));
        assert!(v("1.0") < v("1.0.0"));
        assert!(v("") < v("0"));
        assert!(v("2") > v("1.9.9"));
    }

    #[test]
    fn test_matches_ignores_absent() {
        assert!(v("1.2.3").matches(&v("1")));
        assert!(v("1.2.3").matches(&v("")));
        assert!(!v("1.2.3").matches(&v("1.3")));
        assert!(v("1").matches(&v("1.3")));
    }

    #[test]
    fn test_is_newer_match() {
        let any = ServiceVersion::any();
        assert!(ServiceVersion::is_newer_match(&v("1.0.0"), &any, &any, &any));
        assert!(!ServiceVersion::is_newer_match(&v("1.0.0"), &v("1.1.0"), &any, &any));
        assert!(!ServiceVersion::is_newer_match(&v("2.0.0"), &any, &v("1"), &any));
        assert!(!ServiceVersion::is_newer_match(&v("1.0.0"), &any, &any, &v("1.0.1")));
        assert!(ServiceVersion::is_newer_match(&v("1.4.2"), &v("1.3.0"), &v("1"), &v("1.2")));
    }

    #[test]
    fn test_from_semver() {
        let sv = semver::Version::parse("3.1.4").unwrap();
        assert_eq!(ServiceVersion::from(&sv), ServiceVersion::new(3, 1, 4));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("2.0.1")).unwrap();
        assert_eq!(json, "\"2.0.1\"");
        let back: ServiceVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v("2.0.1"));
    }
}
