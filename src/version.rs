//! Driver versions and the ranges over which a structure layout applies

use crate::error::AbiError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Installed or negotiated driver version, e.g. `535.104.05`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DriverVersion {
    /// Major version (branch), e.g. 535
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch level
    pub patch: u32,
}

impl DriverVersion {
    /// Lowest representable version
    pub const MIN: DriverVersion = DriverVersion::new(0, 0, 0);

    /// Create a version from its components
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for DriverVersion {
    type Err = AbiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(AbiError::InvalidVersion(s.to_string()));
        }

        let parse = |p: &str| p.parse::<u32>().map_err(|_| AbiError::InvalidVersion(s.to_string()));
        let major = parse(parts[0])?;
        let minor = parse(parts[1])?;
        let patch = match parts.get(2) {
            Some(p) => parse(p)?,
            None => 0,
        };

        Ok(Self::new(major, minor, patch))
    }
}

impl TryFrom<String> for DriverVersion {
    type Error = AbiError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DriverVersion> for String {
    fn from(v: DriverVersion) -> Self {
        v.to_string()
    }
}

impl fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{:02}", self.major, self.minor, self.patch)
    }
}

/// Half-open interval `[min, max)` of driver versions
///
/// A range without `max` extends to every later version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    /// First version covered
    pub min: DriverVersion,
    /// First version no longer covered
    pub max: Option<DriverVersion>,
}

impl VersionRange {
    /// Range covering `[min, max)`
    pub const fn new(min: DriverVersion, max: DriverVersion) -> Self {
        Self { min, max: Some(max) }
    }

    /// Range covering `min` and everything after it
    pub const fn since(min: DriverVersion) -> Self {
        Self { min, max: None }
    }

    /// Whether `version` falls inside this range
    pub fn contains(&self, version: DriverVersion) -> bool {
        version >= self.min && self.max.map_or(true, |max| version < max)
    }

    /// Whether any version lies in both ranges
    pub fn overlaps(&self, other: &VersionRange) -> bool {
        let starts_before = |a: &VersionRange, b: &VersionRange| a.max.map_or(true, |max| b.min < max);
        starts_before(self, other) && starts_before(other, self)
    }

    /// Empty ranges can never be resolved
    pub fn is_empty(&self) -> bool {
        self.max.map_or(false, |max| max <= self.min)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "[{}, {})", self.min, max),
            None => write!(f, "[{}, ∞)", self.min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_display() {
        let v: DriverVersion = "535.104.05".parse().unwrap();
        assert_eq!(v, DriverVersion::new(535, 104, 5));
        assert_eq!(v.to_string(), "535.104.05");

        let v: DriverVersion = "550.40".parse().unwrap();
        assert_eq!(v, DriverVersion::new(550, 40, 0));

        assert!("550".parse::<DriverVersion>().is_err());
        assert!("550.x.1".parse::<DriverVersion>().is_err());
        assert!("1.2.3.4".parse::<DriverVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(DriverVersion::new(535, 104, 5) < DriverVersion::new(550, 40, 7));
        assert!(DriverVersion::new(550, 40, 7) < DriverVersion::new(550, 54, 14));
        assert!(DriverVersion::new(550, 40, 6) < DriverVersion::new(550, 40, 7));
    }

    #[test]
    fn test_range_contains_is_half_open() {
        let range = VersionRange::new(DriverVersion::new(525, 60, 13), DriverVersion::new(550, 40, 7));
        assert!(range.contains(DriverVersion::new(525, 60, 13)));
        assert!(range.contains(DriverVersion::new(535, 104, 5)));
        assert!(!range.contains(DriverVersion::new(550, 40, 7)));
        assert!(!range.contains(DriverVersion::new(470, 0, 0)));

        let open = VersionRange::since(DriverVersion::new(550, 40, 7));
        assert!(open.contains(DriverVersion::new(999, 0, 0)));
    }

    #[test]
    fn test_overlaps() {
        let a = VersionRange::new(DriverVersion::new(1, 0, 0), DriverVersion::new(2, 0, 0));
        let b = VersionRange::since(DriverVersion::new(2, 0, 0));
        let c = VersionRange::since(DriverVersion::new(1, 5, 0));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_serde_as_string() {
        let v = DriverVersion::new(550, 40, 7);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"550.40.07\"");
        let back: DriverVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
