// Package Versions
// Lenient version parsing on top of semver

use crate::resolver::ResolveError;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A package version as written in a constraint or lock file.
///
/// Ecosystem versions are frequently shorter than semver's three components
/// (`1.21`, `3`) or zero-padded (`2023.07.22`), so components are read as
/// integers and padded for ordering while the original text is kept for
/// installers. Python post-releases (`1.0.post1`) rank above their base.
#[derive(Debug, Clone)]
pub struct PackageVersion {
    raw: String,
    version: semver::Version,
    post: Option<u64>,
}

impl PackageVersion {
    /// Parse a version, padding missing minor/patch components.
    pub fn parse(input: &str) -> Result<Self, ResolveError> {
        let raw = input.trim();
        let invalid = || ResolveError::InvalidVersion {
            input: raw.to_string(),
        };
        let trimmed = raw.strip_prefix('v').unwrap_or(raw);

        let core_len = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (core, suffix) = trimmed.split_at(core_len);
        let core = core.trim_end_matches('.');

        let parts: Vec<&str> = core.split('.').collect();
        if core.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }
        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }

        let mut version = semver::Version::new(numbers[0], numbers[1], numbers[2]);
        let mut post = None;

        let (suffix, build) = match suffix.split_once('+') {
            Some((suffix, build)) => (suffix, Some(build)),
            None => (suffix, None),
        };
        if let Some(build) = build {
            version.build = semver::BuildMetadata::new(build).map_err(|_| invalid())?;
        }

        let marker = suffix.trim_start_matches(|c| c == '.' || c == '-');
        if let Some(number) = marker.strip_prefix("post") {
            let number = number.trim_start_matches('.');
            post = Some(if number.is_empty() {
                0
            } else {
                number.parse().map_err(|_| invalid())?
            });
        } else if !marker.is_empty() {
            // Python-style pre-release markers (`2.0rc1`)
            version.pre = semver::Prerelease::new(marker).map_err(|_| invalid())?;
        }

        Ok(Self {
            raw: raw.to_string(),
            version,
            post,
        })
    }

    /// The version text exactly as declared.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The padded semver form used for ordering.
    pub fn semver(&self) -> &semver::Version {
        &self.version
    }

    /// Post-release number, if any.
    pub fn post(&self) -> Option<u64> {
        self.post
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PackageVersion {}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp_precedence(&other.version)
            .then_with(|| self.post.cmp(&other.post))
    }
}

impl Hash for PackageVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version.major.hash(state);
        self.version.minor.hash(state);
        self.version.patch.hash(state);
        self.version.pre.hash(state);
        self.post.hash(state);
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for PackageVersion {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PackageVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for PackageVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Unquoted YAML versions such as `1.5` arrive as numbers
        let value = serde_yaml::Value::deserialize(deserializer)?;
        let text = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a version string, found {:?}",
                    other
                )))
            }
        };
        PackageVersion::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pads_short_versions() {
        let v = PackageVersion::parse("1.2").unwrap();
        assert_eq!(v.semver(), &semver::Version::new(1, 2, 0));
        assert_eq!(v.as_str(), "1.2");

        let v = PackageVersion::parse("3").unwrap();
        assert_eq!(v.semver(), &semver::Version::new(3, 0, 0));
    }

    #[test]
    fn test_ordering_ignores_padding() {
        let a = PackageVersion::parse("1.5").unwrap();
        let b = PackageVersion::parse("1.5.0").unwrap();
        let c = PackageVersion::parse("1.10").unwrap();
        assert_eq!(a, b);
        assert!(a < c);
    }

    #[test]
    fn test_prerelease_suffix() {
        let rc = PackageVersion::parse("2.0rc1").unwrap();
        let release = PackageVersion::parse("2.0").unwrap();
        assert!(rc < release);
        assert_eq!(rc.to_string(), "2.0rc1");
    }

    #[test]
    fn test_zero_padded_parts() {
        let v = PackageVersion::parse("2023.07.22").unwrap();
        assert_eq!(v.semver(), &semver::Version::new(2023, 7, 22));
        assert_eq!(v.as_str(), "2023.07.22");
        assert_eq!(v, PackageVersion::parse("2023.7.22").unwrap());
    }

    #[test]
    fn test_post_release_ranks_above_base() {
        let base = PackageVersion::parse("1.0").unwrap();
        let post = PackageVersion::parse("1.0.post1").unwrap();
        let post2 = PackageVersion::parse("1.0.post2").unwrap();
        let next = PackageVersion::parse("1.0.1").unwrap();

        assert_eq!(post.post(), Some(1));
        assert!(base < post);
        assert!(post < post2);
        assert!(post2 < next);
        assert_eq!(post.to_string(), "1.0.post1");
    }

    #[test]
    fn test_build_metadata_does_not_order() {
        let a = PackageVersion::parse("1.2.3+local").unwrap();
        let b = PackageVersion::parse("1.2.3").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(PackageVersion::parse("").is_err());
        assert!(PackageVersion::parse("latest").is_err());
        assert!(PackageVersion::parse("1.2.3.4").is_err());
        assert!(PackageVersion::parse("1..2").is_err());
    }

    #[test]
    fn test_deserialize_unquoted_number() {
        let v: PackageVersion = serde_yaml::from_str("1.5").unwrap();
        assert_eq!(v.semver(), &semver::Version::new(1, 5, 0));
    }
}
