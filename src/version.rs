//! Release versioning policy
//!
//! Versions follow `v?MAJOR.MINOR.PATCH(-PRERELEASE)?`. Ordering differs from
//! strict semver in one place: two prerelease suffixes compare as plain
//! strings.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VaultError};
use crate::frontmatter::FrontMatter;

/// Front matter fields whose change forces a major bump
pub const CRITICAL_FIELDS: &[&str] = &["type", "project"];

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)(?:-([A-Za-z0-9.]+))?$").unwrap())
}

/// A parsed release version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReleaseVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
}

/// Which component to increment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bump {
    Major,
    Minor,
    Patch,
}

impl ReleaseVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
        }
    }

    /// Baseline version for an item's first release
    pub fn baseline() -> Self {
        Self::new(0, 1, 0)
    }

    /// Parse a version string, with or without a leading `v`
    pub fn parse(input: &str) -> Result<Self> {
        let caps = version_pattern()
            .captures(input.trim())
            .ok_or_else(|| VaultError::validation(format!("Invalid version format: {}", input)))?;

        let number = |i: usize| -> Result<u64> {
            caps[i]
                .parse::<u64>()
                .map_err(|_| VaultError::validation(format!("Version component out of range: {}", input)))
        };

        Ok(Self {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            prerelease: caps.get(4).map(|m| m.as_str().to_string()),
        })
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    /// Increment one component; lower components reset and the prerelease is dropped
    pub fn increment(&self, bump: Bump) -> Result<Self> {
        let next = |n: u64| {
            n.checked_add(1)
                .ok_or_else(|| VaultError::validation(format!("Cannot bump {}: component overflows", self)))
        };
        Ok(match bump {
            Bump::Major => Self::new(next(self.major)?, 0, 0),
            Bump::Minor => Self::new(self.major, next(self.minor)?, 0),
            Bump::Patch => Self::new(self.major, self.minor, next(self.patch)?),
        })
    }

    /// Tag-style string, always `v`-prefixed
    pub fn tag_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl FromStr for ReleaseVersion {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ReleaseVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReleaseVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Requested version for a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRequest {
    Auto,
    Exact(ReleaseVersion),
}

impl FromStr for VersionRequest {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            ReleaseVersion::parse(s).map(Self::Exact)
        }
    }
}

/// Version comparison and bump inference
pub struct VersionPolicy;

impl VersionPolicy {
    pub fn parse(version: &str) -> Result<ReleaseVersion> {
        ReleaseVersion::parse(version)
    }

    /// Three-way compare of two version strings: -1, 0 or 1
    pub fn compare(a: &str, b: &str) -> Result<i32> {
        let a = ReleaseVersion::parse(a)?;
        let b = ReleaseVersion::parse(b)?;
        Ok(match a.cmp(&b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        })
    }

    pub fn increment(current: &str, bump: Bump) -> Result<ReleaseVersion> {
        ReleaseVersion::parse(current)?.increment(bump)
    }

    /// Smallest bump justified by the change from `old` to `new`
    pub fn classify(old: &str, new: &str) -> Bump {
        let old = FrontMatter::parse(old);
        let new = FrontMatter::parse(new);

        if CRITICAL_FIELDS
            .iter()
            .any(|field| old.get(field) != new.get(field))
        {
            return Bump::Major;
        }

        if old.labels() != new.labels() || old.section_count() != new.section_count() {
            return Bump::Minor;
        }

        Bump::Patch
    }

    /// Suggest the next version; without a current version this is the baseline
    pub fn suggest(old: &str, new: &str, current: Option<&ReleaseVersion>) -> Result<ReleaseVersion> {
        match current {
            None => Ok(ReleaseVersion::baseline()),
            Some(current) => current.increment(Self::classify(old, new)),
        }
    }

    /// Highest stable version, or the highest overall if none are stable
    pub fn latest_stable<'a, I>(versions: I) -> Option<ReleaseVersion>
    where
        I: IntoIterator<Item = &'a ReleaseVersion>,
    {
        let all: Vec<&ReleaseVersion> = versions.into_iter().collect();
        let stable = all.iter().filter(|v| !v.is_prerelease()).max().copied();
        stable.or_else(|| all.into_iter().max()).cloned()
    }
}
