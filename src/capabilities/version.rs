//! Semantic versions and version constraints for capability references.
//!
//! A constraint string is a comma-separated conjunction of comparators:
//!
//! ```text
//! ">=1.0.0"        any version from 1.0.0 upward
//! ">=1.0, <2"      1.x only
//! "^1.2"           >=1.2.0, <2.0.0
//! "~1.2.3"         >=1.2.3, <1.3.0
//! "1.0.0"          exactly 1.0.0 (bare version, no operator)
//! "*"              anything
//! ```
//!
//! A bare version without an operator is an exact match. An absent constraint
//! matches every release. Pre-releases are only selected by a constraint that
//! names a pre-release of the same `MAJOR.MINOR.PATCH`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while parsing versions or constraints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    #[error("invalid version constraint '{0}'")]
    InvalidConstraint(String),
}

// ============================================================================
// Version
// ============================================================================

/// A `MAJOR.MINOR.PATCH[-PRE]` semantic version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Pre-release tag without the leading `-` (e.g. `"rc.1"`).
    pub pre: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Parse a full three-part version. Build metadata (`+...`) is ignored.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(VersionError::InvalidVersion(input.to_string())),
            None => (without_build, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(VersionError::InvalidVersion(input.to_string()));
        }
        let numbers = parts
            .iter()
            .map(|p| parse_number(p))
            .collect::<Option<Vec<u64>>>()
            .ok_or_else(|| VersionError::InvalidVersion(input.to_string()))?;

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre,
        })
    }
}

fn parse_number(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Leading zeros are not valid semver, except for a literal "0".
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                // A pre-release sorts before its release.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => compare_pre(a, b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dot-separated identifier comparison: numeric identifiers compare
/// numerically and sort before alphanumeric ones.
fn compare_pre(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// VersionReq
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Exact,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    Caret,
    Tilde,
}

/// A single comparator. `minor`/`patch` are `None` when the constraint gave a
/// partial version such as `^1` or `~1.2`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Option<String>,
}

impl Comparator {
    fn parse(input: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidConstraint(input.to_string());
        let s = input.trim();
        let (op, rest) = if let Some(r) = s.strip_prefix(">=") {
            (Op::GreaterEq, r)
        } else if let Some(r) = s.strip_prefix("<=") {
            (Op::LessEq, r)
        } else if let Some(r) = s.strip_prefix('>') {
            (Op::Greater, r)
        } else if let Some(r) = s.strip_prefix('<') {
            (Op::Less, r)
        } else if let Some(r) = s.strip_prefix('=') {
            (Op::Exact, r)
        } else if let Some(r) = s.strip_prefix('^') {
            (Op::Caret, r)
        } else if let Some(r) = s.strip_prefix('~') {
            (Op::Tilde, r)
        } else {
            (Op::Exact, s)
        };

        let rest = rest.trim();
        let (core, pre) = match rest.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (rest, None),
        };
        let parts: Vec<&str> = core.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }
        let mut numbers = parts.iter().map(|p| parse_number(p));
        let major = numbers.next().flatten().ok_or_else(invalid)?;
        let minor = match numbers.next() {
            Some(n) => Some(n.ok_or_else(invalid)?),
            None => None,
        };
        let patch = match numbers.next() {
            Some(n) => Some(n.ok_or_else(invalid)?),
            None => None,
        };
        if pre.is_some() && patch.is_none() {
            return Err(invalid());
        }

        Ok(Self {
            op,
            major,
            minor,
            patch,
            pre,
        })
    }

    fn floor(&self) -> Version {
        Version {
            major: self.major,
            minor: self.minor.unwrap_or(0),
            patch: self.patch.unwrap_or(0),
            pre: self.pre.clone(),
        }
    }

    /// Exclusive upper bound for partial exact, caret and tilde comparators.
    fn ceiling(&self) -> Version {
        match self.op {
            Op::Caret => {
                if self.major > 0 || self.minor.is_none() {
                    Version::new(self.major + 1, 0, 0)
                } else if self.minor.unwrap_or(0) > 0 || self.patch.is_none() {
                    Version::new(0, self.minor.unwrap_or(0) + 1, 0)
                } else {
                    Version::new(0, 0, self.patch.unwrap_or(0) + 1)
                }
            }
            _ => match (self.minor, self.patch) {
                (None, _) => Version::new(self.major + 1, 0, 0),
                (Some(minor), _) => Version::new(self.major, minor + 1, 0),
            },
        }
    }

    fn admits_pre_of(&self, version: &Version) -> bool {
        self.pre.is_some()
            && self.major == version.major
            && self.minor == Some(version.minor)
            && self.patch == Some(version.patch)
    }

    fn matches(&self, version: &Version) -> bool {
        let floor = self.floor();
        match self.op {
            Op::Exact => {
                if self.patch.is_some() {
                    *version == floor
                } else {
                    *version >= floor && *version < self.ceiling()
                }
            }
            Op::Greater => *version > floor,
            Op::GreaterEq => *version >= floor,
            Op::Less => *version < floor,
            Op::LessEq => *version <= floor,
            Op::Caret | Op::Tilde => *version >= floor && *version < self.ceiling(),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            Op::Exact => "",
            Op::Greater => ">",
            Op::GreaterEq => ">=",
            Op::Less => "<",
            Op::LessEq => "<=",
            Op::Caret => "^",
            Op::Tilde => "~",
        };
        write!(f, "{}{}", op, self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{}", minor)?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{}", patch)?;
        }
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

/// A version constraint. The empty requirement (`*`) matches every version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionReq {
    comparators: Vec<Comparator>,
}

impl VersionReq {
    /// The constraint that matches every version.
    pub const STAR: VersionReq = VersionReq {
        comparators: Vec::new(),
    };

    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::STAR);
        }
        let comparators = trimmed
            .split(',')
            .map(Comparator::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { comparators })
    }

    /// An exact-match constraint for `version`.
    pub fn exact(version: &Version) -> Self {
        Self {
            comparators: vec![Comparator {
                op: Op::Exact,
                major: version.major,
                minor: Some(version.minor),
                patch: Some(version.patch),
                pre: version.pre.clone(),
            }],
        }
    }

    /// Whether `version` satisfies every comparator.
    ///
    /// A pre-release only matches when some comparator names a pre-release
    /// of the same `MAJOR.MINOR.PATCH`, so `^1.0.0` never selects
    /// `2.0.0-alpha.1` and `*` never selects a pre-release at all.
    pub fn matches(&self, version: &Version) -> bool {
        if !self.comparators.iter().all(|c| c.matches(version)) {
            return false;
        }
        version.pre.is_none() || self.comparators.iter().any(|c| c.admits_pre_of(version))
    }

    pub fn is_any(&self) -> bool {
        self.comparators.is_empty()
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.comparators.is_empty() {
            return write!(f, "*");
        }
        let parts: Vec<String> = self.comparators.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl FromStr for VersionReq {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionReq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionReq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VersionReq::parse(&raw).map_err(serde::de::Error::custom)
    }
}
