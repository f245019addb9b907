//! Semantic version extraction from free-form server banners.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static SEMVER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("valid semver pattern"));

/// A `major.minor.micro` triple. Ordering is lexicographic on the fields,
/// which is what compatibility checks need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
}

impl SemVer {
    pub const fn new(major: u64, minor: u64, micro: u64) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// Returned when no `X.Y.Z` pattern is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemVerError {
    pub input: String,
}

impl fmt::Display for SemVerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no semantic version found in {:?}", self.input)
    }
}

impl std::error::Error for SemVerError {}

/// Parse the first `X.Y.Z` substring out of an arbitrary string, e.g.
/// `"nats-server v2.10.22-beta"`.
pub fn parse_semver(s: &str) -> Result<SemVer, SemVerError> {
    let err = || SemVerError {
        input: s.to_string(),
    };
    let caps = SEMVER.captures(s).ok_or_else(err)?;
    let field = |i: usize| caps[i].parse::<u64>().map_err(|_| err());
    Ok(SemVer {
        major: field(1)?,
        minor: field(2)?,
        micro: field(3)?,
    })
}
