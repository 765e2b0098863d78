//! Semantic versioning parser and constraint matching
//!
//! Strict semver: `MAJOR.MINOR.PATCH` with optional `-prerelease` and
//! `+build` parts. Missing minor/patch default to zero. Build metadata is
//! carried but ignored for ordering.

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Errors from version and constraint parsing
#[derive(Debug, Error)]
pub enum SemverError {
    /// Invalid version format
    #[error("Invalid version: {0}")]
    InvalidVersion(String),
}

/// Semantic version (MAJOR.MINOR.PATCH, optional prerelease and build)
///
/// Equality and ordering follow semver precedence: build metadata is
/// carried but never compared.
#[derive(Debug, Clone)]
pub struct Version {
    /// Major version
    pub major: u64,
    /// Minor version
    pub minor: u64,
    /// Patch version
    pub patch: u64,
    /// Prerelease identifiers (the part after `-`)
    pub prerelease: Option<String>,
    /// Build metadata (the part after `+`), ignored for ordering
    pub build: Option<String>,
}

fn parse_numeric_component(s: &str, what: &str, full: &str) -> Result<u64, SemverError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SemverError::InvalidVersion(format!(
            "{} component '{}' in '{}' is not a number",
            what, s, full
        )));
    }
    if s.len() > 1 && s.starts_with('0') {
        return Err(SemverError::InvalidVersion(format!(
            "{} component '{}' in '{}' has a leading zero",
            what, s, full
        )));
    }
    s.parse()
        .map_err(|_| SemverError::InvalidVersion(format!("{} component overflow in '{}'", what, full)))
}

impl Version {
    /// Create a version without prerelease or build parts
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Parse a version string
    ///
    /// `1`, `1.2`, and `1.2.3` are all accepted; missing components default
    /// to zero. Components must be plain non-negative integers with no
    /// leading zeroes.
    pub fn parse(s: &str) -> Result<Self, SemverError> {
        let input = s.trim();
        if input.is_empty() {
            return Err(SemverError::InvalidVersion("empty version".into()));
        }

        let (version_part, build) = match input.split_once('+') {
            Some((v, b)) if !b.is_empty() => (v, Some(b.to_string())),
            Some(_) => {
                return Err(SemverError::InvalidVersion(format!(
                    "empty build metadata in '{}'",
                    input
                )))
            }
            None => (input, None),
        };

        let (core, prerelease) = match version_part.split_once('-') {
            Some((v, p)) if !p.is_empty() => (v, Some(p.to_string())),
            Some(_) => {
                return Err(SemverError::InvalidVersion(format!(
                    "empty prerelease in '{}'",
                    input
                )))
            }
            None => (version_part, None),
        };

        if let Some(ref pre) = prerelease {
            for id in pre.split('.') {
                if id.is_empty()
                    || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
                {
                    return Err(SemverError::InvalidVersion(format!(
                        "invalid prerelease identifier '{}' in '{}'",
                        id, input
                    )));
                }
            }
        }

        let parts: Vec<&str> = core.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(SemverError::InvalidVersion(format!(
                "expected MAJOR[.MINOR[.PATCH]], got '{}'",
                input
            )));
        }

        let major = parse_numeric_component(parts[0], "major", input)?;
        let minor = parts
            .get(1)
            .map(|p| parse_numeric_component(p, "minor", input))
            .transpose()?
            .unwrap_or(0);
        let patch = parts
            .get(2)
            .map(|p| parse_numeric_component(p, "patch", input))
            .transpose()?
            .unwrap_or(0);

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
            build,
        })
    }

    /// Whether this version carries a prerelease part
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    fn core_cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
    }
}

/// Compare dot-separated prerelease identifier lists per the semver rule:
/// numeric identifiers compare numerically and sort below alphanumeric ones,
/// and a shorter list that is a prefix of a longer one sorts first.
fn prerelease_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let core = self.core_cmp(other);
        if core != Ordering::Equal {
            return core;
        }
        // A prerelease sorts below the same version without one.
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => prerelease_cmp(a, b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

/// The shape of a version constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Exactly the stated version
    Exact(Version),
    /// At least the stated version
    Min(Version),
    /// At most the stated version
    Max(Version),
    /// Inclusive on both bounds
    Range(Version, Version),
    /// Same major, at least the stated version
    CompatibleMajor(Version),
}

/// A version constraint with its prerelease opt-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    /// The constraint shape
    pub kind: ConstraintKind,
    /// Whether prerelease versions may satisfy this constraint even without
    /// the resolver-wide allow-prerelease flag
    pub allow_prerelease: bool,
}

impl VersionConstraint {
    /// Build a constraint with prereleases excluded
    pub fn new(kind: ConstraintKind) -> Self {
        Self {
            kind,
            allow_prerelease: false,
        }
    }

    /// Build a constraint that accepts prereleases
    pub fn with_prerelease(kind: ConstraintKind) -> Self {
        Self {
            kind,
            allow_prerelease: true,
        }
    }

    /// Whether `version` satisfies this constraint
    ///
    /// Prereleases only match when this constraint opts in or the resolver's
    /// global flag is set.
    pub fn matches(&self, version: &Version, global_allow_prerelease: bool) -> bool {
        if version.is_prerelease() && !(self.allow_prerelease || global_allow_prerelease) {
            return false;
        }
        match &self.kind {
            ConstraintKind::Exact(v) => version == v,
            ConstraintKind::Min(v) => version >= v,
            ConstraintKind::Max(v) => version <= v,
            ConstraintKind::Range(lo, hi) => version >= lo && version <= hi,
            ConstraintKind::CompatibleMajor(v) => version.major == v.major && version >= v,
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConstraintKind::Exact(v) => write!(f, "={}", v),
            ConstraintKind::Min(v) => write!(f, ">={}", v),
            ConstraintKind::Max(v) => write!(f, "<={}", v),
            ConstraintKind::Range(lo, hi) => write!(f, "{}..={}", lo, hi),
            ConstraintKind::CompatibleMajor(v) => write!(f, "^{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 2, 3));
        assert!(v.prerelease.is_none());
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(Version::parse("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(Version::parse("1.5").unwrap(), Version::new(1, 5, 0));
    }

    #[test]
    fn test_parse_prerelease_and_build() {
        let v = Version::parse("1.0.0-alpha.1+build.7").unwrap();
        assert_eq!(v.prerelease.as_deref(), Some("alpha.1"));
        assert_eq!(v.build.as_deref(), Some("build.7"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "a.b.c", "1.2.3.4", "1.02.3", "01.0.0", "1.2.-3", "1.0.0-", "1.0.0+"] {
            assert!(Version::parse(bad).is_err(), "accepted '{}'", bad);
        }
    }

    #[test]
    fn test_ordering() {
        let parse = |s| Version::parse(s).unwrap();
        assert!(parse("1.0.0") < parse("1.0.1"));
        assert!(parse("1.9.0") < parse("1.10.0"));
        assert!(parse("1.0.0") < parse("2.0.0"));
        // Prerelease sorts below the release.
        assert!(parse("1.0.0-alpha") < parse("1.0.0"));
        // Standard semver prerelease chain.
        assert!(parse("1.0.0-alpha") < parse("1.0.0-alpha.1"));
        assert!(parse("1.0.0-alpha.1") < parse("1.0.0-alpha.beta"));
        assert!(parse("1.0.0-alpha.beta") < parse("1.0.0-beta.2"));
        assert!(parse("1.0.0-beta.2") < parse("1.0.0-beta.11"));
        assert!(parse("1.0.0-rc.1") < parse("1.0.0"));
        // Build metadata is ignored.
        assert_eq!(
            parse("1.0.0+linux").cmp(&parse("1.0.0+macos")),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn test_constraints() {
        let parse = |s| Version::parse(s).unwrap();
        let exact = VersionConstraint::new(ConstraintKind::Exact(parse("1.2.3")));
        assert!(exact.matches(&parse("1.2.3"), false));
        assert!(!exact.matches(&parse("1.2.4"), false));

        let min = VersionConstraint::new(ConstraintKind::Min(parse("1.2.0")));
        assert!(min.matches(&parse("1.2.0"), false));
        assert!(min.matches(&parse("2.0.0"), false));
        assert!(!min.matches(&parse("1.1.9"), false));

        let max = VersionConstraint::new(ConstraintKind::Max(parse("2.0.0")));
        assert!(max.matches(&parse("2.0.0"), false));
        assert!(!max.matches(&parse("2.0.1"), false));

        let range = VersionConstraint::new(ConstraintKind::Range(parse("1.0.0"), parse("1.5.0")));
        assert!(range.matches(&parse("1.0.0"), false));
        assert!(range.matches(&parse("1.5.0"), false));
        assert!(!range.matches(&parse("1.5.1"), false));
    }

    #[test]
    fn test_compatible_major() {
        let parse = |s| Version::parse(s).unwrap();
        let compat = VersionConstraint::new(ConstraintKind::CompatibleMajor(parse("1.2.5")));
        assert!(compat.matches(&parse("1.3.0"), false));
        assert!(compat.matches(&parse("1.2.5"), false));
        assert!(!compat.matches(&parse("2.0.0"), false));
        assert!(!compat.matches(&parse("1.2.4"), false));
    }

    #[test]
    fn test_prerelease_opt_in() {
        let parse = |s| Version::parse(s).unwrap();
        let min = VersionConstraint::new(ConstraintKind::Min(parse("1.0.0")));
        let pre = parse("1.1.0-rc.1");
        assert!(!min.matches(&pre, false));
        // Global flag opts in.
        assert!(min.matches(&pre, true));
        // Per-constraint opt-in works without the global flag.
        let min_pre = VersionConstraint::with_prerelease(ConstraintKind::Min(parse("1.0.0")));
        assert!(min_pre.matches(&pre, false));
    }
}
