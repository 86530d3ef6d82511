//! Strict box version parsing and ordering.
//!
//! Box catalogs use plain three-component versions. Unlike full semantic
//! versioning there is no pre-release or build metadata: any component
//! containing a non-digit is rejected outright. Missing trailing components
//! are zero-filled, so `"1.2"` normalizes to `1.2.0`.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version value: '{0}'")]
    Empty(String),

    #[error("invalid number of version elements: '{0}'")]
    TooManyElements(String),

    #[error("pre-release and build versions unsupported: '{0}'")]
    NonNumeric(String),
}

/// A normalized `major.minor.patch` version.
///
/// Ordering is lexicographic on `(major, minor, patch)`, so a descending
/// sort puts the newest version first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse and normalize a version string.
    pub fn parse(value: &str) -> Result<Version, VersionError> {
        if value.is_empty() {
            return Err(VersionError::Empty(value.to_string()));
        }

        let elements: Vec<&str> = value.split('.').collect();
        if elements.len() > 3 {
            return Err(VersionError::TooManyElements(value.to_string()));
        }

        let mut parts = [0u64; 3];
        for (index, part) in parts.iter_mut().enumerate() {
            // An absent or empty component zero-fills.
            let element = match elements.get(index) {
                Some(element) if !element.is_empty() => *element,
                _ => "0",
            };

            if !element.bytes().all(|b| b.is_ascii_digit()) {
                return Err(VersionError::NonNumeric(value.to_string()));
            }

            *part = element
                .parse()
                .map_err(|_| VersionError::NonNumeric(value.to_string()))?;
        }

        Ok(Version::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Find where `candidate` belongs in a descending-sorted version list.
///
/// Returns `(insert_at, match_at)`. Exactly one of the two may be set: an
/// exact match reports its index, otherwise `insert_at` is the position
/// that keeps the list descending. `(None, None)` means the candidate is
/// smaller than every entry and should be appended.
pub fn version_index(candidate: Version, versions: &[Version]) -> (Option<usize>, Option<usize>) {
    for (index, entry) in versions.iter().enumerate() {
        if candidate == *entry {
            return (None, Some(index));
        }

        if candidate > *entry {
            return (Some(index), None);
        }
    }

    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_partial_versions() {
        for (input, expected) in [
            ("0", "0.0.0"),
            ("0.1", "0.1.0"),
            ("0.0.1", "0.0.1"),
            ("01.02.03", "1.2.3"),
            ("1", "1.0.0"),
            ("1..3", "1.0.3"),
        ] {
            assert_eq!(Version::parse(input).unwrap().to_string(), expected);
        }
    }

    #[test]
    fn parse_rejects_invalid_versions() {
        for input in [
            "", "a", "1.2.3.4", "1.2.3-", "1.2.3-4", "1.2.3_4", "1.2.3+4", "-1.2.3", " 1.2.3",
        ] {
            assert!(Version::parse(input).is_err(), "should reject '{input}'");
        }
    }

    #[test]
    fn parse_is_idempotent() {
        for input in ["0", "0.1", "1.2.3", "01.02.03"] {
            let parsed = Version::parse(input).unwrap();
            assert_eq!(Version::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Version::parse("1.0.0").unwrap() > Version::parse("0.9.9").unwrap());
        assert!(Version::parse("1.2.0").unwrap() > Version::parse("1.1.9").unwrap());
        assert!(Version::parse("1.2.3").unwrap() == Version::parse("01.02.03").unwrap());
    }

    fn versions(values: &[&str]) -> Vec<Version> {
        values.iter().map(|v| Version::parse(v).unwrap()).collect()
    }

    #[test]
    fn version_index_table() {
        for (candidate, list, insert_expected, match_expected) in [
            ("1.0.0", vec![], None, None),
            ("1.0.0", vec!["0.1.0"], Some(0), None),
            ("0.1.0", vec!["1.0.0"], None, None),
            ("1.1.1", vec!["1.2.0", "1.0.0"], Some(1), None),
            ("1.2.0", vec!["1.2.0", "1.1.1", "1.0.0"], None, Some(0)),
            ("1.1.1", vec!["1.2.0", "1.1.1", "1.0.0"], None, Some(1)),
            ("1.0.0", vec!["1.2.0", "1.1.1", "1.0.0"], None, Some(2)),
        ] {
            let candidate = Version::parse(candidate).unwrap();
            let list = versions(&list);
            assert_eq!(
                version_index(candidate, &list),
                (insert_expected, match_expected),
                "candidate {candidate}"
            );
        }
    }
}
