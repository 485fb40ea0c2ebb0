//! Lenient semantic version comparison used by the `semver_*` audience matchers.
//!
//! Versions are parsed with the `semver` crate after padding missing minor and patch
//! components. Targets may be partial: a target of `2.1` matches every `2.1.x`.

use std::cmp::Ordering;

use ::semver::Version;

/// A parsed version together with how many core components were actually written.
#[derive(Debug, PartialEq, Eq)]
struct LenientVersion {
    version: Version,
    precision: usize,
}

impl LenientVersion {
    fn parse(raw: &str) -> Option<Self> {
        if raw.chars().any(char::is_whitespace) {
            return None;
        }

        let core_end = raw.find(|c| c == '-' || c == '+').unwrap_or(raw.len());
        let (core, suffix) = raw.split_at(core_end);
        if core.is_empty() {
            return None;
        }
        let precision = core.split('.').count();
        if precision > 3 {
            return None;
        }

        let padded = format!("{}{}{}", core, ".0".repeat(3 - precision), suffix);
        let version = Version::parse(&padded).ok()?;
        Some(Self { version, precision })
    }

    fn core(&self) -> [u64; 3] {
        [self.version.major, self.version.minor, self.version.patch]
    }
}

/// Compares a user supplied version against a condition target, returning `None` when either
/// side is not a valid version.
pub fn compare_versions(user_version: &str, target_version: &str) -> Option<Ordering> {
    let user = LenientVersion::parse(user_version)?;
    let target = LenientVersion::parse(target_version)?;

    let (user_core, target_core) = (user.core(), target.core());
    for index in 0..target.precision {
        if index >= user.precision {
            return Some(Ordering::Less);
        }
        match user_core[index].cmp(&target_core[index]) {
            Ordering::Equal => continue,
            other => return Some(other),
        }
    }

    let user_pre = &user.version.pre;
    let target_pre = &target.version.pre;
    Some(match (user_pre.is_empty(), target_pre.is_empty()) {
        (false, false) => user_pre.cmp(target_pre),
        (true, false) => Ordering::Greater,
        // A pre-release sorts before the release it precedes, but only against a full target.
        (false, true) if target.precision == 3 => Ordering::Less,
        _ => Ordering::Equal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("2.0.0", "2.0.0", Ordering::Equal)]
    #[test_case("2.1.3", "2.1", Ordering::Equal; "partial target matches patch")]
    #[test_case("2.9", "2", Ordering::Equal; "major only target")]
    #[test_case("2", "2.1", Ordering::Less; "user shorter than target")]
    #[test_case("1.10.0", "1.9.0", Ordering::Greater)]
    #[test_case("3.0.0-beta", "3.0.0", Ordering::Less)]
    #[test_case("3.0.0", "3.0.0-beta", Ordering::Greater)]
    #[test_case("3.0.0-beta.2", "3.0.0-beta.10", Ordering::Less)]
    #[test_case("3.0.0-rc", "3.0.0-beta", Ordering::Greater)]
    #[test_case("3.0.0-alpha.1", "3.0.0-alpha", Ordering::Greater; "longer pre-release wins")]
    #[test_case("3.0.0-1", "3.0.0-alpha", Ordering::Less; "numeric identifiers sort first")]
    #[test_case("3.1.0-beta", "3.1-beta", Ordering::Equal; "pre-release on partial target")]
    #[test_case("3.0.0+build.7", "3.0.0", Ordering::Equal)]
    #[test_case("3.0.0+build.7", "3.0.0+build.8", Ordering::Equal; "build metadata is ignored")]
    fn compares_versions(user: &str, target: &str, expected: Ordering) {
        assert_eq!(compare_versions(user, target), Some(expected));
    }

    #[test_case("")]
    #[test_case("1.2.3.4")]
    #[test_case("1. 2")]
    #[test_case("a.b.c")]
    #[test_case("1..2")]
    #[test_case("-beta")]
    #[test_case("1.2.3+")]
    #[test_case("1.2.3-")]
    #[test_case("1.2.3-beta..1")]
    fn rejects_invalid_versions(version: &str) {
        assert_eq!(compare_versions(version, "1.0.0"), None);
        assert_eq!(compare_versions("1.0.0", version), None);
    }
}
