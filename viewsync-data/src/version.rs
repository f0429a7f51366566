use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use viewsync_errors::SyncError;

/// The opaque, totally ordered identifier of a replica snapshot.
///
/// Comparisons are lexicographic on the raw string; the replication source
/// guarantees that lexicographic order matches commit order. State versions
/// never contain `:` (reserved for the cookie encoding of [`CvrVersion`]).
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StateVersion(String);

impl StateVersion {
    /// Wrap a raw state version.
    ///
    /// # Panics
    ///
    /// Panics if the version is empty or contains `:`.
    pub fn new(v: impl Into<String>) -> Self {
        let v = v.into();
        assert!(!v.is_empty(), "state versions are non-empty");
        assert!(!v.contains(':'), "state versions may not contain ':'");
        StateVersion(v)
    }

    /// The raw version string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StateVersion {
    fn from(s: &str) -> Self {
        StateVersion::new(s)
    }
}

/// The version of a client view record: `(stateVersion, minorVersion)`,
/// ordered lexicographically.
///
/// The state version moves with replica advancement; the minor version
/// increments for configuration-driven changes within the same state version.
/// The client-facing *cookie* encoding renders the bare state version when
/// the minor version is zero, and `<state>:<minor as lower hex, at least two
/// digits>` otherwise — so `{00, 1}` renders as `00:01`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CvrVersion {
    /// The replica state version this CVR version is tied to.
    pub state_version: StateVersion,
    /// Configuration-change counter within `state_version`.
    pub minor_version: u32,
}

impl CvrVersion {
    /// The first version at a given state version.
    pub fn initial(state_version: StateVersion) -> Self {
        CvrVersion {
            state_version,
            minor_version: 0,
        }
    }

    /// The next configuration-driven version within the same state version.
    pub fn next_minor(&self) -> Self {
        CvrVersion {
            state_version: self.state_version.clone(),
            minor_version: self.minor_version + 1,
        }
    }

    /// The version after advancing to `state_version`.
    ///
    /// Moving to a strictly newer state version resets the minor version;
    /// "advancing" within the same state version bumps the minor version so
    /// the result is always strictly greater than `self`.
    pub fn advance_to(&self, state_version: StateVersion) -> Self {
        if state_version > self.state_version {
            CvrVersion::initial(state_version)
        } else {
            self.next_minor()
        }
    }

    /// The cookie string for this version.
    pub fn cookie(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor_version == 0 {
            write!(f, "{}", self.state_version)
        } else {
            write!(f, "{}:{:02x}", self.state_version, self.minor_version)
        }
    }
}

impl FromStr for CvrVersion {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mk_err = || SyncError::Internal(format!("invalid cvr version cookie: {s:?}"));
        let (state, minor) = match s.split_once(':') {
            None => (s, 0),
            Some((state, minor)) => (
                state,
                u32::from_str_radix(minor, 16).map_err(|_| mk_err())?,
            ),
        };
        if state.is_empty() {
            return Err(mk_err());
        }
        Ok(CvrVersion {
            state_version: StateVersion::new(state),
            minor_version: minor,
        })
    }
}

impl Serialize for CvrVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CvrVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn cookie_encoding() {
        let v = CvrVersion::initial(StateVersion::new("00"));
        assert_eq!(v.cookie(), "00");
        assert_eq!(v.next_minor().cookie(), "00:01");
        let v = CvrVersion {
            state_version: StateVersion::new("1a"),
            minor_version: 0x2b,
        };
        assert_eq!(v.cookie(), "1a:2b");
    }

    #[test]
    fn cookie_round_trips() {
        for cookie in ["00", "00:01", "0zzv:ff", "1a:2b"] {
            let v: CvrVersion = cookie.parse().unwrap();
            assert_eq!(v.cookie(), cookie);
        }
    }

    #[test]
    fn ordering_is_state_then_minor() {
        let parse = |s: &str| s.parse::<CvrVersion>().unwrap();
        assert!(parse("00") < parse("00:01"));
        assert!(parse("00:02") < parse("01"));
        assert!(parse("01") < parse("01:01"));
    }

    #[test]
    fn advance_to_is_strictly_monotonic() {
        let v = parse("00:03");
        assert_eq!(v.advance_to(StateVersion::new("01")), parse("01"));
        assert_eq!(v.advance_to(StateVersion::new("00")), parse("00:04"));

        fn parse(s: &str) -> CvrVersion {
            s.parse().unwrap()
        }
    }

    proptest! {
        #[test]
        fn any_cookie_round_trips(state in "[0-9a-z]{1,8}", minor in 0u32..100_000) {
            let v = CvrVersion {
                state_version: StateVersion::new(state),
                minor_version: minor,
            };
            prop_assert_eq!(v.cookie().parse::<CvrVersion>().unwrap(), v);
        }

        #[test]
        fn advancing_always_increases(state in "[0-9a-z]{1,8}", minor in 0u32..100_000) {
            let v = CvrVersion {
                state_version: StateVersion::new("0m"),
                minor_version: minor,
            };
            prop_assume!(StateVersion::new(state.clone()) >= v.state_version);
            prop_assert!(v.advance_to(StateVersion::new(state)) > v);
        }
    }
}
