//! Permission bitmask carried in token claims.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const READ_ACTIONS: Self = Self(1);
    pub const READ_RECEIVERS: Self = Self(1 << 1);
    pub const READ_PEERS: Self = Self(1 << 2);
    pub const PERFORM_ACTIONS: Self = Self(1 << 3);
    pub const PUBLISH_ACTIONS: Self = Self(1 << 4);
    pub const SUBSCRIBE: Self = Self(1 << 5);
    pub const NOTIFY_RECEIVERS: Self = Self(1 << 6);
    pub const ALL: Self = Self(0x7f);

    const NAMED: [(&'static str, Permissions); 7] = [
        ("read-actions", Self::READ_ACTIONS),
        ("read-receivers", Self::READ_RECEIVERS),
        ("read-peers", Self::READ_PEERS),
        ("perform-actions", Self::PERFORM_ACTIONS),
        ("publish-actions", Self::PUBLISH_ACTIONS),
        ("subscribe", Self::SUBSCRIBE),
        ("notify-receivers", Self::NOTIFY_RECEIVERS),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Drops bits that name no known permission.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// True if every bit of `other` is set.
    pub const fn has(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn has_any(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn has_all(self, others: &[Self]) -> bool {
        others.iter().all(|p| self.has(*p))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return f.write_str("all");
        }
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(_, p)| self.has(*p))
            .map(|(name, _)| *name)
            .collect();
        f.write_str(&names.join(","))
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permissions({self} = {:#x})", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown permission '{0}'")]
pub struct UnknownPermission(pub String);

impl FromStr for Permissions {
    type Err = UnknownPermission;

    /// Accepts `all`, `none` or a comma separated list such as
    /// `read-actions,perform-actions`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = Self::NONE;
        for raw in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match raw {
                "all" => out |= Self::ALL,
                "none" => {}
                name => {
                    let (_, p) = Self::NAMED
                        .iter()
                        .find(|(n, _)| *n == name)
                        .ok_or_else(|| UnknownPermission(name.to_string()))?;
                    out |= *p;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_covers_every_named_permission() {
        for (_, p) in Permissions::NAMED {
            assert!(Permissions::ALL.has(p));
        }
        assert_eq!(Permissions::from_bits_truncate(u32::MAX), Permissions::ALL);
    }

    #[test]
    fn has_any_and_has_all() {
        let p = Permissions::READ_ACTIONS | Permissions::SUBSCRIBE;
        assert!(p.has_any(Permissions::SUBSCRIBE | Permissions::READ_PEERS));
        assert!(!p.has(Permissions::SUBSCRIBE | Permissions::READ_PEERS));
        assert!(p.has_all(&[Permissions::READ_ACTIONS, Permissions::SUBSCRIBE]));
        assert!(!p.has_all(&[Permissions::READ_RECEIVERS]));
    }

    #[test]
    fn parses_and_prints_names() {
        let p: Permissions = "read-actions, perform-actions".parse().unwrap();
        assert_eq!(p, Permissions::READ_ACTIONS | Permissions::PERFORM_ACTIONS);
        assert_eq!(p.to_string(), "read-actions,perform-actions");
        assert_eq!("all".parse::<Permissions>().unwrap(), Permissions::ALL);
        assert_eq!(
            "launch-missiles".parse::<Permissions>(),
            Err(UnknownPermission("launch-missiles".into()))
        );
    }
}
