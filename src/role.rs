use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Conventional prefix used by stored role strings (`ROLE_ARTIST`).
pub const ROLE_PREFIX: &str = "ROLE_";

/// Canonical role tag used for every authorization comparison.
///
/// Stored role strings come in several shapes (`artist`, `ARTIST`,
/// ` ROLE_ARTIST `); [`normalize_roles`] collapses them all to one variant.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Listener account.
    User,
    /// Account allowed to publish catalog content.
    Artist,
    /// Unrecognised tag, kept uppercased without the prefix.
    ///
    /// Build these through [`Role::parse`] or `str::parse`; a hand-written
    /// tag is only canonicalised when compared by [`Identity::has_role`](crate::Identity::has_role).
    Other(String),
}

impl Role {
    /// Parses one raw role string.
    ///
    /// Returns `None` for blank entries (including a bare `ROLE_`).
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        let tag = upper.strip_prefix(ROLE_PREFIX).unwrap_or(&upper).trim();
        match tag {
            "" => None,
            "USER" => Some(Self::User),
            "ARTIST" => Some(Self::Artist),
            other => Some(Self::Other(other.to_string())),
        }
    }

    /// Returns the canonical tag (`USER`, `ARTIST`, ...).
    pub fn tag(&self) -> &str {
        match self {
            Self::User => "USER",
            Self::Artist => "ARTIST",
            Self::Other(tag) => tag,
        }
    }

    /// Returns the prefixed storage form (`ROLE_ARTIST`).
    pub fn authority(&self) -> String {
        format!("{ROLE_PREFIX}{}", self.tag())
    }

    /// Whether a new account may pick this role at registration.
    pub fn registrable(&self) -> bool {
        matches!(self, Self::User | Self::Artist)
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value).ok_or_else(|| Error::InvalidRole(value.to_string()))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.tag().to_string()
    }
}

/// Collapses raw role strings into a set of canonical roles.
///
/// Blank entries are dropped; unknown tags pass through as [`Role::Other`].
/// The result does not depend on input order or duplicates.
pub fn normalize_roles<I, S>(raw: I) -> BTreeSet<Role>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|value| Role::parse(value.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_spellings_collapse_to_one_tag() {
        let expected = BTreeSet::from([Role::Artist]);
        assert_eq!(normalize_roles(["artist"]), expected);
        assert_eq!(normalize_roles(["ARTIST"]), expected);
        assert_eq!(normalize_roles(["ROLE_ARTIST"]), expected);
        assert_eq!(normalize_roles([" role_Artist ", "ARTIST"]), expected);
    }

    #[test]
    fn blank_entries_are_dropped() {
        let roles = normalize_roles(["", "   ", "ROLE_", "user"]);
        assert_eq!(roles, BTreeSet::from([Role::User]));
    }

    #[test]
    fn unknown_tags_pass_through_uppercased() {
        let roles = normalize_roles(["moderator"]);
        let role = roles.iter().next().unwrap();
        assert_eq!(role, &Role::Other("MODERATOR".to_string()));
        assert_eq!(role.authority(), "ROLE_MODERATOR");
    }

    #[test]
    fn normalization_is_order_independent() {
        let a = normalize_roles(["ROLE_USER", "artist", "x"]);
        let b = normalize_roles(["X", "USER", "ROLE_ARTIST", "user"]);
        assert_eq!(a, b);
    }

    #[test]
    fn from_str_canonicalises_and_rejects_blank() {
        assert_eq!("role_artist".parse::<Role>().unwrap(), Role::Artist);
        assert_eq!(" mod ".parse::<Role>().unwrap(), Role::Other("MOD".into()));
        assert!(matches!("ROLE_".parse::<Role>(), Err(Error::InvalidRole(_))));
    }

    #[test]
    fn only_user_and_artist_are_registrable() {
        assert!(Role::User.registrable());
        assert!(Role::Artist.registrable());
        assert!(!Role::Other("ADMIN".into()).registrable());
    }
}
