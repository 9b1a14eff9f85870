//! Authorization checks run by handlers before a protected action.
//!
//! Checks always run in the order authentication, role, ownership and stop
//! at the first failure. Missing identity is [`Error::Unauthorized`];
//! insufficient privilege is [`Error::Forbidden`].

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::role::Role;
use crate::store::{OwnershipLookup, ResourceRef};
use crate::types::{Subject, UserId};

/// Value that decides who owns a resource.
///
/// Rows created before stable-id ownership record the owner's display name.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum OwnerKey {
    /// Owner's stable user id.
    ById(UserId),
    /// Owner's display name (legacy rows).
    ByName(String),
}

impl OwnerKey {
    /// Whether `identity` is the owner described by this key.
    pub fn matches(&self, identity: &Identity) -> bool {
        match self {
            Self::ById(owner) => identity.user_id() == Some(*owner),
            Self::ByName(owner) => identity
                .display_name()
                .is_some_and(|name| name.trim() == owner.trim()),
        }
    }
}

/// Rejects callers without a resolved identity.
pub fn require_authenticated(identity: &Identity) -> Result<()> {
    if identity.is_authenticated() {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

/// Requires an authenticated identity holding `role`.
pub fn require_role(identity: &Identity, role: &Role) -> Result<()> {
    require_authenticated(identity)?;
    if identity.has_role(role) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!("role {role} required")))
    }
}

/// Requires an authenticated identity that owns the resource keyed by `owner`.
pub fn require_ownership(identity: &Identity, owner: &OwnerKey) -> Result<()> {
    require_authenticated(identity)?;
    if owner.matches(identity) {
        Ok(())
    } else {
        Err(Error::Forbidden("not the resource owner".to_string()))
    }
}

/// Requires the caller to be the account identified by `subject`.
///
/// Subjects compare case-insensitively.
pub fn require_self(identity: &Identity, subject: &Subject) -> Result<()> {
    require_authenticated(identity)?;
    match identity.subject() {
        Some(own) if own.eq_ignore_case(subject) => Ok(()),
        _ => Err(Error::Forbidden("not the account owner".to_string())),
    }
}

/// Fetches the owner of `resource` and checks it against `identity`.
///
/// A missing resource is [`Error::NotFound`], reported only after
/// authentication passes.
pub async fn require_owner_of<L>(
    identity: &Identity,
    lookup: &L,
    resource: ResourceRef,
) -> Result<()>
where
    L: OwnershipLookup + ?Sized,
{
    require_authenticated(identity)?;
    let owner = lookup
        .owner_of(resource)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound(resource.to_string()))?;
    require_ownership(identity, &owner)
}

/// Composable set of requirements for one protected action.
///
/// ```
/// use rs_catalog_auth::{Guard, Identity, OwnerKey, Role, UserId};
///
/// let guard = Guard::new()
///     .role(Role::Artist)
///     .owner(OwnerKey::ById(UserId::new(7)));
/// assert!(guard.check(&Identity::anonymous()).is_err());
/// ```
#[derive(Clone, Debug, Default)]
pub struct Guard {
    authenticated: bool,
    roles: Vec<Role>,
    owner: Option<OwnerKey>,
}

impl Guard {
    /// Creates a guard that allows everyone.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires an authenticated caller.
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    /// Requires `role`; implies authentication.
    pub fn role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    /// Requires ownership of the resource keyed by `owner`; implies authentication.
    pub fn owner(mut self, owner: OwnerKey) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Runs the configured checks against `identity`.
    pub fn check(&self, identity: &Identity) -> Result<()> {
        let needs_identity = self.authenticated || !self.roles.is_empty() || self.owner.is_some();
        if needs_identity {
            require_authenticated(identity)?;
        }
        for role in &self.roles {
            require_role(identity, role)?;
        }
        if let Some(owner) = &self.owner {
            require_ownership(identity, owner)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::UserRecord;
    use crate::types::SongId;
    use async_trait::async_trait;
    use futures::executor::block_on;

    fn identity(id: i64, name: &str, roles: &[&str]) -> Identity {
        Identity::from_record(&UserRecord {
            id: UserId::new(id),
            subject: Subject::try_from(format!("{name}@x.com").as_str()).unwrap(),
            display_name: name.to_string(),
            roles: roles.iter().map(|role| role.to_string()).collect(),
            password_hash: String::new(),
        })
    }

    struct Songs;

    #[async_trait]
    impl OwnershipLookup for Songs {
        async fn owner_of(
            &self,
            resource: ResourceRef,
        ) -> std::result::Result<Option<OwnerKey>, StoreError> {
            Ok(match resource {
                ResourceRef::Song(id) if id == SongId::new(1) => Some(OwnerKey::ById(UserId::new(1))),
                ResourceRef::Song(id) if id == SongId::new(2) => {
                    Some(OwnerKey::ByName("beta".to_string()))
                }
                _ => None,
            })
        }
    }

    #[test]
    fn anonymous_is_unauthorized_not_forbidden() {
        let anon = Identity::anonymous();
        assert!(matches!(require_authenticated(&anon), Err(Error::Unauthorized)));
        assert!(matches!(require_role(&anon, &Role::Artist), Err(Error::Unauthorized)));
        assert!(matches!(
            require_ownership(&anon, &OwnerKey::ById(UserId::new(1))),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn role_check_denies_user_and_allows_artist() {
        let listener = identity(1, "alpha", &["ROLE_USER"]);
        let artist = identity(2, "beta", &["artist"]);

        assert!(matches!(
            require_role(&listener, &Role::Artist),
            Err(Error::Forbidden(_))
        ));
        assert!(require_role(&artist, &Role::Artist).is_ok());
    }

    #[test]
    fn hand_built_role_tags_match_canonical_roles() {
        let artist = identity(2, "beta", &["ROLE_ARTIST"]);
        let listener = identity(1, "alpha", &["user"]);

        let guard = Guard::new().role(Role::Other("ARTIST".into()));
        assert!(guard.check(&artist).is_ok());
        assert!(matches!(guard.check(&listener), Err(Error::Forbidden(_))));
        assert!(require_role(&artist, &Role::Other(" role_artist ".into())).is_ok());
        assert!(matches!(
            require_role(&artist, &Role::Other(String::new())),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn ownership_by_id_denies_other_artist() {
        let owner = OwnerKey::ById(UserId::new(1));
        let artist_a = identity(1, "alpha", &["ARTIST"]);
        let artist_b = identity(2, "beta", &["ARTIST"]);

        assert!(require_ownership(&artist_a, &owner).is_ok());
        assert!(matches!(
            require_ownership(&artist_b, &owner),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn ownership_by_legacy_name() {
        let owner = OwnerKey::ByName("beta".to_string());
        assert!(require_ownership(&identity(2, "beta", &["ARTIST"]), &owner).is_ok());
        assert!(require_ownership(&identity(1, "alpha", &["ARTIST"]), &owner).is_err());
    }

    #[test]
    fn guard_checks_in_fixed_order() {
        let guard = Guard::new()
            .role(Role::Artist)
            .owner(OwnerKey::ById(UserId::new(1)));

        assert!(matches!(guard.check(&Identity::anonymous()), Err(Error::Unauthorized)));
        // Owner but not an artist fails on the role check first.
        let err = guard.check(&identity(1, "alpha", &["USER"])).unwrap_err();
        assert!(err.to_string().contains("role ARTIST"));
        let err = guard.check(&identity(2, "beta", &["ARTIST"])).unwrap_err();
        assert!(err.to_string().contains("owner"));
        assert!(guard.check(&identity(1, "alpha", &["ARTIST"])).is_ok());
    }

    #[test]
    fn empty_guard_allows_anonymous() {
        assert!(Guard::new().check(&Identity::anonymous()).is_ok());
        assert!(Guard::new().authenticated().check(&Identity::anonymous()).is_err());
    }

    #[test]
    fn require_self_ignores_case() {
        let caller = identity(1, "alpha", &["USER"]);
        assert!(require_self(&caller, &Subject::try_from("ALPHA@x.com").unwrap()).is_ok());
        assert!(matches!(
            require_self(&caller, &Subject::try_from("beta@x.com").unwrap()),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn owner_lookup_distinguishes_missing_from_forbidden() {
        let artist = identity(1, "alpha", &["ARTIST"]);
        assert!(block_on(require_owner_of(&artist, &Songs, ResourceRef::Song(SongId::new(1)))).is_ok());
        assert!(matches!(
            block_on(require_owner_of(&artist, &Songs, ResourceRef::Song(SongId::new(2)))),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            block_on(require_owner_of(&artist, &Songs, ResourceRef::Song(SongId::new(9)))),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            block_on(require_owner_of(
                &Identity::anonymous(),
                &Songs,
                ResourceRef::Song(SongId::new(9))
            )),
            Err(Error::Unauthorized)
        ));
    }
}
