//! Account registration, login and role upgrades.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::guard::{require_authenticated, require_self};
use crate::identity::Identity;
use crate::password::{hash_password, verify_password};
use crate::role::Role;
use crate::store::{NewUser, UserRegistry};
use crate::token::{Token, TokenCodec};
use crate::types::{Subject, UserId};

/// Sign-up request.
#[derive(Clone, Debug)]
pub struct Registration {
    /// Login key for the new account.
    pub subject: Subject,
    /// Display name shown on owned content.
    pub display_name: String,
    /// Plain-text password; hashed before it is stored.
    pub password: String,
    /// Requested role; only `USER` and `ARTIST` (any spelling) are accepted.
    pub role: String,
}

/// Issued credential plus the account it belongs to.
#[derive(Clone, Debug)]
pub struct Login {
    /// Bearer token for subsequent requests.
    pub token: Token,
    /// Account the token was issued for.
    pub user_id: UserId,
}

/// Account operations over a [`UserRegistry`].
#[derive(Debug, Clone)]
pub struct Accounts<D> {
    registry: D,
    codec: Arc<TokenCodec>,
}

impl<D> Accounts<D>
where
    D: UserRegistry,
{
    /// Creates account operations that issue tokens with `codec`.
    pub fn new(registry: D, codec: Arc<TokenCodec>) -> Self {
        Self { registry, codec }
    }

    /// Returns the backing registry.
    pub fn registry(&self) -> &D {
        &self.registry
    }

    /// Creates an account with one role stored as `ROLE_<TAG>`.
    pub async fn register(&self, registration: Registration) -> Result<UserId> {
        let role = Role::parse(&registration.role)
            .filter(Role::registrable)
            .ok_or_else(|| Error::InvalidRole(registration.role.clone()))?;
        let password_hash = hash_password(&registration.password)?;

        let subject = registration.subject;
        let created = self
            .registry
            .create_user(NewUser {
                subject: subject.clone(),
                display_name: registration.display_name,
                roles: vec![role.authority()],
                password_hash,
            })
            .await?
            .ok_or_else(|| Error::AccountExists(subject.clone()))?;

        info!(subject = %subject, user = %created.id, role = %role, "account registered");
        Ok(created.id)
    }

    /// Checks the password and issues a token.
    ///
    /// Unknown subjects and wrong passwords are indistinguishable.
    pub async fn login(&self, subject: &Subject, password: &str) -> Result<Login> {
        let record = self
            .registry
            .find_by_subject(subject)
            .await?
            .ok_or(Error::InvalidCredentials)?;
        if !verify_password(password, &record.password_hash) {
            debug!(subject = %subject, "password mismatch");
            return Err(Error::InvalidCredentials);
        }
        Ok(Login {
            token: self.codec.issue_now(&record.subject)?,
            user_id: record.id,
        })
    }

    /// Replaces the roles of `target` with `ARTIST` and issues a fresh token.
    ///
    /// Only the account itself may do this. Tokens issued before the upgrade
    /// keep working and pick up the new role on their next request.
    pub async fn become_artist(&self, identity: &Identity, target: UserId) -> Result<Login> {
        require_authenticated(identity)?;
        let record = self
            .registry
            .find_by_id(target)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {target}")))?;
        require_self(identity, &record.subject)?;

        if !self
            .registry
            .set_roles(target, vec![Role::Artist.authority()])
            .await?
        {
            return Err(Error::NotFound(format!("user {target}")));
        }
        info!(user = %target, "account promoted to artist");

        Ok(Login {
            token: self.codec.issue_now(&record.subject)?,
            user_id: target,
        })
    }
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::identity::IdentityStore;
    use crate::store::UserDirectory;
    use crate::MemoryStore;
    use futures::executor::block_on;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn accounts() -> Accounts<MemoryStore> {
        Accounts::new(MemoryStore::new(), Arc::new(TokenCodec::new(SECRET).unwrap()))
    }

    fn registration(subject: &str, role: &str) -> Registration {
        Registration {
            subject: Subject::try_from(subject).unwrap(),
            display_name: subject.split('@').next().unwrap_or_default().to_string(),
            password: "correct horse".to_string(),
            role: role.to_string(),
        }
    }

    #[test]
    fn register_stores_prefixed_role() {
        let accounts = accounts();
        let id = block_on(accounts.register(registration("a@x.com", "artist"))).unwrap();
        let record = block_on(accounts.registry().find_by_id(id)).unwrap().unwrap();
        assert_eq!(record.roles, vec!["ROLE_ARTIST".to_string()]);
        assert_ne!(record.password_hash, "correct horse");
    }

    #[test]
    fn register_rejects_unlisted_roles_and_duplicates() {
        let accounts = accounts();
        assert!(matches!(
            block_on(accounts.register(registration("a@x.com", "ADMIN"))),
            Err(Error::InvalidRole(_))
        ));
        block_on(accounts.register(registration("a@x.com", "USER"))).unwrap();
        assert!(matches!(
            block_on(accounts.register(registration("a@x.com", "USER"))),
            Err(Error::AccountExists(_))
        ));
    }

    #[test]
    fn login_checks_password() {
        let accounts = accounts();
        let id = block_on(accounts.register(registration("a@x.com", "USER"))).unwrap();
        let subject = Subject::try_from("a@x.com").unwrap();

        let login = block_on(accounts.login(&subject, "correct horse")).unwrap();
        assert_eq!(login.user_id, id);
        assert!(matches!(
            block_on(accounts.login(&subject, "wrong")),
            Err(Error::InvalidCredentials)
        ));
        assert!(matches!(
            block_on(accounts.login(&Subject::try_from("b@x.com").unwrap(), "correct horse")),
            Err(Error::InvalidCredentials)
        ));
    }

    #[test]
    fn become_artist_requires_the_account_itself() {
        let accounts = accounts();
        let alice = block_on(accounts.register(registration("alice@x.com", "USER"))).unwrap();
        let bob = block_on(accounts.register(registration("bob@x.com", "USER"))).unwrap();
        let identities = IdentityStore::new(accounts.registry().clone());
        let as_bob = block_on(identities.resolve_id(bob)).unwrap();

        assert!(matches!(
            block_on(accounts.become_artist(&Identity::anonymous(), alice)),
            Err(Error::Unauthorized)
        ));
        assert!(matches!(
            block_on(accounts.become_artist(&as_bob, alice)),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            block_on(accounts.become_artist(&as_bob, UserId::new(999))),
            Err(Error::NotFound(_))
        ));

        let login = block_on(accounts.become_artist(&as_bob, bob)).unwrap();
        assert_eq!(login.user_id, bob);
        let promoted = block_on(identities.resolve_id(bob)).unwrap();
        assert!(promoted.has_role(&Role::Artist));
        assert!(!promoted.has_role(&Role::User));
    }
}
