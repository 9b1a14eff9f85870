use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::role::{Role, normalize_roles};
use crate::store::{UserDirectory, UserRecord};
use crate::types::{Subject, UserId};

/// The caller of one request.
///
/// Built fresh per request; an authenticated identity always carries a
/// subject, a user id and the roles read from the directory at resolution
/// time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    subject: Option<Subject>,
    user_id: Option<UserId>,
    display_name: Option<String>,
    roles: BTreeSet<Role>,
}

impl Identity {
    /// Identity of a caller without a usable credential.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Identity resolved from a directory record.
    pub fn from_record(record: &UserRecord) -> Self {
        Self {
            subject: Some(record.subject.clone()),
            user_id: Some(record.id),
            display_name: Some(record.display_name.clone()),
            roles: normalize_roles(&record.roles),
        }
    }

    /// True iff the subject was resolved against the directory.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    /// Login key of the resolved account.
    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    /// Stable id of the resolved account.
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// Display name read at resolution time.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Normalised role set; empty for anonymous callers.
    pub fn roles(&self) -> &BTreeSet<Role> {
        &self.roles
    }

    /// Whether the identity holds `role`. Always false for anonymous callers.
    ///
    /// A hand-built [`Role::Other`] is re-parsed first, so
    /// `Role::Other("ARTIST".into())` matches [`Role::Artist`].
    pub fn has_role(&self, role: &Role) -> bool {
        if !self.is_authenticated() {
            return false;
        }
        match role {
            Role::Other(tag) => Role::parse(tag).is_some_and(|role| self.roles.contains(&role)),
            role => self.roles.contains(role),
        }
    }
}

/// Resolves verified subjects to identities through a [`UserDirectory`].
///
/// Every call is a directory read; a role change applies to the very next
/// request.
#[derive(Debug, Clone)]
pub struct IdentityStore<D> {
    directory: D,
}

impl<D> IdentityStore<D>
where
    D: UserDirectory,
{
    /// Creates a resolver that reads `directory` on every call.
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    /// Returns the underlying directory.
    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Looks the subject up and builds an authenticated identity.
    pub async fn resolve(&self, subject: &Subject) -> Result<Identity> {
        let record = self
            .directory
            .find_by_subject(subject)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::SubjectNotFound(subject.clone()))?;
        Ok(Identity::from_record(&record))
    }

    /// Looks an account up by id; `NotFound` if it does not exist.
    pub async fn resolve_id(&self, id: UserId) -> Result<Identity> {
        let record = self
            .directory
            .find_by_id(id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        Ok(Identity::from_record(&record))
    }
}
