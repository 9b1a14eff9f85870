use crate::error::StoreError;
use crate::guard::OwnerKey;
use crate::toggle::{ObjectRef, RelationKey, RelationKind};
use crate::types::{AlbumId, PlaylistId, SongId, Subject, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Account row as stored by the user directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    /// Stable identifier.
    pub id: UserId,
    /// Login key.
    pub subject: Subject,
    /// Display name; legacy content ownership is keyed on it.
    pub display_name: String,
    /// Raw role strings exactly as stored.
    pub roles: Vec<String>,
    /// One-way password hash (PHC string).
    pub password_hash: String,
}

/// Account to be created by [`UserRegistry::create_user`].
#[derive(Clone, Debug)]
pub struct NewUser {
    /// Login key; must not already be registered.
    pub subject: Subject,
    /// Display name shown on owned content.
    pub display_name: String,
    /// Role strings in storage form (`ROLE_USER`).
    pub roles: Vec<String>,
    /// PHC string from [`hash_password`](crate::hash_password).
    pub password_hash: String,
}

/// Read side of the external user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Looks up an account by login key.
    async fn find_by_subject(
        &self,
        subject: &Subject,
    ) -> std::result::Result<Option<UserRecord>, StoreError>;

    /// Looks up an account by stable id.
    async fn find_by_id(&self, id: UserId) -> std::result::Result<Option<UserRecord>, StoreError>;
}

/// Write side of the user directory used by registration and role changes.
#[async_trait]
pub trait UserRegistry: UserDirectory {
    /// Inserts an account, returning `None` when the subject is taken.
    async fn create_user(&self, user: NewUser)
    -> std::result::Result<Option<UserRecord>, StoreError>;

    /// Replaces the stored roles of an account. Returns `false` if it does not exist.
    async fn set_roles(
        &self,
        id: UserId,
        roles: Vec<String>,
    ) -> std::result::Result<bool, StoreError>;
}

/// Resource whose owner is checked by the guard.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ResourceRef {
    Song(SongId),
    Playlist(PlaylistId),
    Album(AlbumId),
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Song(id) => write!(f, "song {id}"),
            Self::Playlist(id) => write!(f, "playlist {id}"),
            Self::Album(id) => write!(f, "album {id}"),
        }
    }
}

/// Ownership lookup for catalog resources.
#[async_trait]
pub trait OwnershipLookup: Send + Sync {
    /// Returns the recorded owner key, or `None` if the resource does not exist.
    async fn owner_of(
        &self,
        resource: ResourceRef,
    ) -> std::result::Result<Option<OwnerKey>, StoreError>;
}

/// Stored relationship row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationRecord {
    /// User and object of the relationship.
    pub key: RelationKey,
    /// When the row was inserted.
    pub created_at: DateTime<Utc>,
}

/// Operations available inside one relationship transaction.
///
/// Everything done through a single `RelationshipTx` commits or rolls back
/// together.
pub trait RelationshipTx {
    /// Finds the row for an ordered pair.
    fn find(&mut self, key: &RelationKey) -> std::result::Result<Option<RelationRecord>, StoreError>;

    /// Inserts the row for an ordered pair.
    fn insert(
        &mut self,
        key: &RelationKey,
        created_at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError>;

    /// Deletes the row for an ordered pair; returns whether one existed.
    fn delete(&mut self, key: &RelationKey) -> std::result::Result<bool, StoreError>;

    /// Adds `delta` to the object's counter, flooring at zero. Returns the new value.
    fn adjust_counter(&mut self, object: ObjectRef, delta: i64)
    -> std::result::Result<u64, StoreError>;

    /// Reads the object's counter.
    fn read_counter(&mut self, object: ObjectRef) -> std::result::Result<u64, StoreError>;

    /// Overwrites the object's counter.
    fn set_counter(&mut self, object: ObjectRef, value: u64) -> std::result::Result<(), StoreError>;

    /// Counts relationship rows referencing the object.
    fn count_members(&mut self, object: ObjectRef) -> std::result::Result<u64, StoreError>;
}

/// Persistence for relationship rows and their denormalised counters.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Returns whether the subject user exists.
    async fn subject_exists(&self, user: UserId) -> std::result::Result<bool, StoreError>;

    /// Returns whether the relationship target exists.
    async fn object_exists(&self, object: ObjectRef) -> std::result::Result<bool, StoreError>;

    /// Reads the stored counter for the object.
    async fn counter(&self, object: ObjectRef) -> std::result::Result<u64, StoreError>;

    /// Runs `work` as one atomic unit.
    ///
    /// Implementations serialise units touching the same pair and may fail
    /// with a boxed [`TxConflict`](crate::TxConflict) when a commit collides.
    async fn transact<R, F>(&self, work: F) -> std::result::Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn RelationshipTx) -> std::result::Result<R, StoreError> + Send + 'static;

    /// Lists a user's relationships of one kind, newest first.
    async fn memberships(
        &self,
        user: UserId,
        kind: RelationKind,
    ) -> std::result::Result<Vec<RelationRecord>, StoreError>;

    /// Ranks objects of one kind by their true member count, descending.
    async fn top_objects(
        &self,
        kind: RelationKind,
        limit: usize,
    ) -> std::result::Result<Vec<(ObjectRef, u64)>, StoreError>;
}
