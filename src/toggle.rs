//! Follow / like toggles with a consistent denormalised counter.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result, StoreError, is_conflict};
use crate::store::{RelationRecord, RelationshipStore, RelationshipTx};
use crate::types::{ArtistId, SongId, UserId};

/// Target side of a relationship.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum ObjectRef {
    /// Followed artist; counter is the follower count.
    Artist(ArtistId),
    /// Liked song; counter is the like count.
    Song(SongId),
}

impl ObjectRef {
    /// Relationship table this object is counted by.
    pub fn kind(self) -> RelationKind {
        match self {
            Self::Artist(_) => RelationKind::Follow,
            Self::Song(_) => RelationKind::Like,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artist(id) => write!(f, "artist {id}"),
            Self::Song(id) => write!(f, "song {id}"),
        }
    }
}

/// Relationship table a key belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RelationKind {
    /// User follows artist.
    Follow,
    /// User likes song.
    Like,
}

/// Ordered (user, object) pair; at most one row exists per key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RelationKey {
    /// Acting user.
    pub subject: UserId,
    /// Followed or liked object.
    pub object: ObjectRef,
}

impl RelationKey {
    /// Key of `user` following `artist`.
    pub fn follow(user: UserId, artist: ArtistId) -> Self {
        Self {
            subject: user,
            object: ObjectRef::Artist(artist),
        }
    }

    /// Key of `user` liking `song`.
    pub fn like(user: UserId, song: SongId) -> Self {
        Self {
            subject: user,
            object: ObjectRef::Song(song),
        }
    }

    /// Relationship table the key belongs to.
    pub fn kind(&self) -> RelationKind {
        self.object.kind()
    }
}

/// Direction of a toggle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Toggle {
    /// Row inserted; counter incremented.
    Added,
    /// Row deleted; counter decremented.
    Removed,
}

/// Result of one toggle: the change and the counter after it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Toggled {
    /// Whether the row was added or removed.
    pub change: Toggle,
    /// Object counter after the toggle committed.
    pub count: u64,
}

/// Counter values before and after a reconciliation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Reconciled {
    /// Stored counter before reconciliation.
    pub before: u64,
    /// Row count written back as the counter.
    pub after: u64,
}

impl Reconciled {
    /// Whether the stored counter disagreed with the rows.
    pub fn drifted(&self) -> bool {
        self.before != self.after
    }
}

/// Flips relationship membership and keeps the object's counter in step.
///
/// The relationship rows are authoritative; the counter is a cache that
/// [`ToggleManager::reconcile`] can rebuild from them.
#[derive(Debug, Clone)]
pub struct ToggleManager<S> {
    store: S,
    max_retries: usize,
}

impl<S> ToggleManager<S>
where
    S: RelationshipStore,
{
    /// Creates a manager that retries a conflicting toggle once.
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_retries: 1,
        }
    }

    /// Returns the backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Toggles the relationship for `key`.
    ///
    /// Missing user or object is [`Error::NotFound`], checked before any
    /// transaction starts. A commit conflict is retried once and then
    /// surfaced as [`Error::Transient`].
    pub async fn toggle(&self, key: RelationKey) -> Result<Toggled> {
        if !self.store.subject_exists(key.subject).await? {
            return Err(Error::NotFound(format!("user {}", key.subject)));
        }
        if !self.store.object_exists(key.object).await? {
            return Err(Error::NotFound(key.object.to_string()));
        }

        let mut attempt = 0;
        loop {
            let now = Utc::now();
            match self.store.transact(move |tx| toggle_in(tx, key, now)).await {
                Ok(toggled) => {
                    debug!(
                        user = %key.subject,
                        object = %key.object,
                        change = ?toggled.change,
                        count = toggled.count,
                        "relationship toggled"
                    );
                    return Ok(toggled);
                }
                Err(err) if is_conflict(&err) && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(user = %key.subject, object = %key.object, attempt, "toggle conflict, retrying");
                }
                Err(err) if is_conflict(&err) => {
                    return Err(Error::Transient(format!(
                        "toggle of {} by user {} kept conflicting",
                        key.object, key.subject
                    )));
                }
                Err(err) => return Err(Error::Store(err)),
            }
        }
    }

    /// Follows or unfollows an artist.
    pub async fn follow_artist(&self, user: UserId, artist: ArtistId) -> Result<Toggled> {
        self.toggle(RelationKey::follow(user, artist)).await
    }

    /// Likes or unlikes a song.
    pub async fn like_song(&self, user: UserId, song: SongId) -> Result<Toggled> {
        self.toggle(RelationKey::like(user, song)).await
    }

    /// Whether the row for `key` exists.
    pub async fn is_member(&self, key: RelationKey) -> Result<bool> {
        let found = self
            .store
            .transact(move |tx| Ok(tx.find(&key)?.is_some()))
            .await?;
        Ok(found)
    }

    /// Current counter of `object`.
    pub async fn count(&self, object: ObjectRef) -> Result<u64> {
        Ok(self.store.counter(object).await?)
    }

    /// Rewrites the counter of `object` from its relationship rows.
    pub async fn reconcile(&self, object: ObjectRef) -> Result<Reconciled> {
        if !self.store.object_exists(object).await? {
            return Err(Error::NotFound(object.to_string()));
        }
        let reconciled = self
            .store
            .transact(move |tx| {
                let rows = tx.count_members(object)?;
                let before = tx.read_counter(object)?;
                if before != rows {
                    tx.set_counter(object, rows)?;
                }
                Ok(Reconciled {
                    before,
                    after: rows,
                })
            })
            .await?;
        if reconciled.drifted() {
            warn!(
                object = %object,
                before = reconciled.before,
                after = reconciled.after,
                "counter drift repaired"
            );
        }
        Ok(reconciled)
    }

    /// A user's relationships of one kind, newest first.
    pub async fn memberships(&self, user: UserId, kind: RelationKind) -> Result<Vec<RelationRecord>> {
        if !self.store.subject_exists(user).await? {
            return Err(Error::NotFound(format!("user {user}")));
        }
        Ok(self.store.memberships(user, kind).await?)
    }

    /// Objects of one kind ranked by member count.
    pub async fn top_objects(&self, kind: RelationKind, limit: usize) -> Result<Vec<(ObjectRef, u64)>> {
        Ok(self.store.top_objects(kind, limit).await?)
    }
}

fn toggle_in(
    tx: &mut dyn RelationshipTx,
    key: RelationKey,
    now: DateTime<Utc>,
) -> std::result::Result<Toggled, StoreError> {
    if tx.find(&key)?.is_some() {
        tx.delete(&key)?;
        let count = tx.adjust_counter(key.object, -1)?;
        Ok(Toggled {
            change: Toggle::Removed,
            count,
        })
    } else {
        tx.insert(&key, now)?;
        let count = tx.adjust_counter(key.object, 1)?;
        Ok(Toggled {
            change: Toggle::Added,
            count,
        })
    }
}
