use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError, TxConflict};
use crate::guard::OwnerKey;
use crate::store::{
    NewUser, OwnershipLookup, RelationRecord, RelationshipStore, RelationshipTx, ResourceRef,
    UserDirectory, UserRecord, UserRegistry,
};
use crate::toggle::{ObjectRef, RelationKey, RelationKind};
use crate::types::{AlbumId, ArtistId, PlaylistId, SongId, Subject, UserId};

/// In-memory store implementation for tests and demos.
///
/// Relationship transactions hold the relationship lock and record an undo
/// entry for every write. A unit that fails, conflicts or panics is rolled
/// back before the lock is released.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    users: RwLock<Users>,
    owners: RwLock<HashMap<ResourceRef, OwnerKey>>,
    relations: Mutex<RelationState>,
    pending_conflicts: AtomicUsize,
    next_id: AtomicI64,
}

#[derive(Debug, Default)]
struct Users {
    by_id: HashMap<UserId, UserRecord>,
    // Keyed on the lowercased subject.
    by_subject: HashMap<String, UserId>,
}

#[derive(Debug, Default)]
struct RelationState {
    counters: HashMap<ObjectRef, u64>,
    rows: HashMap<RelationKey, Row>,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Row {
    created_at: DateTime<Utc>,
    seq: u64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Adds an account with an empty password hash.
    pub fn add_user(&self, subject: &str, display_name: &str, roles: &[&str]) -> Result<UserId> {
        let subject = Subject::new(subject)?;
        let id = UserId::new(self.next_id());
        let record = UserRecord {
            id,
            subject,
            display_name: display_name.to_string(),
            roles: roles.iter().map(|role| role.to_string()).collect(),
            password_hash: String::new(),
        };
        let mut users = self.inner.users.write().unwrap_or_else(PoisonError::into_inner);
        users.insert(record);
        Ok(id)
    }

    /// Adds an artist with a zero follower count.
    pub fn add_artist(&self) -> ArtistId {
        let id = ArtistId::new(self.next_id());
        self.relations().counters.insert(ObjectRef::Artist(id), 0);
        id
    }

    /// Adds a song owned by `owner` with a zero like count.
    pub fn add_song(&self, owner: OwnerKey) -> SongId {
        let id = SongId::new(self.next_id());
        self.relations().counters.insert(ObjectRef::Song(id), 0);
        self.set_owner(ResourceRef::Song(id), owner);
        id
    }

    /// Adds a playlist owned by `owner`.
    pub fn add_playlist(&self, owner: UserId) -> PlaylistId {
        let id = PlaylistId::new(self.next_id());
        self.set_owner(ResourceRef::Playlist(id), OwnerKey::ById(owner));
        id
    }

    /// Adds an album owned by `owner`.
    pub fn add_album(&self, owner: OwnerKey) -> AlbumId {
        let id = AlbumId::new(self.next_id());
        self.set_owner(ResourceRef::Album(id), owner);
        id
    }

    /// Makes the next `count` relationship commits fail with [`TxConflict`].
    pub fn inject_conflicts(&self, count: usize) {
        self.inner.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Overwrites a counter outside any transaction.
    pub fn set_counter_raw(&self, object: ObjectRef, value: u64) {
        self.relations().counters.insert(object, value);
    }

    fn set_owner(&self, resource: ResourceRef, owner: OwnerKey) {
        let mut owners = self.inner.owners.write().unwrap_or_else(PoisonError::into_inner);
        owners.insert(resource, owner);
    }

    fn relations(&self) -> std::sync::MutexGuard<'_, RelationState> {
        self.inner
            .relations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_conflict(&self) -> bool {
        self.inner
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Users {
    fn insert(&mut self, record: UserRecord) {
        self.by_subject
            .insert(record.subject.as_str().to_ascii_lowercase(), record.id);
        self.by_id.insert(record.id, record);
    }
}

enum Undo {
    Row(RelationKey, Option<Row>),
    Counter(ObjectRef, u64),
}

struct MemoryTx<'a> {
    state: &'a mut RelationState,
    undo: Vec<Undo>,
    committed: bool,
}

impl<'a> MemoryTx<'a> {
    fn new(state: &'a mut RelationState) -> Self {
        Self {
            state,
            undo: Vec::new(),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }

    fn write_counter(
        &mut self,
        object: ObjectRef,
        update: impl FnOnce(u64) -> u64,
    ) -> std::result::Result<u64, StoreError> {
        let counter = self
            .state
            .counters
            .get_mut(&object)
            .ok_or_else(|| format!("unknown {object}"))?;
        let previous = *counter;
        *counter = update(previous);
        let current = *counter;
        self.undo.push(Undo::Counter(object, previous));
        Ok(current)
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Row(key, Some(row)) => {
                    self.state.rows.insert(key, row);
                }
                Undo::Row(key, None) => {
                    self.state.rows.remove(&key);
                }
                Undo::Counter(object, value) => {
                    self.state.counters.insert(object, value);
                }
            }
        }
    }
}

impl RelationshipTx for MemoryTx<'_> {
    fn find(&mut self, key: &RelationKey) -> std::result::Result<Option<RelationRecord>, StoreError> {
        Ok(self.state.rows.get(key).map(|row| RelationRecord {
            key: *key,
            created_at: row.created_at,
        }))
    }

    fn insert(
        &mut self,
        key: &RelationKey,
        created_at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        if self.state.rows.contains_key(key) {
            return Err(format!("duplicate relationship for user {} and {}", key.subject, key.object).into());
        }
        self.state.seq += 1;
        let seq = self.state.seq;
        self.state.rows.insert(*key, Row { created_at, seq });
        self.undo.push(Undo::Row(*key, None));
        Ok(())
    }

    fn delete(&mut self, key: &RelationKey) -> std::result::Result<bool, StoreError> {
        let Some(row) = self.state.rows.remove(key) else {
            return Ok(false);
        };
        self.undo.push(Undo::Row(*key, Some(row)));
        Ok(true)
    }

    fn adjust_counter(
        &mut self,
        object: ObjectRef,
        delta: i64,
    ) -> std::result::Result<u64, StoreError> {
        self.write_counter(object, |counter| {
            if delta < 0 {
                counter.saturating_sub(delta.unsigned_abs())
            } else {
                counter.saturating_add(delta.unsigned_abs())
            }
        })
    }

    fn read_counter(&mut self, object: ObjectRef) -> std::result::Result<u64, StoreError> {
        self.state
            .counters
            .get(&object)
            .copied()
            .ok_or_else(|| format!("unknown {object}").into())
    }

    fn set_counter(&mut self, object: ObjectRef, value: u64) -> std::result::Result<(), StoreError> {
        self.write_counter(object, |_| value)?;
        Ok(())
    }

    fn count_members(&mut self, object: ObjectRef) -> std::result::Result<u64, StoreError> {
        Ok(self
            .state
            .rows
            .keys()
            .filter(|key| key.object == object)
            .count() as u64)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_by_subject(
        &self,
        subject: &Subject,
    ) -> std::result::Result<Option<UserRecord>, StoreError> {
        let users = self.inner.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(users
            .by_subject
            .get(&subject.as_str().to_ascii_lowercase())
            .and_then(|id| users.by_id.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: UserId) -> std::result::Result<Option<UserRecord>, StoreError> {
        let users = self.inner.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(users.by_id.get(&id).cloned())
    }
}

#[async_trait]
impl UserRegistry for MemoryStore {
    async fn create_user(
        &self,
        user: NewUser,
    ) -> std::result::Result<Option<UserRecord>, StoreError> {
        let mut users = self.inner.users.write().unwrap_or_else(PoisonError::into_inner);
        if users
            .by_subject
            .contains_key(&user.subject.as_str().to_ascii_lowercase())
        {
            return Ok(None);
        }
        let record = UserRecord {
            id: UserId::new(self.next_id()),
            subject: user.subject,
            display_name: user.display_name,
            roles: user.roles,
            password_hash: user.password_hash,
        };
        users.insert(record.clone());
        Ok(Some(record))
    }

    async fn set_roles(
        &self,
        id: UserId,
        roles: Vec<String>,
    ) -> std::result::Result<bool, StoreError> {
        let mut users = self.inner.users.write().unwrap_or_else(PoisonError::into_inner);
        Ok(match users.by_id.get_mut(&id) {
            Some(record) => {
                record.roles = roles;
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl OwnershipLookup for MemoryStore {
    async fn owner_of(
        &self,
        resource: ResourceRef,
    ) -> std::result::Result<Option<OwnerKey>, StoreError> {
        let owners = self.inner.owners.read().unwrap_or_else(PoisonError::into_inner);
        Ok(owners.get(&resource).cloned())
    }
}

#[async_trait]
impl RelationshipStore for MemoryStore {
    async fn subject_exists(&self, user: UserId) -> std::result::Result<bool, StoreError> {
        let users = self.inner.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(users.by_id.contains_key(&user))
    }

    async fn object_exists(&self, object: ObjectRef) -> std::result::Result<bool, StoreError> {
        Ok(self.relations().counters.contains_key(&object))
    }

    async fn counter(&self, object: ObjectRef) -> std::result::Result<u64, StoreError> {
        self.relations()
            .counters
            .get(&object)
            .copied()
            .ok_or_else(|| format!("unknown {object}").into())
    }

    async fn transact<R, F>(&self, work: F) -> std::result::Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn RelationshipTx) -> std::result::Result<R, StoreError> + Send + 'static,
    {
        let mut state = self.relations();
        let mut tx = MemoryTx::new(&mut state);
        let output = work(&mut tx)?;
        if self.take_conflict() {
            return Err(Box::new(TxConflict));
        }
        tx.commit();
        Ok(output)
    }

    async fn memberships(
        &self,
        user: UserId,
        kind: RelationKind,
    ) -> std::result::Result<Vec<RelationRecord>, StoreError> {
        let state = self.relations();
        let mut rows: Vec<(&RelationKey, &Row)> = state
            .rows
            .iter()
            .filter(|(key, _)| key.subject == user && key.kind() == kind)
            .collect();
        rows.sort_by(|a, b| (b.1.created_at, b.1.seq).cmp(&(a.1.created_at, a.1.seq)));
        Ok(rows
            .into_iter()
            .map(|(key, row)| RelationRecord {
                key: *key,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn top_objects(
        &self,
        kind: RelationKind,
        limit: usize,
    ) -> std::result::Result<Vec<(ObjectRef, u64)>, StoreError> {
        let state = self.relations();
        let mut counts: HashMap<ObjectRef, u64> = state
            .counters
            .keys()
            .filter(|object| object.kind() == kind)
            .map(|object| (*object, 0))
            .collect();
        for key in state.rows.keys() {
            if let Some(count) = counts.get_mut(&key.object) {
                *count += 1;
            }
        }
        let mut ranked: Vec<(ObjectRef, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use futures::executor::block_on;

    #[test]
    fn subject_lookup_ignores_case() {
        let store = MemoryStore::new();
        let id = store.add_user("Alice@X.com", "alice", &["ROLE_USER"]).unwrap();
        let subject = Subject::try_from("alice@x.com").unwrap();
        let found = block_on(store.find_by_subject(&subject)).unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[test]
    fn create_user_rejects_taken_subject() {
        let store = MemoryStore::new();
        store.add_user("a@x.com", "a", &["USER"]).unwrap();
        let created = block_on(store.create_user(NewUser {
            subject: Subject::try_from("A@x.com").unwrap(),
            display_name: "again".into(),
            roles: vec!["ROLE_USER".into()],
            password_hash: String::new(),
        }))
        .unwrap();
        assert!(created.is_none());
    }

    #[test]
    fn add_user_validates_subject() {
        let store = MemoryStore::new();
        let result = store.add_user("not-an-email", "x", &[]);
        assert!(matches!(result, Err(Error::InvalidId(_))));
    }

    #[test]
    fn failed_unit_leaves_no_partial_writes() {
        let store = MemoryStore::new();
        let user = store.add_user("a@x.com", "a", &["USER"]).unwrap();
        let artist = store.add_artist();
        let key = RelationKey::follow(user, artist);

        let result: std::result::Result<(), StoreError> =
            block_on(store.transact(move |tx| {
                tx.insert(&key, Utc::now())?;
                tx.adjust_counter(key.object, 1)?;
                Err("boom".into())
            }));
        assert!(result.is_err());
        assert_eq!(block_on(store.counter(key.object)).unwrap(), 0);
        let found = block_on(store.transact(move |tx| tx.find(&key))).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn conflicting_unit_rolls_back_its_writes() {
        let store = MemoryStore::new();
        let user = store.add_user("a@x.com", "a", &["USER"]).unwrap();
        let artist = store.add_artist();
        let key = RelationKey::follow(user, artist);
        store.inject_conflicts(1);

        let result = block_on(store.transact(move |tx| {
            tx.insert(&key, Utc::now())?;
            tx.adjust_counter(key.object, 1)
        }));
        assert!(crate::is_conflict(&result.unwrap_err()));
        assert_eq!(block_on(store.counter(key.object)).unwrap(), 0);
        assert!(block_on(store.transact(move |tx| tx.find(&key))).unwrap().is_none());
    }

    #[test]
    fn panicking_unit_leaves_previous_state() {
        let store = MemoryStore::new();
        let user = store.add_user("a@x.com", "a", &["USER"]).unwrap();
        let artist = store.add_artist();
        let key = RelationKey::follow(user, artist);
        block_on(store.transact(move |tx| {
            tx.insert(&key, Utc::now())?;
            tx.adjust_counter(key.object, 1)
        }))
        .unwrap();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            block_on(store.transact(move |tx| -> std::result::Result<(), StoreError> {
                tx.delete(&key)?;
                tx.set_counter(key.object, 0)?;
                panic!("unit failed midway");
            }))
        }));
        assert!(panicked.is_err());
        assert_eq!(block_on(store.counter(key.object)).unwrap(), 1);
        assert!(block_on(store.transact(move |tx| tx.find(&key))).unwrap().is_some());
    }

    #[test]
    fn ownership_records_are_returned() {
        let store = MemoryStore::new();
        let owner = store.add_user("a@x.com", "a", &["ARTIST"]).unwrap();
        let song = store.add_song(OwnerKey::ByName("a".into()));
        let playlist = store.add_playlist(owner);

        assert_eq!(
            block_on(store.owner_of(ResourceRef::Song(song))).unwrap(),
            Some(OwnerKey::ByName("a".into()))
        );
        assert_eq!(
            block_on(store.owner_of(ResourceRef::Playlist(playlist))).unwrap(),
            Some(OwnerKey::ById(owner))
        );
        assert_eq!(
            block_on(store.owner_of(ResourceRef::Album(AlbumId::new(999)))).unwrap(),
            None
        );
    }
}
