//! SQLite-backed store implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ErrorCode, OptionalExtension as _, TransactionBehavior, params};

use crate::error::{Error, Result, StoreError, TxConflict};
use crate::guard::OwnerKey;
use crate::store::{
    NewUser, OwnershipLookup, RelationRecord, RelationshipStore, RelationshipTx, ResourceRef,
    UserDirectory, UserRecord, UserRegistry,
};
use crate::toggle::{ObjectRef, RelationKey, RelationKind};
use crate::types::{AlbumId, ArtistId, PlaylistId, SongId, Subject, UserId};

/// Schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    email         TEXT NOT NULL UNIQUE COLLATE NOCASE,
    display_name  TEXT NOT NULL,
    password_hash TEXT NOT NULL
);

-- Raw role strings; normalised on read.
CREATE TABLE IF NOT EXISTS user_roles (
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role    TEXT NOT NULL,
    PRIMARY KEY (user_id, role)
);

CREATE TABLE IF NOT EXISTS artists (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT NOT NULL,
    follower_count INTEGER NOT NULL DEFAULT 0 CHECK (follower_count >= 0)
);

-- owner_name is set on rows that predate stable-id ownership.
CREATE TABLE IF NOT EXISTS songs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    title      TEXT NOT NULL,
    owner_id   INTEGER REFERENCES users(id),
    owner_name TEXT,
    like_count INTEGER NOT NULL DEFAULT 0 CHECK (like_count >= 0),
    CHECK (owner_id IS NOT NULL OR owner_name IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS playlists (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    name     TEXT NOT NULL,
    owner_id INTEGER NOT NULL REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS albums (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    title      TEXT NOT NULL,
    owner_id   INTEGER REFERENCES users(id),
    owner_name TEXT,
    CHECK (owner_id IS NOT NULL OR owner_name IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS follows (
    user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    artist_id  INTEGER NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,   -- RFC 3339 UTC, fixed width
    PRIMARY KEY (user_id, artist_id)
);

CREATE TABLE IF NOT EXISTS song_likes (
    user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    song_id    INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    PRIMARY KEY (user_id, song_id)
);

CREATE INDEX IF NOT EXISTS follows_artist_idx    ON follows(artist_id);
CREATE INDEX IF NOT EXISTS song_likes_song_idx   ON song_likes(song_id);

PRAGMA user_version = 1;
";

/// A catalog store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (or creates) a store at `path` and initialises the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|err| Error::Store(Box::new(err)))?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Opens an in-memory store.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|err| Error::Store(Box::new(err)))?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(store_error)?;
        Ok(())
    }

    /// Inserts an artist with a zero follower count.
    pub async fn add_artist(&self, name: &str) -> Result<ArtistId> {
        let name = name.to_string();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute("INSERT INTO artists (name) VALUES (?1)", params![name])?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(store_error)?;
        Ok(ArtistId::new(id))
    }

    /// Inserts a song owned by `owner`.
    pub async fn add_song(&self, title: &str, owner: OwnerKey) -> Result<SongId> {
        let title = title.to_string();
        let (owner_id, owner_name) = owner_columns(owner);
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO songs (title, owner_id, owner_name) VALUES (?1, ?2, ?3)",
                    params![title, owner_id, owner_name],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(store_error)?;
        Ok(SongId::new(id))
    }

    /// Inserts a playlist owned by `owner`.
    pub async fn add_playlist(&self, name: &str, owner: UserId) -> Result<PlaylistId> {
        let name = name.to_string();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO playlists (name, owner_id) VALUES (?1, ?2)",
                    params![name, owner.get()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(store_error)?;
        Ok(PlaylistId::new(id))
    }

    /// Inserts an album owned by `owner`.
    pub async fn add_album(&self, title: &str, owner: OwnerKey) -> Result<AlbumId> {
        let title = title.to_string();
        let (owner_id, owner_name) = owner_columns(owner);
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO albums (title, owner_id, owner_name) VALUES (?1, ?2, ?3)",
                    params![title, owner_id, owner_name],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(store_error)?;
        Ok(AlbumId::new(id))
    }
}

// Unwraps errors produced inside `call` closures so conflict markers survive.
fn store_error(err: tokio_rusqlite::Error) -> StoreError {
    match err {
        tokio_rusqlite::Error::Other(inner) => inner,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == ErrorCode::DatabaseBusy =>
        {
            Box::new(TxConflict)
        }
        other => Box::new(other),
    }
}

fn owner_columns(owner: OwnerKey) -> (Option<i64>, Option<String>) {
    match owner {
        OwnerKey::ById(id) => (Some(id.get()), None),
        OwnerKey::ByName(name) => (None, Some(name)),
    }
}

fn encode_dt(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_dt(raw: &str) -> std::result::Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn counter_column(object: ObjectRef) -> (&'static str, &'static str, i64) {
    match object {
        ObjectRef::Artist(id) => ("artists", "follower_count", id.get()),
        ObjectRef::Song(id) => ("songs", "like_count", id.get()),
    }
}

fn relation_table(kind: RelationKind) -> (&'static str, &'static str) {
    match kind {
        RelationKind::Follow => ("follows", "artist_id"),
        RelationKind::Like => ("song_likes", "song_id"),
    }
}

fn object_ref(kind: RelationKind, id: i64) -> ObjectRef {
    match kind {
        RelationKind::Follow => ObjectRef::Artist(ArtistId::new(id)),
        RelationKind::Like => ObjectRef::Song(SongId::new(id)),
    }
}

/// User row before its subject is validated.
struct RawUser {
    id: i64,
    email: String,
    display_name: String,
    password_hash: String,
    roles: Vec<String>,
}

impl RawUser {
    fn into_record(self) -> std::result::Result<UserRecord, StoreError> {
        Ok(UserRecord {
            id: UserId::new(self.id),
            subject: Subject::new(&self.email).map_err(StoreError::from)?,
            display_name: self.display_name,
            roles: self.roles,
            password_hash: self.password_hash,
        })
    }
}

fn load_user(
    conn: &rusqlite::Connection,
    filter: &str,
    value: &dyn rusqlite::ToSql,
) -> rusqlite::Result<Option<RawUser>> {
    let sql = format!("SELECT id, email, display_name, password_hash FROM users WHERE {filter}");
    let user = conn
        .query_row(&sql, [value], |row| {
            Ok(RawUser {
                id: row.get(0)?,
                email: row.get(1)?,
                display_name: row.get(2)?,
                password_hash: row.get(3)?,
                roles: Vec::new(),
            })
        })
        .optional()?;
    let Some(mut user) = user else {
        return Ok(None);
    };
    let mut stmt = conn.prepare("SELECT role FROM user_roles WHERE user_id = ?1 ORDER BY rowid")?;
    user.roles = stmt
        .query_map([user.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(Some(user))
}

struct SqliteTx<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl RelationshipTx for SqliteTx<'_> {
    fn find(&mut self, key: &RelationKey) -> std::result::Result<Option<RelationRecord>, StoreError> {
        let (table, column) = relation_table(key.kind());
        let (_, _, object) = counter_column(key.object);
        let sql = format!("SELECT created_at FROM {table} WHERE user_id = ?1 AND {column} = ?2");
        let raw: Option<String> = self
            .tx
            .query_row(&sql, params![key.subject.get(), object], |row| row.get(0))
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        Ok(Some(RelationRecord {
            key: *key,
            created_at: decode_dt(&raw)?,
        }))
    }

    fn insert(
        &mut self,
        key: &RelationKey,
        created_at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        let (table, column) = relation_table(key.kind());
        let (_, _, object) = counter_column(key.object);
        let sql = format!("INSERT INTO {table} (user_id, {column}, created_at) VALUES (?1, ?2, ?3)");
        self.tx
            .execute(&sql, params![key.subject.get(), object, encode_dt(created_at)])?;
        Ok(())
    }

    fn delete(&mut self, key: &RelationKey) -> std::result::Result<bool, StoreError> {
        let (table, column) = relation_table(key.kind());
        let (_, _, object) = counter_column(key.object);
        let sql = format!("DELETE FROM {table} WHERE user_id = ?1 AND {column} = ?2");
        Ok(self.tx.execute(&sql, params![key.subject.get(), object])? > 0)
    }

    fn adjust_counter(
        &mut self,
        object: ObjectRef,
        delta: i64,
    ) -> std::result::Result<u64, StoreError> {
        let (table, column, id) = counter_column(object);
        let sql = format!(
            "UPDATE {table} SET {column} = MAX({column} + ?2, 0) WHERE id = ?1 RETURNING {column}"
        );
        let value: Option<i64> = self
            .tx
            .query_row(&sql, params![id, delta], |row| row.get(0))
            .optional()?;
        value
            .map(|value| value as u64)
            .ok_or_else(|| format!("unknown {object}").into())
    }

    fn read_counter(&mut self, object: ObjectRef) -> std::result::Result<u64, StoreError> {
        let (table, column, id) = counter_column(object);
        let sql = format!("SELECT {column} FROM {table} WHERE id = ?1");
        let value: Option<i64> = self
            .tx
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?;
        value
            .map(|value| value as u64)
            .ok_or_else(|| format!("unknown {object}").into())
    }

    fn set_counter(&mut self, object: ObjectRef, value: u64) -> std::result::Result<(), StoreError> {
        let (table, column, id) = counter_column(object);
        let value = i64::try_from(value)?;
        let sql = format!("UPDATE {table} SET {column} = ?2 WHERE id = ?1");
        if self.tx.execute(&sql, params![id, value])? == 0 {
            return Err(format!("unknown {object}").into());
        }
        Ok(())
    }

    fn count_members(&mut self, object: ObjectRef) -> std::result::Result<u64, StoreError> {
        let (table, column) = relation_table(object.kind());
        let (_, _, id) = counter_column(object);
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE {column} = ?1");
        let count: i64 = self.tx.query_row(&sql, params![id], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn find_by_subject(
        &self,
        subject: &Subject,
    ) -> std::result::Result<Option<UserRecord>, StoreError> {
        let email = subject.as_str().to_string();
        let raw = self
            .conn
            .call(move |conn| Ok(load_user(conn, "email = ?1", &email)?))
            .await
            .map_err(store_error)?;
        raw.map(RawUser::into_record).transpose()
    }

    async fn find_by_id(&self, id: UserId) -> std::result::Result<Option<UserRecord>, StoreError> {
        let raw = self
            .conn
            .call(move |conn| Ok(load_user(conn, "id = ?1", &id.get())?))
            .await
            .map_err(store_error)?;
        raw.map(RawUser::into_record).transpose()
    }
}

#[async_trait]
impl UserRegistry for SqliteStore {
    async fn create_user(
        &self,
        user: NewUser,
    ) -> std::result::Result<Option<UserRecord>, StoreError> {
        let email = user.subject.as_str().to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let taken = tx
                    .query_row("SELECT 1 FROM users WHERE email = ?1", [&email], |_| Ok(()))
                    .optional()?
                    .is_some();
                if taken {
                    return Ok(None);
                }
                tx.execute(
                    "INSERT INTO users (email, display_name, password_hash) VALUES (?1, ?2, ?3)",
                    params![email, user.display_name, user.password_hash],
                )?;
                let id = tx.last_insert_rowid();
                for role in &user.roles {
                    tx.execute(
                        "INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?1, ?2)",
                        params![id, role],
                    )?;
                }
                let raw = load_user(&tx, "id = ?1", &id)?;
                tx.commit()?;
                Ok(raw)
            })
            .await
            .map_err(store_error)?;
        raw.map(RawUser::into_record).transpose()
    }

    async fn set_roles(
        &self,
        id: UserId,
        roles: Vec<String>,
    ) -> std::result::Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let exists = tx
                    .query_row("SELECT 1 FROM users WHERE id = ?1", [id.get()], |_| Ok(()))
                    .optional()?
                    .is_some();
                if !exists {
                    return Ok(false);
                }
                tx.execute("DELETE FROM user_roles WHERE user_id = ?1", [id.get()])?;
                for role in &roles {
                    tx.execute(
                        "INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?1, ?2)",
                        params![id.get(), role],
                    )?;
                }
                tx.commit()?;
                Ok(true)
            })
            .await
            .map_err(store_error)
    }
}

#[async_trait]
impl OwnershipLookup for SqliteStore {
    async fn owner_of(
        &self,
        resource: ResourceRef,
    ) -> std::result::Result<Option<OwnerKey>, StoreError> {
        let (sql, id) = match resource {
            ResourceRef::Song(id) => ("SELECT owner_id, owner_name FROM songs WHERE id = ?1", id.get()),
            ResourceRef::Playlist(id) => {
                ("SELECT owner_id, NULL FROM playlists WHERE id = ?1", id.get())
            }
            ResourceRef::Album(id) => ("SELECT owner_id, owner_name FROM albums WHERE id = ?1", id.get()),
        };
        let row: Option<(Option<i64>, Option<String>)> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(sql, [id], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?)
            })
            .await
            .map_err(store_error)?;
        Ok(row.and_then(|(owner_id, owner_name)| match (owner_id, owner_name) {
            (Some(id), _) => Some(OwnerKey::ById(UserId::new(id))),
            (None, Some(name)) => Some(OwnerKey::ByName(name)),
            (None, None) => None,
        }))
    }
}

#[async_trait]
impl RelationshipStore for SqliteStore {
    async fn subject_exists(&self, user: UserId) -> std::result::Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT 1 FROM users WHERE id = ?1", [user.get()], |_| Ok(()))
                    .optional()?
                    .is_some())
            })
            .await
            .map_err(store_error)
    }

    async fn object_exists(&self, object: ObjectRef) -> std::result::Result<bool, StoreError> {
        let (table, _, id) = counter_column(object);
        let sql = format!("SELECT 1 FROM {table} WHERE id = ?1");
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(&sql, [id], |_| Ok(()))
                    .optional()?
                    .is_some())
            })
            .await
            .map_err(store_error)
    }

    async fn counter(&self, object: ObjectRef) -> std::result::Result<u64, StoreError> {
        let (table, column, id) = counter_column(object);
        let sql = format!("SELECT {column} FROM {table} WHERE id = ?1");
        let value: Option<i64> = self
            .conn
            .call(move |conn| Ok(conn.query_row(&sql, [id], |row| row.get(0)).optional()?))
            .await
            .map_err(store_error)?;
        value
            .map(|value| value as u64)
            .ok_or_else(|| format!("unknown {object}").into())
    }

    async fn transact<R, F>(&self, work: F) -> std::result::Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn RelationshipTx) -> std::result::Result<R, StoreError> + Send + 'static,
    {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let output =
                    work(&mut SqliteTx { tx: &tx }).map_err(tokio_rusqlite::Error::Other)?;
                tx.commit()?;
                Ok(output)
            })
            .await
            .map_err(store_error)
    }

    async fn memberships(
        &self,
        user: UserId,
        kind: RelationKind,
    ) -> std::result::Result<Vec<RelationRecord>, StoreError> {
        let (table, column) = relation_table(kind);
        let sql = format!(
            "SELECT {column}, created_at FROM {table} WHERE user_id = ?1 \
             ORDER BY created_at DESC, rowid DESC"
        );
        let rows: Vec<(i64, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([user.get()], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(store_error)?;
        let mut records = Vec::with_capacity(rows.len());
        for (object, created_at) in rows {
            records.push(RelationRecord {
                key: RelationKey {
                    subject: user,
                    object: object_ref(kind, object),
                },
                created_at: decode_dt(&created_at)?,
            });
        }
        Ok(records)
    }

    async fn top_objects(
        &self,
        kind: RelationKind,
        limit: usize,
    ) -> std::result::Result<Vec<(ObjectRef, u64)>, StoreError> {
        let (table, column) = relation_table(kind);
        let objects = match kind {
            RelationKind::Follow => "artists",
            RelationKind::Like => "songs",
        };
        let sql = format!(
            "SELECT o.id, COUNT(r.user_id) AS members FROM {objects} o \
             LEFT JOIN {table} r ON r.{column} = o.id \
             GROUP BY o.id ORDER BY members DESC, o.id ASC LIMIT ?1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(i64, i64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([limit], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(store_error)?;
        Ok(rows
            .into_iter()
            .map(|(id, members)| (object_ref(kind, id), members as u64))
            .collect())
    }
}
