//! Identity and access control for a music catalog service.
//!
//! This crate provides signed bearer tokens, role normalisation, per-request
//! identity resolution, authorization guards and a follow/like toggler that
//! keeps denormalised counters consistent. Persistence is behind async store
//! traits. Resolution is permissive and authorization is strict: a bad token
//! makes the caller anonymous, and the [`Guard`] decides what anonymous
//! callers may do.
//!
//! # Examples
//!
//! Resolving a request and checking a role (enable `memory-store`):
//! ```no_run
//! use std::sync::Arc;
//! use rs_catalog_auth::{IdentityResolver, Role, TokenCodec, require_role};
//! # #[cfg(feature = "memory-store")]
//! # {
//! use rs_catalog_auth::MemoryStore;
//! let store = MemoryStore::new();
//! store.add_user("artist@example.com", "Nova", &["ROLE_ARTIST"]).unwrap();
//! let codec = Arc::new(TokenCodec::new("0123456789abcdef0123456789abcdef").unwrap());
//! let token = codec.issue_now(&"artist@example.com".try_into().unwrap()).unwrap();
//! let resolver = IdentityResolver::new(codec, store);
//! let header = format!("Bearer {}", token.as_str());
//! let identity = futures::executor::block_on(resolver.resolve_authorization(Some(&header))).unwrap();
//! assert!(require_role(&identity, &Role::Artist).is_ok());
//! # }
//! ```
//!
//! Loading settings at startup:
//! ```no_run
//! use rs_catalog_auth::{AuthConfig, TokenCodec};
//! let config = AuthConfig::load(Some("auth.toml".as_ref())).unwrap();
//! let codec = TokenCodec::from_config(&config).unwrap();
//! # let _ = codec;
//! ```
#![forbid(unsafe_code)]

mod accounts;
mod error;
mod guard;
mod identity;
mod middleware;
mod password;
mod role;
mod settings;
mod store;
mod toggle;
mod token;
mod types;

#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "sqlite-store")]
mod sqlite_store;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::accounts::{Accounts, Login, Registration};
pub use crate::error::{Error, Result, StoreError, TxConflict, is_conflict};
pub use crate::guard::{
    Guard, OwnerKey, require_authenticated, require_owner_of, require_ownership, require_role,
    require_self,
};
pub use crate::identity::{Identity, IdentityStore};
pub use crate::middleware::IdentityResolver;
pub use crate::password::{hash_password, verify_password};
pub use crate::role::{ROLE_PREFIX, Role, normalize_roles};
pub use crate::settings::{AuthConfig, ENV_PREFIX};
pub use crate::store::{
    NewUser, OwnershipLookup, RelationRecord, RelationshipStore, RelationshipTx, ResourceRef,
    UserDirectory, UserRecord, UserRegistry,
};
pub use crate::toggle::{
    ObjectRef, Reconciled, RelationKey, RelationKind, Toggle, ToggleManager, Toggled,
};
pub use crate::token::{MIN_SECRET_LEN, Token, TokenCodec, TokenError};
pub use crate::types::{AlbumId, ArtistId, PlaylistId, SongId, Subject, UserId};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;

#[cfg(feature = "sqlite-store")]
pub use crate::sqlite_store::SqliteStore;
