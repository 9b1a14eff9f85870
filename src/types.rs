use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

const MAX_SUBJECT_LEN: usize = 254;

fn validate_subject(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId("subject must not be empty".to_string()));
    }
    if trimmed.len() > MAX_SUBJECT_LEN {
        return Err(Error::InvalidId(format!(
            "subject length must be <= {MAX_SUBJECT_LEN}"
        )));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(Error::InvalidId(
            "subject must not contain whitespace".to_string(),
        ));
    }
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => {
            return Err(Error::InvalidId(
                "subject must be an email address".to_string(),
            ));
        }
    }
    Ok(trimmed.to_string())
}

/// Login key carried in a token (an email address).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject(String);

impl Subject {
    /// Creates a validated subject.
    pub fn new(value: impl AsRef<str>) -> Result<Self> {
        validate_subject(value.as_ref()).map(Self)
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares two subjects ignoring ASCII case.
    pub fn eq_ignore_case(&self, other: &Subject) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Subject {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Subject {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for Subject {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Subject> for String {
    fn from(value: Subject) -> Self {
        value.0
    }
}

macro_rules! define_id_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database identifier.
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw identifier.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self> {
                value
                    .trim()
                    .parse::<i64>()
                    .map(Self)
                    .map_err(|_| Error::InvalidId(format!("{} must be an integer", $kind)))
            }
        }
    };
}

define_id_type!(
    /// User (account) identifier.
    UserId,
    "user id"
);
define_id_type!(
    /// Artist identifier.
    ArtistId,
    "artist id"
);
define_id_type!(
    /// Song identifier.
    SongId,
    "song id"
);
define_id_type!(
    /// Playlist identifier.
    PlaylistId,
    "playlist id"
);
define_id_type!(
    /// Album identifier.
    AlbumId,
    "album id"
);
