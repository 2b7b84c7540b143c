//! Pluggable session storage backend.
//!
//! The [`SessionBackend`] trait abstracts over session persistence so that
//! callers can swap in their own store.
//!
//! Built-in backends:
//! * [`BinaryFileBackend`]: the binary record of [`PersistedSession`] in a file (default).
//! * [`InMemoryBackend`]: process-local, for tests and throwaway sessions.
//! * `SqliteBackend`: one row in an SQLite database (requires the
//!   `sqlite-session` Cargo feature).

use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::session::PersistedSession;

// ─── Trait ────────────────────────────────────────────────────────────────────

/// An abstraction over where and how session data is persisted.
pub trait SessionBackend: Send + Sync {
    /// Persist the given session.
    fn save(&self, session: &PersistedSession) -> io::Result<()>;

    /// Load a previously persisted session, or return `None` if none exists.
    fn load(&self) -> io::Result<Option<PersistedSession>>;

    /// Remove the stored session (e.g. after the server rejected the key).
    fn delete(&self) -> io::Result<()>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── BinaryFileBackend ────────────────────────────────────────────────────────

/// The default session backend: one binary record per file.
pub struct BinaryFileBackend {
    path: PathBuf,
}

impl BinaryFileBackend {
    /// Store the session at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionBackend for BinaryFileBackend {
    fn save(&self, session: &PersistedSession) -> io::Result<()> {
        session.save(&self.path)
    }

    fn load(&self) -> io::Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        PersistedSession::load(&self.path).map(Some)
    }

    fn delete(&self) -> io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn name(&self) -> &str { "binary-file" }
}

// ─── InMemoryBackend ─────────────────────────────────────────────────────────

/// An ephemeral session backend that stores nothing on disk.
///
/// The record lives as long as the backend, so sharing one `Arc` between
/// two clients lets the second reuse the first one's key.
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<Option<PersistedSession>>,
}

impl InMemoryBackend {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBackend for InMemoryBackend {
    fn save(&self, session: &PersistedSession) -> io::Result<()> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistedSession>> {
        Ok(self.data.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn delete(&self) -> io::Result<()> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── SqliteBackend ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-session")]
pub use sqlite_backend::SqliteBackend;

#[cfg(feature = "sqlite-session")]
mod sqlite_backend {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};
    use zeroize::Zeroizing;

    /// SQLite-backed session store.
    ///
    /// Keeps a single row in a `session` table, created on first use.
    ///
    /// Enable with the `sqlite-session` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// mtwire-client = { version = "*", features = ["sqlite-session"] }
    /// ```
    pub struct SqliteBackend {
        path: PathBuf,
    }

    fn sql(e: rusqlite::Error) -> io::Error {
        io::Error::other(e)
    }

    impl SqliteBackend {
        /// Open (or create) the database at `path`.
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            // Create the schema now so a bad path fails here, not on first save.
            let conn = Connection::open(&path).map_err(sql)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS session (
                    id          INTEGER PRIMARY KEY CHECK (id = 1),
                    auth_key    BLOB    NOT NULL,
                    key_id      INTEGER NOT NULL,
                    salt        INTEGER NOT NULL,
                    time_offset INTEGER NOT NULL,
                    endpoint    TEXT
                );",
            )
            .map_err(sql)?;
            Ok(Self { path })
        }
    }

    impl SessionBackend for SqliteBackend {
        fn save(&self, session: &PersistedSession) -> io::Result<()> {
            let conn = Connection::open(&self.path).map_err(sql)?;
            conn.execute(
                "INSERT OR REPLACE INTO session (id, auth_key, key_id, salt, time_offset, endpoint)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5)",
                params![
                    session.auth_key.as_slice(),
                    session.key_id(),
                    session.salt,
                    session.time_offset,
                    session.endpoint,
                ],
            )
            .map_err(sql)?;
            Ok(())
        }

        fn load(&self) -> io::Result<Option<PersistedSession>> {
            let conn = Connection::open(&self.path).map_err(sql)?;
            let row = conn
                .query_row(
                    "SELECT auth_key, key_id, salt, time_offset, endpoint FROM session WHERE id = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i32>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(sql)?;

            let Some((key, key_id, salt, time_offset, endpoint)) = row else {
                return Ok(None);
            };
            let key = Zeroizing::new(key);
            let auth_key: [u8; 256] = key.as_slice().try_into().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "stored auth key is not 256 bytes")
            })?;
            let session =
                PersistedSession { auth_key: Zeroizing::new(auth_key), salt, time_offset, endpoint };
            if session.key_id() != key_id {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "auth key id mismatch"));
            }
            Ok(Some(session))
        }

        fn delete(&self) -> io::Result<()> {
            let conn = Connection::open(&self.path).map_err(sql)?;
            conn.execute("DELETE FROM session", []).map_err(sql)?;
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn sqlite_backend_round_trips_and_deletes() {
            let path = std::env::temp_dir().join(format!("mtwire-sqlite-{}.db", std::process::id()));
            let backend = SqliteBackend::new(&path).unwrap();
            assert!(backend.load().unwrap().is_none());

            let session = PersistedSession {
                auth_key:    Zeroizing::new([9; 256]),
                salt:        -3,
                time_offset: 12,
                endpoint:    Some("10.0.0.1:443".into()),
            };
            backend.save(&session).unwrap();
            assert_eq!(backend.load().unwrap(), Some(session));

            backend.delete().unwrap();
            assert!(backend.load().unwrap().is_none());
            std::fs::remove_file(&path).unwrap();
        }
    }
}
