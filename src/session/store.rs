//! Session store backed by redb embedded database.
//!
//! Provides persistent storage for host sessions with:
//! - In-memory cache for hot sessions
//! - Replay prevention via assertion ID tracking
//! - TTL-based expiry

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::types::{Session, SessionId};

/// redb table for sessions (key: session_id hex, value: MessagePack bytes).
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sp_sessions");

/// redb table for consumed assertion IDs (key: assertion_id, value: expiry timestamp).
const ASSERTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sp_assertions");

/// Session store with in-memory cache and persistent storage.
pub struct SessionStore {
    /// redb database handle.
    db: Database,

    /// In-memory cache for frequently accessed sessions.
    cache: RwLock<HashMap<SessionId, Session>>,

    /// Default session TTL in seconds.
    default_ttl_secs: u64,

    /// Maximum number of sessions to keep in cache.
    max_cache_size: usize,
}

impl SessionStore {
    /// Open or create a session store at the given path.
    pub fn open(path: PathBuf, default_ttl_secs: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(ASSERTIONS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_active_sessions(&db)?;
        debug!(sessions = cache.len(), "Loaded active sessions into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            default_ttl_secs,
            max_cache_size: 10000,
        })
    }

    /// Get default TTL in seconds.
    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    /// Start a fresh, anonymous session using the default TTL.
    pub fn start(&self) -> Result<Session> {
        let session = Session::new(self.default_ttl_secs);
        self.create(session.clone())?;
        Ok(session)
    }

    /// Store a new session.
    pub fn create(&self, session: Session) -> Result<SessionId> {
        let id = session.id;
        self.save(&session)?;
        Ok(id)
    }

    /// Persist changes to a session and refresh the cache entry.
    pub fn save(&self, session: &Session) -> Result<()> {
        self.persist(session)?;

        if let Ok(mut cache) = self.cache.write() {
            if !cache.contains_key(&session.id) && cache.len() >= self.max_cache_size {
                self.evict_cache_lru(&mut cache);
            }
            cache.insert(session.id, session.clone());
        }

        Ok(())
    }

    /// Get session by ID, updating last_accessed time.
    pub fn get(&self, id: SessionId) -> Result<Option<Session>> {
        if let Ok(mut cache) = self.cache.write() {
            if let Some(session) = cache.get_mut(&id) {
                if session.is_expired() {
                    cache.remove(&id);
                    // Left in the database for the cleanup task
                    return Ok(None);
                }
                session.touch();
                let _ = self.persist(session);
                return Ok(Some(session.clone()));
            }
        }

        let stored: Option<Vec<u8>> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_hex();
            let value = table.get(key.as_str())?;
            value.map(|v| v.value().to_vec())
        };

        match stored {
            Some(bytes) => {
                let mut session: Session =
                    rmp_serde::from_slice(&bytes).context("Failed to deserialize session")?;

                if session.is_expired() {
                    return Ok(None);
                }

                session.touch();

                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(id, session.clone());
                }

                let _ = self.persist(&session);

                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Delete a session by ID.
    pub fn delete(&self, id: SessionId) -> Result<bool> {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&id);
        }

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_hex();
            let result = table.remove(key.as_str())?;
            result.is_some()
        };
        write_txn.commit()?;

        Ok(removed)
    }

    /// Delete every session bound to a SAML NameID (IdP-initiated logout).
    pub fn delete_by_name_id(&self, name_id: &str) -> Result<usize> {
        let mut deleted = 0;

        let sessions_to_delete: Vec<SessionId> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let session: Session = rmp_serde::from_slice(value.value())?;
                if session.name_id() == Some(name_id) {
                    ids.push(session.id);
                }
            }
            ids
        };

        for id in sessions_to_delete {
            if self.delete(id)? {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    /// Check if an assertion ID has been consumed already.
    pub fn is_assertion_used(&self, assertion_id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ASSERTIONS_TABLE)?;
        Ok(table.get(assertion_id)?.is_some())
    }

    /// Record an assertion ID as consumed until `expires_at`.
    pub fn mark_assertion_used(&self, assertion_id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let data = rmp_serde::to_vec(&expires_at)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ASSERTIONS_TABLE)?;
            table.insert(assertion_id, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Evict all expired sessions and assertion records.
    /// Returns the number of sessions evicted.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();

        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, session| !session.is_expired());
        }

        let expired_sessions: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<Session>(value.value()) {
                    Ok(session) if session.is_expired() => {
                        ids.push(key.value().to_string());
                    }
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Failed to deserialize session, marking for deletion");
                        ids.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            ids
        };

        let mut evicted = 0;
        if !expired_sessions.is_empty() {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(SESSIONS_TABLE)?;
                for id in &expired_sessions {
                    if table.remove(id.as_str())?.is_some() {
                        evicted += 1;
                    }
                }
            }
            write_txn.commit()?;
        }

        let expired_assertions: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(ASSERTIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<DateTime<Utc>>(value.value()) {
                    Ok(expires_at) if now > expires_at => {
                        ids.push(key.value().to_string());
                    }
                    Err(_) => {
                        ids.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            ids
        };

        if !expired_assertions.is_empty() {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(ASSERTIONS_TABLE)?;
                for id in &expired_assertions {
                    table.remove(id.as_str())?;
                }
            }
            write_txn.commit()?;
        }

        Ok(evicted)
    }

    /// Number of stored sessions, expired ones included until cleanup.
    pub fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let data = rmp_serde::to_vec(session).context("Failed to serialize session")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(session.id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_active_sessions(db: &Database) -> Result<HashMap<SessionId, Session>> {
        let mut sessions = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        for entry in table.iter()? {
            let (_, value) = entry?;
            if let Ok(session) = rmp_serde::from_slice::<Session>(value.value()) {
                if !session.is_expired() {
                    sessions.insert(session.id, session);
                }
            }
        }

        Ok(sessions)
    }

    /// Drop the least recently accessed session from the cache.
    fn evict_cache_lru(&self, cache: &mut HashMap<SessionId, Session>) {
        if let Some(oldest_id) = cache
            .iter()
            .min_by_key(|(_, s)| s.last_accessed)
            .map(|(id, _)| *id)
        {
            cache.remove(&oldest_id);
        }
    }
}
