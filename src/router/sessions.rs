//! Session store
//!
//! Sessions are rows in the `sessions` table, keyed by an opaque
//! 128-hex-character value drawn from the OS CSPRNG. A session is bound
//! to the `(user, hostname, remote ip)` triple it was created for and
//! expires 24 hours after it was last seen; expired rows are collected
//! on the next validation attempt.

use crate::router::database::Database;
use crate::Result;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tracing::debug;

const SESSION_MAX_AGE_SECS: i64 = 60 * 60 * 24;
const SESSION_KEY_BYTES: usize = 64;

pub struct SessionStore {
    db: Arc<Database>,
}

impl SessionStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS sessions (
                     id        INTEGER PRIMARY KEY,
                     user_id   INTEGER NOT NULL,
                     hostname  TEXT NOT NULL,
                     key       TEXT UNIQUE NOT NULL,
                     remote_ip TEXT NOT NULL,
                     created   INTEGER NOT NULL,
                     last_seen INTEGER NOT NULL)",
                [],
            )
        })?;
        Ok(SessionStore { db })
    }

    /// Validate the presented session cookies for a host.
    ///
    /// Each cookie is `"{uid}-{key}"`; malformed ones are skipped. The
    /// first key whose row matches `(uid, hostname, remote_ip)` exactly
    /// wins, refreshing its `last_seen`. Expired rows are deleted first.
    pub fn validate_session(
        &self,
        hostname: &str,
        cookies: &[String],
        remote_ip: &str,
    ) -> Result<Option<i64>> {
        if cookies.is_empty() {
            return Ok(None);
        }

        let mut uid_key_pairs: Vec<(i64, &str)> = Vec::new();
        for cookie in cookies {
            let parts: Vec<&str> = cookie.split('-').collect();
            if parts.len() != 2 {
                continue;
            }
            if let Ok(uid) = parts[0].parse::<i64>() {
                uid_key_pairs.push((uid, parts[1]));
            }
        }

        let now = Utc::now().timestamp();
        let cutoff = now - SESSION_MAX_AGE_SECS;
        self.db.with(|conn| {
            conn.execute("DELETE FROM sessions WHERE last_seen < ?1", [cutoff])?;

            for (uid, key) in &uid_key_pairs {
                let row: Option<(i64, String, String)> = conn
                    .query_row(
                        "SELECT user_id, hostname, remote_ip FROM sessions WHERE key = ?1",
                        [key],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        e => Err(e),
                    })?;

                match row {
                    Some((user_id, row_host, row_ip))
                        if user_id == *uid && row_host == hostname && row_ip == remote_ip =>
                    {
                        conn.execute(
                            "UPDATE sessions SET last_seen = ?1 WHERE key = ?2",
                            rusqlite::params![now, key],
                        )?;
                        return Ok(Some(*uid));
                    }
                    _ => continue,
                }
            }
            Ok(None)
        })
    }

    /// Create a session for a user on a host and return its cookie value
    pub fn create_session(&self, uid: i64, hostname: &str, remote_ip: &str) -> Result<String> {
        let key = generate_key();
        let now = Utc::now().timestamp();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO sessions (user_id, hostname, key, remote_ip, created, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![uid, hostname, key, remote_ip, now, now],
            )
        })?;
        debug!(uid, hostname, "session created");
        Ok(format!("{}-{}", uid, key))
    }

    /// Delete the sessions whose keys appear in the list.
    ///
    /// Accepts either bare keys or full `"{uid}-{key}"` cookie values.
    pub fn delete_sessions(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        self.db.with(|conn| {
            for key in keys {
                let bare = match key.split('-').collect::<Vec<_>>().as_slice() {
                    [_, k] => k.to_string(),
                    _ => key.clone(),
                };
                deleted += conn.execute("DELETE FROM sessions WHERE key = ?1", [&bare])?;
            }
            Ok(())
        })?;
        Ok(deleted)
    }
}

/// 64 bytes of OS randomness, hex-encoded: the 128-character session key
fn generate_key() -> String {
    let mut bytes = [0u8; SESSION_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
