//! Directory of users, modules and hostnames
//!
//! The directory answers who may log in, which hosts exist, and how to
//! reach the module serving a host. Backends are hot-pluggable: anything
//! that can produce a connected byte stream, whether a UNIX-domain
//! socket of a spawned application or the router's own login handler on
//! an in-memory pair.

use crate::http::BoxStream;
use crate::router::database::Database;
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::UnixStream;

/// A connectable upstream for one dispatched request
#[async_trait]
pub trait Backend: Send + Sync {
    async fn connect(&self) -> Result<BoxStream>;
}

/// Lookups the router needs to authenticate and dispatch requests
#[async_trait]
pub trait Directory: Send + Sync {
    /// Host serving the login form; canonical issuer of session cookies
    fn system_hostname(&self) -> String;

    /// Default landing host for a user after login
    fn shell_hostname(&self, uid: i64) -> String;

    /// Check credentials, returning the user id on success
    async fn check_login(&self, username: &str, password: &str) -> Result<Option<i64>>;

    /// Whether this user may reach this host at all
    async fn check_authorization(&self, uid: i64, hostname: &str) -> Result<bool>;

    /// Resolve the backend serving `(hostname, uri)`, if any
    async fn find_backend(&self, hostname: &str, uri: &str) -> Result<Option<Box<dyn Backend>>>;
}

/// Backend reached over a UNIX-domain stream socket
pub struct UnixBackend {
    path: PathBuf,
}

impl UnixBackend {
    pub fn new(path: PathBuf) -> Self {
        UnixBackend { path }
    }
}

#[async_trait]
impl Backend for UnixBackend {
    async fn connect(&self) -> Result<BoxStream> {
        let stream = UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }
}

/// Directory backed by the `users` / `modules` / `hostnames` tables and
/// the runtime socket directory
pub struct HostDirectory {
    db: Arc<Database>,
    run_dir: PathBuf,
    system_hostname: String,
    shell_hostname: String,
}

impl HostDirectory {
    pub fn new(
        db: Arc<Database>,
        run_dir: PathBuf,
        system_hostname: String,
        shell_hostname: String,
    ) -> Result<Self> {
        db.with(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                     id INTEGER PRIMARY KEY, name TEXT, password TEXT);
                 INSERT OR REPLACE INTO users VALUES (0, 'system', NULL);
                 CREATE TABLE IF NOT EXISTS modules (
                     id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE IF NOT EXISTS hostnames (
                     id INTEGER PRIMARY KEY, hostname TEXT UNIQUE, module_id INTEGER)",
            )
        })?;
        Ok(HostDirectory {
            db,
            run_dir,
            system_hostname,
            shell_hostname,
        })
    }

    /// Socket path convention for a spawned application
    fn socket_path(&self, hostname: &str) -> PathBuf {
        self.run_dir.join(format!("app-{}", hostname)).join("socket")
    }
}

#[async_trait]
impl Directory for HostDirectory {
    fn system_hostname(&self) -> String {
        self.system_hostname.clone()
    }

    fn shell_hostname(&self, _uid: i64) -> String {
        self.shell_hostname.clone()
    }

    async fn check_login(&self, username: &str, password: &str) -> Result<Option<i64>> {
        let row: Option<(i64, Option<String>)> = self.db.with(|conn| {
            conn.query_row(
                "SELECT id, password FROM users WHERE name = ?1",
                [username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })
        })?;

        match row {
            // Accounts without a password (the system user) cannot log in
            Some((uid, Some(stored))) => {
                if stored.as_bytes().ct_eq(password.as_bytes()).into() {
                    Ok(Some(uid))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    async fn check_authorization(&self, uid: i64, _hostname: &str) -> Result<bool> {
        // Any registered user may reach any registered host; finer
        // per-host grants live with the modules themselves
        let known: bool = self.db.with(|conn| {
            conn.query_row("SELECT 1 FROM users WHERE id = ?1", [uid], |_| Ok(true))
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(false),
                    e => Err(e),
                })
        })?;
        Ok(known)
    }

    async fn find_backend(&self, hostname: &str, _uri: &str) -> Result<Option<Box<dyn Backend>>> {
        let registered: bool = self.db.with(|conn| {
            conn.query_row(
                "SELECT 1 FROM hostnames WHERE hostname = ?1",
                [hostname],
                |_| Ok(true),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                e => Err(e),
            })
        })?;
        if !registered {
            return Ok(None);
        }
        Ok(Some(Box::new(UnixBackend::new(self.socket_path(hostname)))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> HostDirectory {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dir = HostDirectory::new(
            db.clone(),
            PathBuf::from("/tmp/atom-test"),
            "sys.example".to_string(),
            "home.example".to_string(),
        )
        .unwrap();
        db.with(|conn| {
            conn.execute_batch(
                "INSERT INTO users VALUES (1, 'shane', 'test');
                 INSERT INTO modules VALUES (1, 'app');
                 INSERT INTO hostnames VALUES (1, 'app.example', 1)",
            )
        })
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_check_login() {
        let dir = directory();
        assert_eq!(dir.check_login("shane", "test").await.unwrap(), Some(1));
        assert_eq!(dir.check_login("shane", "wrong").await.unwrap(), None);
        assert_eq!(dir.check_login("nobody", "test").await.unwrap(), None);
        // The system user has no password and can never log in
        assert_eq!(dir.check_login("system", "").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_backend_resolves_registered_hosts() {
        let dir = directory();
        assert!(dir.find_backend("app.example", "/x").await.unwrap().is_some());
        assert!(dir.find_backend("ghost.example", "/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authorization_requires_known_user() {
        let dir = directory();
        assert!(dir.check_authorization(1, "app.example").await.unwrap());
        assert!(!dir.check_authorization(99, "app.example").await.unwrap());
    }

    #[test]
    fn test_socket_path_layout() {
        let dir = directory();
        assert_eq!(
            dir.socket_path("app.example"),
            PathBuf::from("/tmp/atom-test/app-app.example/socket")
        );
    }
}
