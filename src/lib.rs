//! atom-router - Authenticating HTTP/1.1 reverse-proxy router
//!
//! Terminates client TCP connections, authenticates an opaque session
//! cookie against a SQLite directory, rewrites a fixed set of control
//! headers, and streams each exchange to a per-host backend - either an
//! application behind a UNIX-domain socket or the built-in login handler
//! behind an in-memory socket pair.
//!
//! # Architecture
//!
//! ```text
//!  TCP client
//!      |
//! +----v------+     +------------+     +-------------------+
//! |  http/    |     |  router/   |     |  router/sessions  |
//! | (framing, +-----> (proxy     +----->  router/directory |
//! |  pipeline)|     |  engine)   |     |  (SQLite)         |
//! +-----------+     +-----+------+     +-------------------+
//!                         |
//!            +------------+------------+
//!            |                         |
//!    +-------v-------+        +--------v--------+
//!    | UNIX backend  |        | login handler   |
//!    | (per module)  |        | (socket pair)   |
//!    +---------------+        +-----------------+
//! ```

pub mod common;
pub mod config;
pub mod http;
pub mod router;

pub use common::error::{Error, Result};
pub use config::Config;

use router::{
    serve_connection, Database, Directory, HostDirectory, LoginBackend, RouterContext,
    SessionStore,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Router version
pub const VERSION: &str = "0.1.0";

/// Router instance owning the session store, the directory, and the
/// public listener
pub struct Router {
    context: Arc<RouterContext>,
}

impl Router {
    /// Create a new Router from configuration
    pub fn new(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open(&config.database)?);
        let sessions = Arc::new(SessionStore::new(db.clone())?);
        let directory: Arc<dyn Directory> = Arc::new(HostDirectory::new(
            db,
            config.run_dir.clone(),
            config.system_hostname.clone(),
            config.shell_hostname().to_string(),
        )?);
        let login = Arc::new(LoginBackend::new(
            sessions.clone(),
            directory.clone(),
            config.secure,
        ));
        Ok(Router {
            context: Arc::new(RouterContext {
                config,
                sessions,
                directory,
                login,
            }),
        })
    }

    /// Bind the configured listener and serve forever
    pub async fn run(&self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.context.config.listen, self.context.config.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("router listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let ctx = self.context.clone();
                    tokio::spawn(async move {
                        serve_connection(ctx, stream, peer.ip().to_string()).await;
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }
}
