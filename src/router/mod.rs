//! Router core
//!
//! Session authentication, the directory of hosts and users, the login
//! handler, and the proxy engine that ties them to the HTTP plumbing.

pub mod database;
pub mod directory;
pub mod login;
pub mod proxy;
pub mod sessions;

pub use database::Database;
pub use directory::{Backend, Directory, HostDirectory, UnixBackend};
pub use login::LoginBackend;
pub use proxy::{serve_connection, RouterContext};
pub use sessions::SessionStore;
