//! Login handler
//!
//! Serves `GET`/`POST /+atom/login` on the system host and the key
//! handoff on destination hosts. The handler is an internal [`Backend`]:
//! each connect spawns a handler task behind an in-memory socket pair,
//! so the proxy engine drives it through the exact same pipeline code as
//! an external application socket.

use crate::http::{pair, BoxStream, Expiry, Headers, MessageReader, MessageWriter, PairStream, Side};
use crate::router::directory::{Backend, Directory};
use crate::router::sessions::SessionStore;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use std::sync::Arc;
use tokio::io::WriteHalf;
use tracing::debug;

/// Placeholder login page; a deployment ships its own template
const LOGIN_PAGE: &str = "<!DOCTYPE html>\n\
<html>\n\
<head><title>Sign in</title></head>\n\
<body>\n\
<p>$message</p>\n\
<form method=\"post\" action=\"$post_url\">\n\
<input name=\"username\" placeholder=\"Username\">\n\
<input name=\"password\" type=\"password\" placeholder=\"Password\">\n\
<button type=\"submit\">Sign in</button>\n\
</form>\n\
</body>\n\
</html>\n";

type PairWriter = MessageWriter<WriteHalf<PairStream>>;

/// The login handler as a connectable backend
pub struct LoginBackend {
    sessions: Arc<SessionStore>,
    directory: Arc<dyn Directory>,
    secure: bool,
}

impl LoginBackend {
    pub fn new(sessions: Arc<SessionStore>, directory: Arc<dyn Directory>, secure: bool) -> Self {
        LoginBackend {
            sessions,
            directory,
            secure,
        }
    }
}

#[async_trait]
impl Backend for LoginBackend {
    async fn connect(&self) -> Result<BoxStream> {
        let (client, server) = pair();
        let handler = LoginHandler {
            sessions: self.sessions.clone(),
            directory: self.directory.clone(),
            secure: self.secure,
        };
        tokio::spawn(async move {
            if let Err(e) = handler.serve(server).await {
                debug!(error = %e, "login exchange failed");
            }
        });
        Ok(Box::new(client))
    }
}

struct LoginHandler {
    sessions: Arc<SessionStore>,
    directory: Arc<dyn Directory>,
    secure: bool,
}

impl LoginHandler {
    async fn serve(&self, stream: PairStream) -> Result<()> {
        let (read, write) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read);
        let mut writer = MessageWriter::new(write, Side::Server);

        let headers = reader.read_request().await?;
        let host = headers.get_single("Host")?.unwrap_or_default();
        let remote_ip = headers.get_single("X-Forwarded-For")?.unwrap_or_default();
        let existing_keys = headers.get_cookie("atom-session");
        let uid = headers
            .get_single("X-Authenticated-User")?
            .and_then(|v| v.parse::<i64>().ok());
        let system_host = self.directory.system_hostname();

        debug!(method = %headers.method(), host = %host, uri = %headers.uri(),
               "login handler request");

        if headers.path() != "/+atom/login" {
            // The router only routes other paths here for clients that
            // are not logged in; send them to the login form with a
            // return pointer back to where they were headed
            if uid.is_some() {
                writer.send_headers(&Headers::response(500)).await?;
                writer.close().await;
                return Ok(());
            }
            let ret = URL_SAFE.encode(format!("{}{}", host, headers.uri()));
            let target = format!("{}/+atom/login?return={}", system_host, ret);
            return self.redirect(&mut writer, &target, None).await;
        }

        if host == system_host {
            match headers.method() {
                "GET" => match uid {
                    Some(uid) => {
                        self.return_redirect(&mut writer, &headers, &host, &remote_ip, uid, None)
                            .await
                    }
                    None => self.show_login(&mut writer, &headers, "").await,
                },
                "POST" => {
                    let form = reader.read_form_body(&headers).await?;
                    let username = form.get("username").and_then(|v| v.first());
                    let password = form.get("password").and_then(|v| v.first());
                    let uid = match (username, password) {
                        (Some(user), Some(pass)) => self.directory.check_login(user, pass).await?,
                        _ => None,
                    };
                    match uid {
                        Some(uid) => {
                            let key = self.sessions.create_session(uid, &host, &remote_ip)?;
                            self.return_redirect(
                                &mut writer,
                                &headers,
                                &host,
                                &remote_ip,
                                uid,
                                Some(key),
                            )
                            .await
                        }
                        None => {
                            self.show_login(&mut writer, &headers, "Invalid username or password")
                                .await
                        }
                    }
                }
                _ => self.method_not_allowed(&mut writer, "GET, HEAD, POST").await,
            }
        } else {
            match headers.method() {
                "GET" => {
                    let validated = match headers.arg("key") {
                        Some(key) => self
                            .sessions
                            .validate_session(&host, &[key.clone()], &remote_ip)?
                            .map(|_| key),
                        None => None,
                    };
                    match validated {
                        Some(key) => {
                            // The handoff key replaces whatever stale
                            // sessions the client was still presenting
                            self.sessions.delete_sessions(&existing_keys)?;
                            let host_and_path = match headers.arg("return") {
                                Some(encoded) => decode_return(&encoded)?,
                                None => format!("{}/", host),
                            };
                            self.redirect(&mut writer, &host_and_path, Some(&key)).await
                        }
                        None => {
                            let target = format!("{}/+atom/login", system_host);
                            self.redirect(&mut writer, &target, None).await
                        }
                    }
                }
                _ => self.method_not_allowed(&mut writer, "GET, HEAD").await,
            }
        }
    }

    /// Redirect to the return URL, minting a session for the destination
    /// host first when it differs from the current one
    async fn return_redirect(
        &self,
        writer: &mut PairWriter,
        headers: &Headers,
        host: &str,
        remote_ip: &str,
        uid: i64,
        key: Option<String>,
    ) -> Result<()> {
        let host_and_path = match headers.arg("return") {
            Some(encoded) => decode_return(&encoded)?,
            None => format!("{}/", self.directory.shell_hostname(uid)),
        };
        let return_host = host_and_path.split('/').next().unwrap_or("");
        if return_host != host {
            let return_key = self.sessions.create_session(uid, return_host, remote_ip)?;
            let forwarded = format!(
                "{}/+atom/login?key={}&return={}",
                return_host,
                return_key,
                URL_SAFE.encode(&host_and_path)
            );
            self.redirect(writer, &forwarded, key.as_deref()).await
        } else {
            self.redirect(writer, &host_and_path, key.as_deref()).await
        }
    }

    async fn redirect(
        &self,
        writer: &mut PairWriter,
        host_and_path: &str,
        key: Option<&str>,
    ) -> Result<()> {
        let scheme = if self.secure { "https://" } else { "http://" };
        let mut response = Headers::response(302);
        response.set("Location", &format!("{}{}", scheme, host_and_path));
        if let Some(key) = key {
            response.set_cookie("atom-session", key, Expiry::Never, self.secure, true, Some("/"));
        }
        writer.send_headers(&response).await?;
        writer.close().await;
        Ok(())
    }

    async fn show_login(
        &self,
        writer: &mut PairWriter,
        headers: &Headers,
        message: &str,
    ) -> Result<()> {
        let post_url = match headers.arg("return") {
            Some(ret) if is_return_token(&ret) => format!("/+atom/login?return={}", ret),
            _ => "/+atom/login".to_string(),
        };
        let page = LOGIN_PAGE
            .replace("$message", message)
            .replace("$post_url", &post_url);

        let mut response = Headers::response(200);
        response.set("Content-Type", "text/html");
        writer.send_headers(&response).await?;
        writer.send_body(page.as_bytes(), false).await?;
        writer.close().await;
        Ok(())
    }

    async fn method_not_allowed(&self, writer: &mut PairWriter, allow: &str) -> Result<()> {
        let mut response = Headers::response(405);
        response.set("Allow", allow);
        writer.send_headers(&response).await?;
        writer.close().await;
        Ok(())
    }
}

/// Only clean urlsafe-base64 tokens may flow back into the post URL
fn is_return_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '=' || c == '_' || c == '-')
}

fn decode_return(encoded: &str) -> Result<String> {
    let bytes = URL_SAFE
        .decode(encoded)
        .map_err(|_| Error::parse("invalid return parameter"))?;
    String::from_utf8(bytes).map_err(|_| Error::parse("invalid return parameter"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::database::Database;
    use crate::router::directory::HostDirectory;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn backend() -> (LoginBackend, Arc<SessionStore>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sessions = Arc::new(SessionStore::new(db.clone()).unwrap());
        let directory = Arc::new(
            HostDirectory::new(
                db.clone(),
                PathBuf::from("/tmp/atom-test"),
                "sys.example".to_string(),
                "home.example".to_string(),
            )
            .unwrap(),
        );
        db.with(|conn| conn.execute("INSERT INTO users VALUES (1, 'shane', 'test')", []))
            .unwrap();
        (
            LoginBackend::new(sessions.clone(), directory, false),
            sessions,
        )
    }

    async fn exchange(backend: &LoginBackend, request: &str) -> String {
        let mut stream = backend.connect().await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn test_unauth_other_path_redirects_to_login() {
        let (backend, _) = backend();
        let response = exchange(
            &backend,
            "GET /foo HTTP/1.1\r\nHost: app.example\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
        )
        .await;
        let expected_return = URL_SAFE.encode("app.example/foo");
        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(response.contains(&format!(
            "Location: http://sys.example/+atom/login?return={}\r\n",
            expected_return
        )));
    }

    #[tokio::test]
    async fn test_login_form_rendered_with_return() {
        let (backend, _) = backend();
        let ret = URL_SAFE.encode("app.example/foo");
        let request = format!(
            "GET /+atom/login?return={} HTTP/1.1\r\nHost: sys.example\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
            ret
        );
        let response = exchange(&backend, &request).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/html"));
        assert!(response.contains(&format!("action=\"/+atom/login?return={}\"", ret)));
    }

    #[tokio::test]
    async fn test_login_form_drops_unclean_return() {
        let (backend, _) = backend();
        let response = exchange(
            &backend,
            "GET /+atom/login?return=b%40d HTTP/1.1\r\nHost: sys.example\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
        )
        .await;
        assert!(response.contains("action=\"/+atom/login\""));
    }

    #[tokio::test]
    async fn test_post_with_bad_credentials() {
        let (backend, _) = backend();
        let body = "username=shane&password=nope";
        let request = format!(
            "POST /+atom/login HTTP/1.1\r\nHost: sys.example\r\nX-Forwarded-For: 10.0.0.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let response = exchange(&backend, &request).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Invalid username or password"));
    }

    #[tokio::test]
    async fn test_post_logs_in_and_hands_off_to_shell_host() {
        let (backend, sessions) = backend();
        let body = "username=shane&password=test";
        let request = format!(
            "POST /+atom/login HTTP/1.1\r\nHost: sys.example\r\nX-Forwarded-For: 10.0.0.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let response = exchange(&backend, &request).await;
        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
        // System-host cookie for the session just created
        assert!(response.contains("Set-Cookie: atom-session=1-"));
        assert!(response.contains("; HttpOnly"));
        // Handoff to the shell host with a second, host-scoped key
        let location = response
            .lines()
            .find_map(|l| l.strip_prefix("Location: "))
            .unwrap();
        let expected_return = URL_SAFE.encode("home.example/");
        assert!(location.starts_with("http://home.example/+atom/login?key=1-"));
        assert!(location.ends_with(&format!("&return={}", expected_return)));

        // The handoff key validates for the shell host
        let key = location
            .split("key=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap()
            .to_string();
        assert_eq!(
            sessions
                .validate_session("home.example", &[key], "10.0.0.1")
                .unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_destination_host_accepts_valid_key() {
        let (backend, sessions) = backend();
        let key = sessions.create_session(1, "app.example", "10.0.0.1").unwrap();
        let stale = sessions.create_session(1, "app.example", "10.0.0.1").unwrap();
        let request = format!(
            "GET /+atom/login?key={} HTTP/1.1\r\nHost: app.example\r\n\
             X-Forwarded-For: 10.0.0.1\r\nCookie: atom-session={}\r\n\r\n",
            key, stale
        );
        let response = exchange(&backend, &request).await;
        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(response.contains("Location: http://app.example/\r\n"));
        assert!(response.contains(&format!("Set-Cookie: atom-session={};", key)));
        // The stale presented session is gone, the handoff key survives
        assert_eq!(
            sessions
                .validate_session("app.example", &[stale], "10.0.0.1")
                .unwrap(),
            None
        );
        assert_eq!(
            sessions
                .validate_session("app.example", &[key], "10.0.0.1")
                .unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_destination_host_without_key_redirects_to_system() {
        let (backend, _) = backend();
        let response = exchange(
            &backend,
            "GET /+atom/login HTTP/1.1\r\nHost: app.example\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
        )
        .await;
        assert!(response.contains("Location: http://sys.example/+atom/login\r\n"));
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (backend, _) = backend();
        let response = exchange(
            &backend,
            "DELETE /+atom/login HTTP/1.1\r\nHost: sys.example\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.contains("Allow: GET, HEAD, POST\r\n"));

        let response = exchange(
            &backend,
            "PUT /+atom/login HTTP/1.1\r\nHost: app.example\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
        )
        .await;
        assert!(response.contains("Allow: GET, HEAD\r\n"));
    }
}
