//! Proxy engine
//!
//! One accepted connection is one request loop: read a request head,
//! rewrite the control headers, authenticate the session cookie, pick a
//! backend, then couple the two pipelines back-to-back. The request body
//! relays on the accepting task while a second task relays the response,
//! so a backend may start answering before the upload finishes. Both
//! directions stream raw: body bytes cross the router byte-exact.

use crate::config::Config;
use crate::http::{BoxStream, ByteStream, Headers, MessageReader, MessageWriter, Side};
use crate::router::directory::{Backend, Directory};
use crate::router::login::LoginBackend;
use crate::router::sessions::SessionStore;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Server header stamped on every relayed response
const SERVER_HEADER: &str = "atom/0.0";

/// Everything a connection task needs to route requests
pub struct RouterContext {
    pub config: Config,
    pub sessions: Arc<SessionStore>,
    pub directory: Arc<dyn Directory>,
    pub login: Arc<LoginBackend>,
}

type Reader = MessageReader<ReadHalf<BoxStream>>;
type Writer = MessageWriter<WriteHalf<BoxStream>>;

enum Exchange {
    /// The exchange completed and the connection can carry another
    Next(Writer),
    /// The connection is spent: client asked to close, an error closed
    /// it, or the response had no framing to find the next boundary
    Close,
}

/// Serve one accepted client connection until it closes
pub async fn serve_connection<S: ByteStream + 'static>(
    ctx: Arc<RouterContext>,
    stream: S,
    remote_ip: String,
) {
    let boxed: BoxStream = Box::new(stream);
    let (read, write) = tokio::io::split(boxed);
    let mut reader = MessageReader::new(read);
    let mut writer = MessageWriter::new(write, Side::Server);

    debug!(client = %remote_ip, "connection accepted");
    loop {
        match serve_exchange(&ctx, &mut reader, writer, &remote_ip).await {
            Exchange::Next(returned) => writer = returned,
            Exchange::Close => return,
        }
    }
}

async fn serve_exchange(
    ctx: &Arc<RouterContext>,
    reader: &mut Reader,
    mut writer: Writer,
    remote_ip: &str,
) -> Exchange {
    let mut headers = match reader.read_request().await {
        Ok(headers) => headers,
        Err(e) => {
            info!(client = %remote_ip, "client disconnected: {}", e);
            return Exchange::Close;
        }
    };

    // Whether to keep the connection after this exchange is decided by
    // what the client sent, before the upstream rewrite below
    let connection_close = headers
        .get("Connection")
        .iter()
        .any(|v| v.eq_ignore_ascii_case("close"));

    let mut host = match headers.get_single("Host") {
        Ok(Some(host)) => host,
        Ok(None) => {
            return respond_and_close(writer, 404).await;
        }
        Err(e) => {
            info!(client = %remote_ip, "bad request: {}", e);
            writer.error_close().await;
            return Exchange::Close;
        }
    };

    // Strip the port when it is the scheme default
    if let Some((name, port)) = host.split_once(':') {
        let default_port = if ctx.config.secure { "443" } else { "80" };
        if port == default_port {
            host = name.to_string();
            headers.set("Host", &host);
        }
    }

    headers.set("X-Forwarded-For", remote_ip);
    headers.remove("X-Authenticated-User");
    headers.set("Connection", "close");

    let session_cookies = headers.get_cookie("atom-session");
    let uid = match ctx
        .sessions
        .validate_session(&host, &session_cookies, remote_ip)
    {
        Ok(uid) => uid,
        Err(e) => {
            error!(client = %remote_ip, "session validation failed: {}", e);
            writer.error_close().await;
            return Exchange::Close;
        }
    };
    if let Some(uid) = uid {
        headers.set("X-Authenticated-User", &uid.to_string());
    }

    // Dispatch: the login handler serves its own path and every
    // unauthenticated request; everything else needs a directory hit
    let connected = match uid {
        _ if headers.path() == "/+atom/login" => ctx.login.connect().await,
        None => ctx.login.connect().await,
        Some(uid) => {
            if headers.uri().starts_with("/+atom") {
                return respond_and_close(writer, 404).await;
            }
            match ctx.directory.check_authorization(uid, &host).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(client = %remote_ip, uid, host = %host, "authorization denied");
                    return respond_and_close(writer, 403).await;
                }
                Err(e) => {
                    error!("authorization check failed: {}", e);
                    writer.error_close().await;
                    return Exchange::Close;
                }
            }
            match ctx.directory.find_backend(&host, headers.uri()).await {
                Ok(Some(backend)) => {
                    headers.delete_cookie("atom-session");
                    backend.connect().await
                }
                Ok(None) => {
                    return respond_and_close(writer, 404).await;
                }
                Err(e) => {
                    error!("backend lookup failed: {}", e);
                    writer.error_close().await;
                    return Exchange::Close;
                }
            }
        }
    };

    let upstream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            error!(host = %host, "backend connect failed: {}", e);
            writer.error_close().await;
            return Exchange::Close;
        }
    };

    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let mut upstream_reader = MessageReader::new(upstream_read);
    let mut upstream_writer = MessageWriter::new(upstream_write, Side::Client);

    if let Err(e) = upstream_writer.send_headers(&headers).await {
        error!(host = %host, "failed to forward request head: {}", e);
        writer.error_close().await;
        return Exchange::Close;
    }
    let sent_method = upstream_writer.sent_method().to_string();

    // The response relays concurrently with the request body below. The
    // response task owns the client-side writer, so when its side of the
    // exchange fails it signals here and the backend writer is closed on
    // this task: both pipelines end up error-closed whichever direction
    // failed first.
    let backend_failed = Arc::new(Notify::new());
    let response_task = tokio::spawn(relay_response(
        upstream_reader,
        writer,
        sent_method,
        backend_failed.clone(),
    ));

    let mut request_ok = true;
    loop {
        tokio::select! {
            _ = backend_failed.notified() => {
                debug!("backend exchange failed; aborting request relay");
                request_ok = false;
                break;
            }
            chunk = reader.next_body_chunk(true) => match chunk {
                Ok(Some(chunk)) => {
                    if let Err(e) = upstream_writer.send_body(&chunk, true).await {
                        debug!("request body relay failed: {}", e);
                        request_ok = false;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("request body read failed: {}", e);
                    request_ok = false;
                    break;
                }
            }
        }
    }
    if !request_ok {
        upstream_writer.error_close().await;
    }

    match response_task.await {
        Ok(Some(returned)) if request_ok => {
            if connection_close {
                Exchange::Close
            } else {
                Exchange::Next(returned)
            }
        }
        _ => Exchange::Close,
    }
}

/// Relay the backend response to the client.
///
/// Returns the client-side writer when the exchange completed and the
/// connection can be reused; None when either side failed or the
/// response body had no framing (the close is the delimiter). Every
/// failure path error-closes the client side here and signals
/// `backend_failed` so the owning task closes the backend side too.
async fn relay_response(
    mut upstream_reader: Reader,
    mut writer: Writer,
    sent_method: String,
    backend_failed: Arc<Notify>,
) -> Option<Writer> {
    let mut response = match upstream_reader.read_response(&sent_method).await {
        Ok(response) => response,
        Err(e) => {
            debug!("failed to read backend response: {}", e);
            writer.error_close().await;
            backend_failed.notify_one();
            return None;
        }
    };
    let reusable = !upstream_reader.body_delimited_by_eof();

    response.set("Server", SERVER_HEADER);
    if let Err(e) = writer.send_headers(&response).await {
        debug!("failed to relay response head: {}", e);
        writer.close().await;
        backend_failed.notify_one();
        return None;
    }

    loop {
        match upstream_reader.next_body_chunk(true).await {
            Ok(Some(chunk)) => {
                if writer.send_body(&chunk, true).await.is_err() {
                    backend_failed.notify_one();
                    return None;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("response body relay failed: {}", e);
                backend_failed.notify_one();
                return None;
            }
        }
    }

    writer.finish_body();
    reusable.then_some(writer)
}

async fn respond_and_close(mut writer: Writer, code: u16) -> Exchange {
    let _ = writer.send_headers(&Headers::response(code)).await;
    writer.close().await;
    Exchange::Close
}
