//! HTTP/1.1 message headers
//!
//! A parsed request or response head: first line plus an ordered list of
//! header fields. Fields keep their original casing and their raw value
//! bytes so a forwarded message serializes back byte-exact; lookups go
//! through a lowercased copy of the name. Only HTTP/1.1 is accepted.

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Reason phrases for the status codes the router itself emits
fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Cookie expiry attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Rendered as the last second of 32-bit time, i.e. never
    Never,
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StartLine {
    Request { method: String, uri: String },
    Response { code: u16, reason: String },
}

/// One header field: lowercased name for lookups, original name and raw
/// value (usually starting with a space) for serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    lower: String,
    name: String,
    value: String,
}

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
}

/// A parsed HTTP/1.1 message head
#[derive(Debug)]
pub struct Headers {
    start: StartLine,
    fields: Vec<Field>,
    chunked: Mutex<Option<bool>>,
    content_length: Mutex<Option<Option<u64>>>,
}

/// At most three whitespace-separated fields, the last one keeping any
/// internal whitespace (a response reason phrase may contain spaces).
fn split_start_line(line: &str) -> Vec<&str> {
    let mut parts = Vec::with_capacity(3);
    let mut rest = line.trim_start_matches(|c: char| c.is_ascii_whitespace());
    while parts.len() < 2 {
        match rest.find(|c: char| c.is_ascii_whitespace()) {
            Some(i) => {
                parts.push(&rest[..i]);
                rest = rest[i..].trim_start_matches(|c: char| c.is_ascii_whitespace());
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        parts.push(rest);
    }
    parts
}

impl Headers {
    fn new(start: StartLine) -> Self {
        Headers {
            start,
            fields: Vec::new(),
            chunked: Mutex::new(None),
            content_length: Mutex::new(None),
        }
    }

    /// Build a request head for transmission
    pub fn request<M: Into<String>, U: Into<String>>(method: M, uri: U) -> Self {
        Headers::new(StartLine::Request {
            method: method.into(),
            uri: uri.into(),
        })
    }

    /// Build a response head with the standard reason phrase
    pub fn response(code: u16) -> Self {
        Headers::new(StartLine::Response {
            code,
            reason: status_text(code).to_string(),
        })
    }

    /// Parse the line sequence between the first line and the blank line
    pub fn parse(kind: Kind, lines: &[String]) -> Result<Self> {
        let first = lines
            .first()
            .ok_or_else(|| Error::syntax("Empty message head"))?;
        let parts = split_start_line(first);
        if parts.len() < 3 {
            return Err(Error::syntax(format!("Invalid first line: \"{}\"", first)));
        }

        let (version, start) = match kind {
            Kind::Request => (
                parts[2],
                StartLine::Request {
                    method: parts[0].to_string(),
                    uri: parts[1].to_string(),
                },
            ),
            Kind::Response => {
                let code = parts[1].parse::<u16>().map_err(|_| {
                    Error::syntax(format!("Invalid first line: \"{}\"", first))
                })?;
                (
                    parts[0],
                    StartLine::Response {
                        code,
                        reason: parts[2].to_string(),
                    },
                )
            }
        };

        if version != "HTTP/1.1" {
            return Err(Error::syntax(format!("Unknown HTTP version: \"{}\"", version)));
        }

        let mut this = Headers::new(start);

        // Continuation lines fold into the previous header with a literal
        // CRLF so the field serializes back exactly as received.
        let mut current: Option<String> = None;
        for line in &lines[1..] {
            if line.starts_with(' ') || line.starts_with('\t') {
                match current.as_mut() {
                    Some(header) => {
                        header.push_str("\r\n");
                        header.push_str(line);
                    }
                    None => return Err(Error::syntax(format!("Invalid header: \"{}\"", line))),
                }
            } else {
                if let Some(header) = current.take() {
                    this.add_field_line(&header)?;
                }
                current = Some(line.clone());
            }
        }
        if let Some(header) = current.take() {
            this.add_field_line(&header)?;
        }

        this.check_syntax()?;
        Ok(this)
    }

    fn add_field_line(&mut self, header: &str) -> Result<()> {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| Error::syntax(format!("Invalid header: \"{}\"", header)))?;
        self.add_raw(name, value);
        Ok(())
    }

    /// Append a field keeping the raw value verbatim (wire form)
    fn add_raw(&mut self, name: &str, raw_value: &str) {
        self.fields.push(Field {
            lower: name.trim().to_ascii_lowercase(),
            name: name.to_string(),
            value: raw_value.to_string(),
        });
        self.invalidate();
    }

    pub fn kind(&self) -> Kind {
        match self.start {
            StartLine::Request { .. } => Kind::Request,
            StartLine::Response { .. } => Kind::Response,
        }
    }

    pub fn method(&self) -> &str {
        match &self.start {
            StartLine::Request { method, .. } => method,
            StartLine::Response { .. } => "",
        }
    }

    pub fn uri(&self) -> &str {
        match &self.start {
            StartLine::Request { uri, .. } => uri,
            StartLine::Response { .. } => "",
        }
    }

    pub fn code(&self) -> u16 {
        match &self.start {
            StartLine::Response { code, .. } => *code,
            StartLine::Request { .. } => 0,
        }
    }

    /// Serialize the head: first line, fields, terminating blank line
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(method);
                out.push(' ');
                out.push_str(uri);
                out.push_str(" HTTP/1.1");
            }
            StartLine::Response { code, reason } => {
                out.push_str("HTTP/1.1 ");
                out.push_str(&code.to_string());
                out.push(' ');
                out.push_str(reason);
            }
        }
        for field in &self.fields {
            out.push_str("\r\n");
            out.push_str(&field.name);
            out.push(':');
            out.push_str(&field.value);
        }
        out.push_str("\r\n\r\n");
        out.into_bytes()
    }

    /// Append a field; a single space is inserted before the value
    pub fn add(&mut self, name: &str, value: &str) {
        let mut raw = String::with_capacity(value.len() + 1);
        raw.push(' ');
        raw.push_str(value);
        self.add_raw(name, &raw);
    }

    /// Remove all fields with this name
    pub fn remove(&mut self, name: &str) {
        let lower = name.to_ascii_lowercase();
        self.fields.retain(|f| f.lower != lower);
        self.invalidate();
    }

    /// Replace all fields with this name by a single one
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.add(name, value);
    }

    /// All values for this name, trimmed, in field order
    pub fn get(&self, name: &str) -> Vec<String> {
        let lower = name.to_ascii_lowercase();
        self.fields
            .iter()
            .filter(|f| f.lower == lower)
            .map(|f| f.value.trim().to_string())
            .collect()
    }

    /// The value for this name; an error if the field repeats
    pub fn get_single(&self, name: &str) -> Result<Option<String>> {
        let mut values = self.get(name);
        if values.len() > 1 {
            return Err(Error::syntax(format!(
                "Header \"{}\" present multiple times",
                name
            )));
        }
        Ok(values.pop())
    }

    /// Validate the framing headers
    pub fn check_syntax(&self) -> Result<()> {
        self.chunked()?;
        self.content_length()?;
        Ok(())
    }

    fn invalidate(&mut self) {
        *self.chunked.lock() = None;
        *self.content_length.lock() = None;
    }

    /// Whether the message body uses chunked transfer coding.
    ///
    /// True iff the last token of the combined Transfer-Encoding value is
    /// `chunked`; `chunked` anywhere earlier is a syntax error.
    pub fn chunked(&self) -> Result<bool> {
        if let Some(cached) = *self.chunked.lock() {
            return Ok(cached);
        }
        let mut encodings: Vec<String> = Vec::new();
        for field in &self.fields {
            if field.lower == "transfer-encoding" {
                encodings.extend(
                    field
                        .value
                        .split(';')
                        .map(|token| token.trim().to_ascii_lowercase()),
                );
            }
        }
        let mut chunked = false;
        if let Some((last, earlier)) = encodings.split_last() {
            chunked = last == "chunked";
            if earlier.iter().any(|e| e == "chunked") {
                return Err(Error::syntax("Invalid Transfer-Encoding"));
            }
        }
        *self.chunked.lock() = Some(chunked);
        Ok(chunked)
    }

    /// The declared body length, if any.
    ///
    /// Ignored (None) whenever a Transfer-Encoding header is present;
    /// repeated or non-integer values are syntax errors.
    pub fn content_length(&self) -> Result<Option<u64>> {
        if let Some(cached) = *self.content_length.lock() {
            return Ok(cached);
        }
        if self.fields.iter().any(|f| f.lower == "transfer-encoding") {
            return Ok(None);
        }
        let values: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.lower == "content-length")
            .map(|f| f.value.as_str())
            .collect();
        let length = match values.len() {
            0 => None,
            1 => Some(
                values[0]
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| Error::syntax("Invalid Content-Length"))?,
            ),
            _ => return Err(Error::syntax("Too many Content-Length headers")),
        };
        *self.content_length.lock() = Some(length);
        Ok(length)
    }

    /// Request path: the URI up to the first `?`
    pub fn path(&self) -> &str {
        let uri = self.uri();
        match uri.find('?') {
            Some(i) => &uri[..i],
            None => uri,
        }
    }

    /// Form-decoded query arguments, in order of appearance
    pub fn args(&self) -> Vec<(String, String)> {
        let uri = self.uri();
        let query = match uri.find('?') {
            Some(i) => &uri[i + 1..],
            None => return Vec::new(),
        };
        url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// First value of a query argument
    pub fn arg(&self, name: &str) -> Option<String> {
        self.args()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// All cookie values with this name, across every Cookie header
    pub fn get_cookie(&self, name: &str) -> Vec<String> {
        let mut values = Vec::new();
        for field in &self.fields {
            if field.lower != "cookie" {
                continue;
            }
            for entry in field.value.split(';') {
                if let Some((entry_name, entry_value)) = entry.split_once('=') {
                    if entry_name.trim().eq_ignore_ascii_case(name) {
                        values.push(entry_value.trim().to_string());
                    }
                }
            }
        }
        values
    }

    /// Drop this cookie from every Cookie header (requests) or every
    /// matching Set-Cookie header (responses); emptied Cookie headers are
    /// removed entirely.
    pub fn delete_cookie(&mut self, name: &str) {
        match self.kind() {
            Kind::Request => {
                for field in &mut self.fields {
                    if field.lower != "cookie" {
                        continue;
                    }
                    let kept: Vec<String> = field
                        .value
                        .split(';')
                        .filter(|entry| match entry.split_once('=') {
                            Some((entry_name, _)) => {
                                !entry_name.trim().eq_ignore_ascii_case(name)
                            }
                            None => true,
                        })
                        .map(str::to_string)
                        .collect();
                    field.value = kept.join(";");
                }
                self.fields
                    .retain(|f| !(f.lower == "cookie" && f.value.is_empty()));
            }
            Kind::Response => {
                self.fields.retain(|f| {
                    !(f.lower == "set-cookie"
                        && f.value
                            .split('=')
                            .next()
                            .map(|n| n.trim().eq_ignore_ascii_case(name))
                            .unwrap_or(false))
                });
            }
        }
        self.invalidate();
    }

    /// Set a response cookie, replacing any earlier Set-Cookie for the
    /// same name
    pub fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        expires: Expiry,
        secure: bool,
        httponly: bool,
        path: Option<&str>,
    ) {
        let expires = match expires {
            Expiry::Never => Utc
                .timestamp_opt(i64::from(i32::MAX), 0)
                .single()
                .expect("32-bit epoch limit is a valid timestamp"),
            Expiry::At(when) => when,
        };
        let mut cookie = format!(
            "{}={}; Expires={}",
            name,
            value,
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        );
        if let Some(path) = path {
            cookie.push_str("; Path=");
            cookie.push_str(path);
        }
        if secure {
            cookie.push_str("; Secure");
        }
        if httponly {
            cookie.push_str("; HttpOnly");
        }
        self.delete_cookie(name);
        self.add("Set-Cookie", &cookie);
    }
}

/// Decode an `application/x-www-form-urlencoded` body into name → values
pub fn parse_form(body: &[u8]) -> HashMap<String, Vec<String>> {
    let mut form: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in url::form_urlencoded::parse(body) {
        form.entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    form
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_request() {
        let headers = Headers::parse(
            Kind::Request,
            &lines(&["GET /foo?a=1 HTTP/1.1", "Host: app.example", "Accept: */*"]),
        )
        .unwrap();
        assert_eq!(headers.method(), "GET");
        assert_eq!(headers.uri(), "/foo?a=1");
        assert_eq!(headers.path(), "/foo");
        assert_eq!(headers.arg("a").as_deref(), Some("1"));
        assert_eq!(headers.get_single("Host").unwrap().as_deref(), Some("app.example"));
    }

    #[test]
    fn test_parse_response() {
        let headers =
            Headers::parse(Kind::Response, &lines(&["HTTP/1.1 404 Not Found"])).unwrap();
        assert_eq!(headers.code(), 404);
        assert!(Headers::parse(Kind::Response, &lines(&["HTTP/1.1 abc Not Found"])).is_err());
    }

    #[test]
    fn test_invalid_first_line() {
        assert!(Headers::parse(Kind::Request, &lines(&["GET /foo"])).is_err());
        assert!(Headers::parse(Kind::Request, &lines(&["GET /foo HTTP/1.0"])).is_err());
    }

    #[test]
    fn test_continuation_lines() {
        let headers = Headers::parse(
            Kind::Request,
            &lines(&["GET / HTTP/1.1", "X-Long: first", "\tsecond"]),
        )
        .unwrap();
        assert_eq!(headers.get("X-Long"), vec!["first\r\n\tsecond"]);

        assert!(Headers::parse(Kind::Request, &lines(&["GET / HTTP/1.1", " leading"])).is_err());
    }

    #[test]
    fn test_missing_colon_rejected() {
        assert!(Headers::parse(Kind::Request, &lines(&["GET / HTTP/1.1", "NoColon"])).is_err());
    }

    #[test]
    fn test_roundtrip_preserves_structure() {
        let input = &lines(&[
            "GET /x HTTP/1.1",
            "Host: app.example",
            "X-Dup: one",
            "X-Dup: two",
        ]);
        let parsed = Headers::parse(Kind::Request, input).unwrap();
        let wire = parsed.to_bytes();
        let text = String::from_utf8(wire).unwrap();
        let reparsed_lines: Vec<String> = text
            .trim_end_matches("\r\n\r\n")
            .split("\r\n")
            .map(|s| s.to_string())
            .collect();
        let reparsed = Headers::parse(Kind::Request, &reparsed_lines).unwrap();
        assert_eq!(reparsed.to_bytes(), parsed.to_bytes());
        assert_eq!(reparsed.get("X-Dup"), vec!["one", "two"]);
    }

    #[test]
    fn test_chunked_last_token_only() {
        let headers = Headers::parse(
            Kind::Request,
            &lines(&["POST / HTTP/1.1", "Transfer-Encoding: gzip; Chunked"]),
        )
        .unwrap();
        assert!(headers.chunked().unwrap());

        assert!(Headers::parse(
            Kind::Request,
            &lines(&["POST / HTTP/1.1", "Transfer-Encoding: chunked; gzip"]),
        )
        .is_err());
    }

    #[test]
    fn test_content_length_ignored_with_transfer_encoding() {
        let headers = Headers::parse(
            Kind::Request,
            &lines(&[
                "POST / HTTP/1.1",
                "Transfer-Encoding: chunked",
                "Content-Length: 10",
            ]),
        )
        .unwrap();
        assert_eq!(headers.content_length().unwrap(), None);
        assert!(headers.chunked().unwrap());
    }

    #[test]
    fn test_content_length_errors() {
        assert!(Headers::parse(
            Kind::Request,
            &lines(&["POST / HTTP/1.1", "Content-Length: abc"]),
        )
        .is_err());
        assert!(Headers::parse(
            Kind::Request,
            &lines(&["POST / HTTP/1.1", "Content-Length: 1", "Content-Length: 2"]),
        )
        .is_err());
    }

    #[test]
    fn test_mutation_invalidates_framing_cache() {
        let mut headers = Headers::request("POST", "/");
        assert!(!headers.chunked().unwrap());
        headers.add("Transfer-Encoding", "chunked");
        assert!(headers.chunked().unwrap());
        headers.remove("Transfer-Encoding");
        assert!(!headers.chunked().unwrap());

        headers.set("Content-Length", "42");
        assert_eq!(headers.content_length().unwrap(), Some(42));
        headers.set("Content-Length", "7");
        assert_eq!(headers.content_length().unwrap(), Some(7));
    }

    #[test]
    fn test_get_single_rejects_duplicates() {
        let mut headers = Headers::request("GET", "/");
        headers.add("Host", "a");
        headers.add("Host", "b");
        assert!(headers.get_single("Host").is_err());
    }

    #[test]
    fn test_cookie_extraction_and_deletion() {
        let headers = Headers::parse(
            Kind::Request,
            &lines(&[
                "GET / HTTP/1.1",
                "Cookie: atom-session=1-abc; theme=dark",
                "Cookie: ATOM-SESSION=2-def",
            ]),
        )
        .unwrap();
        assert_eq!(headers.get_cookie("atom-session"), vec!["1-abc", "2-def"]);

        let mut headers = headers;
        headers.delete_cookie("atom-session");
        assert!(headers.get_cookie("atom-session").is_empty());
        assert_eq!(headers.get("Cookie"), vec!["theme=dark"]);
    }

    #[test]
    fn test_set_cookie_never_expiry() {
        let mut response = Headers::response(302);
        response.set_cookie("atom-session", "1-abc", Expiry::Never, false, true, Some("/"));
        let values = response.get("Set-Cookie");
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0],
            "atom-session=1-abc; Expires=Tue, 19 Jan 2038 03:14:07 GMT; Path=/; HttpOnly"
        );

        // A second set for the same name replaces the first
        response.set_cookie("atom-session", "1-xyz", Expiry::Never, true, true, Some("/"));
        let values = response.get("Set-Cookie");
        assert_eq!(values.len(), 1);
        assert!(values[0].starts_with("atom-session=1-xyz"));
        assert!(values[0].ends_with("; Path=/; Secure; HttpOnly"));
    }

    #[test]
    fn test_parse_form() {
        let form = parse_form(b"username=shane&password=test&tag=a&tag=b");
        assert_eq!(form["username"], vec!["shane"]);
        assert_eq!(form["tag"], vec!["a", "b"]);
    }
}
