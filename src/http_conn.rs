// src/http_conn.rs
//
// Per-connection state: fixed read/write buffers, the incremental request
// parser, dispatch, and the scatter/gather response writer. One instance per
// table slot, reinitialized across keep-alive cycles, never freed.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::net::SocketAddrV4;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;

use libc::c_int;
use memmap2::Mmap;

use crate::db::CredentialBackend;
use crate::syscalls;

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

const OK_200_TITLE: &str = "OK";
const ERROR_403_TITLE: &str = "Forbidden";
const ERROR_403_FORM: &str = "You do not have permission to get file form this server.\n";
const ERROR_404_TITLE: &str = "Not Found";
const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
const ERROR_500_TITLE: &str = "Internal Error";
const ERROR_500_FORM: &str = "There was an unusual problem serving the request file.\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Header,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    Bad,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    NoRequest,
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Job direction for the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read = 0,
    Write = 1,
}

/// What the reactor should do after a parse/build pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAction {
    /// Incomplete request: re-arm for reading.
    NeedMoreData,
    /// Response staged in the buffers: re-arm for writing.
    ResponseReady,
    /// Unrecoverable for this connection.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Kernel buffer full: re-arm for writing and retry.
    Again,
    /// Response fully sent.
    Complete { keep_alive: bool },
    Error,
}

/// Everything request dispatch needs from the rest of the server. Passed
/// explicitly; there are no globals.
pub struct ServeEnv<'a> {
    pub doc_root: &'a Path,
    pub users: &'a Mutex<HashMap<String, String>>,
    pub backend: &'a dyn CredentialBackend,
}

pub struct HttpConn {
    fd: c_int,
    peer: Option<SocketAddrV4>,
    conn_et: bool,

    read_buf: [u8; READ_BUFFER_SIZE],
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,

    write_buf: [u8; WRITE_BUFFER_SIZE],
    write_idx: usize,

    check_state: CheckState,
    method: Method,
    url: String,
    host: String,
    content_length: usize,
    keep_alive: bool,
    cgi: bool,
    body: String,

    file_map: Option<Mmap>,
    file_len: usize,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl HttpConn {
    pub fn new() -> Self {
        Self {
            fd: -1,
            peer: None,
            conn_et: false,
            read_buf: [0; READ_BUFFER_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            write_buf: [0; WRITE_BUFFER_SIZE],
            write_idx: 0,
            check_state: CheckState::RequestLine,
            method: Method::Get,
            url: String::new(),
            host: String::new(),
            content_length: 0,
            keep_alive: false,
            cgi: false,
            body: String::new(),
            file_map: None,
            file_len: 0,
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    /// Take over a freshly accepted socket.
    pub fn init(&mut self, fd: c_int, peer: SocketAddrV4, conn_et: bool) {
        self.fd = fd;
        self.peer = Some(peer);
        self.conn_et = conn_et;
        self.reinit();
    }

    /// Reset parse and response state for the next request on this socket.
    /// Both buffers are zeroed up to their previous high-water marks.
    pub fn reinit(&mut self) {
        self.read_buf[..self.read_idx].fill(0);
        self.write_buf[..self.write_idx].fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.write_idx = 0;
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.host.clear();
        self.content_length = 0;
        self.keep_alive = false;
        self.cgi = false;
        self.body.clear();
        self.file_map = None;
        self.file_len = 0;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }

    pub fn is_active(&self) -> bool {
        self.fd >= 0
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn check_state(&self) -> CheckState {
        self.check_state
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    pub fn response_head(&self) -> &[u8] {
        &self.write_buf[..self.write_idx]
    }

    /// Detach the socket for closing; the slot stays allocated.
    pub fn take_fd(&mut self) -> c_int {
        let fd = self.fd;
        self.fd = -1;
        self.file_map = None;
        fd
    }

    // ---- Reading ----

    /// Pull bytes from the socket into `read_buf[read_idx..]`. LT mode does a
    /// single recv per readiness notification; ET drains until EAGAIN. The
    /// buffer is never resized: filling it up is a capacity error and the
    /// connection closes.
    pub fn read_once(&mut self) -> bool {
        if self.read_idx >= READ_BUFFER_SIZE {
            return false;
        }
        if !self.conn_et {
            match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(Some(n)) if n > 0 => {
                    self.read_idx += n;
                    true
                }
                _ => false,
            }
        } else {
            loop {
                if self.read_idx >= READ_BUFFER_SIZE {
                    return false;
                }
                match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_idx..]) {
                    Ok(None) => return true,
                    Ok(Some(0)) => return false,
                    Ok(Some(n)) => self.read_idx += n,
                    Err(_) => return false,
                }
            }
        }
    }

    // ---- Parsing ----

    /// Line sub-machine: scan from `checked_idx` for a CRLF, replacing it
    /// with NULs in place. `Open` means the terminator has not arrived yet
    /// and parsing resumes after the next read.
    fn parse_line(&mut self) -> LineStatus {
        while self.checked_idx < self.read_idx {
            match self.read_buf[self.checked_idx] {
                b'\r' => {
                    if self.checked_idx + 1 == self.read_idx {
                        return LineStatus::Open;
                    }
                    if self.read_buf[self.checked_idx + 1] == b'\n' {
                        self.read_buf[self.checked_idx] = 0;
                        self.read_buf[self.checked_idx + 1] = 0;
                        self.checked_idx += 2;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.checked_idx > 1 && self.read_buf[self.checked_idx - 1] == b'\r' {
                        self.read_buf[self.checked_idx - 1] = 0;
                        self.read_buf[self.checked_idx] = 0;
                        self.checked_idx += 1;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked_idx += 1,
            }
        }
        LineStatus::Open
    }

    /// The line just completed by `parse_line`, without its terminator.
    fn take_line(&mut self) -> Vec<u8> {
        let end = self.checked_idx.saturating_sub(2);
        let line = self.read_buf[self.start_line..end].to_vec();
        self.start_line = self.checked_idx;
        line
    }

    /// `METHOD SP URL SP HTTP/1.1`. Only GET and POST pass; POST raises the
    /// CGI flag. Absolute URLs are stripped to their path, and `/` is
    /// rewritten to `/judge.html`.
    fn parse_request_line(&mut self, line: &[u8]) -> HttpCode {
        let text = match std::str::from_utf8(line) {
            Ok(t) => t,
            Err(_) => return HttpCode::BadRequest,
        };

        let sep = match text.find([' ', '\t']) {
            Some(i) => i,
            None => return HttpCode::BadRequest,
        };
        let method = &text[..sep];
        let rest = text[sep + 1..].trim_start_matches([' ', '\t']);

        if method.eq_ignore_ascii_case("GET") {
            self.method = Method::Get;
        } else if method.eq_ignore_ascii_case("POST") {
            self.method = Method::Post;
            self.cgi = true;
        } else {
            return HttpCode::BadRequest;
        }

        let sep = match rest.find([' ', '\t']) {
            Some(i) => i,
            None => return HttpCode::BadRequest,
        };
        let mut url = &rest[..sep];
        let version = rest[sep + 1..].trim_start_matches([' ', '\t']);
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return HttpCode::BadRequest;
        }

        if url.get(..7).map_or(false, |p| p.eq_ignore_ascii_case("http://")) {
            url = match url[7..].find('/') {
                Some(i) => &url[7 + i..],
                None => return HttpCode::BadRequest,
            };
        }
        if url.get(..8).map_or(false, |p| p.eq_ignore_ascii_case("https://")) {
            url = match url[8..].find('/') {
                Some(i) => &url[8 + i..],
                None => return HttpCode::BadRequest,
            };
        }
        if !url.starts_with('/') {
            return HttpCode::BadRequest;
        }

        self.url = if url == "/" {
            "/judge.html".to_string()
        } else {
            url.to_string()
        };
        self.check_state = CheckState::Header;
        HttpCode::NoRequest
    }

    /// One header line. Recognizes `Connection`, `Content-Length` and `Host`
    /// by case-insensitive prefix; anything else is logged and ignored. The
    /// blank line ends the header section.
    fn parse_headers(&mut self, line: &[u8]) -> HttpCode {
        if line.is_empty() {
            if self.content_length != 0 {
                self.check_state = CheckState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        if line.len() >= 11 && line[..11].eq_ignore_ascii_case(b"connection:") {
            let value = trim_value(&line[11..]);
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if line.len() >= 15 && line[..15].eq_ignore_ascii_case(b"content-length:") {
            let value = trim_value(&line[15..]);
            self.content_length = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
        } else if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"host:") {
            let value = trim_value(&line[5..]);
            self.host = String::from_utf8_lossy(value).into_owned();
        } else {
            tracing::info!(header = %String::from_utf8_lossy(line), "unknown header");
        }
        HttpCode::NoRequest
    }

    /// The body is complete once `content_length` bytes sit past the header
    /// section; extra bytes are ignored.
    fn parse_content(&mut self) -> HttpCode {
        if self.read_idx >= self.checked_idx + self.content_length {
            let body = &self.read_buf[self.checked_idx..self.checked_idx + self.content_length];
            self.body = String::from_utf8_lossy(body).into_owned();
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }

    /// Drive the three-state parser over whatever is buffered. Terminal
    /// results: `GetRequest` has been dispatched through [`Self::do_request`];
    /// `NoRequest` means wait for more bytes.
    pub fn process_read(&mut self, env: &ServeEnv) -> HttpCode {
        let mut line_status = LineStatus::Ok;
        loop {
            if self.check_state == CheckState::Content && line_status == LineStatus::Ok {
                // body bytes are consumed without line framing
            } else {
                line_status = self.parse_line();
                match line_status {
                    LineStatus::Ok => {}
                    LineStatus::Open => return HttpCode::NoRequest,
                    LineStatus::Bad => return HttpCode::BadRequest,
                }
            }

            match self.check_state {
                CheckState::RequestLine => {
                    let line = self.take_line();
                    if self.parse_request_line(&line) == HttpCode::BadRequest {
                        return HttpCode::BadRequest;
                    }
                }
                CheckState::Header => {
                    let line = self.take_line();
                    match self.parse_headers(&line) {
                        HttpCode::GetRequest => return self.do_request(env),
                        HttpCode::BadRequest => return HttpCode::BadRequest,
                        _ => {}
                    }
                }
                CheckState::Content => {
                    if self.parse_content() == HttpCode::GetRequest {
                        return self.do_request(env);
                    }
                    return HttpCode::NoRequest;
                }
            }
        }
    }

    // ---- Dispatch ----

    /// Map the parsed URL onto an action, resolve the target file and map it
    /// into memory. The first character of the last path segment selects the
    /// CGI actions and the canned pages.
    fn do_request(&mut self, env: &ServeEnv) -> HttpCode {
        let flag = last_segment_flag(&self.url);

        if self.cgi && (flag == Some(b'2') || flag == Some(b'3')) {
            self.url = match parse_credentials(&self.body) {
                Some((name, password)) => {
                    if flag == Some(b'3') {
                        register(env, &name, &password)
                    } else {
                        login(env, &name, &password)
                    }
                }
                // malformed body counts as a failed credential check
                None if flag == Some(b'3') => "/registerError.html".to_string(),
                None => "/logError.html".to_string(),
            };
        }

        let path = match last_segment_flag(&self.url) {
            Some(b'0') => env.doc_root.join("register.html"),
            Some(b'1') => env.doc_root.join("log.html"),
            Some(b'5') => env.doc_root.join("picture.html"),
            Some(b'6') => env.doc_root.join("video.html"),
            Some(b'7') => env.doc_root.join("fans.html"),
            _ => env.doc_root.join(self.url.trim_start_matches('/')),
        };

        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => return HttpCode::NoResource,
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }

        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return HttpCode::NoResource,
        };
        self.file_len = meta.len() as usize;
        if self.file_len > 0 {
            self.file_map = match unsafe { Mmap::map(&file) } {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "mmap failed");
                    return HttpCode::InternalError;
                }
            };
        }
        // the fd closes with `file`; the mapping stays valid
        HttpCode::FileRequest
    }

    // ---- Response building ----

    /// Bounded formatted append into the write buffer. Overflow fails the
    /// whole response and the connection closes.
    fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        if self.write_idx >= WRITE_BUFFER_SIZE {
            return false;
        }
        struct Cursor<'b> {
            buf: &'b mut [u8],
            written: usize,
        }
        impl fmt::Write for Cursor<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                let bytes = s.as_bytes();
                if self.written + bytes.len() > self.buf.len() {
                    return Err(fmt::Error);
                }
                self.buf[self.written..self.written + bytes.len()].copy_from_slice(bytes);
                self.written += bytes.len();
                Ok(())
            }
        }

        let limit = WRITE_BUFFER_SIZE - 1;
        let mut cursor = Cursor {
            buf: &mut self.write_buf[self.write_idx..limit],
            written: 0,
        };
        if fmt::write(&mut cursor, args).is_err() {
            return false;
        }
        self.write_idx += cursor.written;
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        self.add_content_length(content_len)
            && self.add_content_type()
            && self.add_linger()
            && self.add_blank_line()
    }

    fn add_content_length(&mut self, content_len: usize) -> bool {
        self.add_response(format_args!("Content-Length:{}\r\n", content_len))
    }

    fn add_content_type(&mut self) -> bool {
        self.add_response(format_args!("Content-Type:{}\r\n", "text/html"))
    }

    fn add_linger(&mut self) -> bool {
        let value = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!("Connection:{}\r\n", value))
    }

    fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    /// Stage the response for the parse result. Returns false when the
    /// connection must close instead (builder overflow, or a zero-length
    /// file, which historically drops the connection without a reply).
    pub fn process_write(&mut self, code: HttpCode) -> bool {
        match code {
            HttpCode::InternalError => {
                // a 500 always closes, whatever the client asked for
                self.keep_alive = false;
                let ok = self.add_status_line(500, ERROR_500_TITLE)
                    && self.add_headers(ERROR_500_FORM.len())
                    && self.add_content(ERROR_500_FORM);
                if !ok {
                    return false;
                }
            }
            // bad requests are reported as 404, as they always have been
            HttpCode::BadRequest | HttpCode::NoResource => {
                let ok = self.add_status_line(404, ERROR_404_TITLE)
                    && self.add_headers(ERROR_404_FORM.len())
                    && self.add_content(ERROR_404_FORM);
                if !ok {
                    return false;
                }
            }
            HttpCode::ForbiddenRequest => {
                let ok = self.add_status_line(403, ERROR_403_TITLE)
                    && self.add_headers(ERROR_403_FORM.len())
                    && self.add_content(ERROR_403_FORM);
                if !ok {
                    return false;
                }
            }
            HttpCode::FileRequest => {
                if !self.add_status_line(200, OK_200_TITLE) {
                    return false;
                }
                if self.file_len == 0 || self.file_map.is_none() {
                    // zero-length file: dropped without a reply
                    return false;
                }
                if !self.add_headers(self.file_len) {
                    return false;
                }
                self.bytes_to_send = self.write_idx + self.file_len;
                return true;
            }
            _ => return false,
        }
        self.bytes_to_send = self.write_idx;
        true
    }

    /// Current gather segments given how much has already been sent: the
    /// header buffer, then the mapped file once segment 0 is exhausted.
    pub fn gather_segments(&self) -> (&[u8], Option<&[u8]>) {
        let empty: &[u8] = &[];
        match &self.file_map {
            Some(map) if self.file_len > 0 => {
                if self.bytes_have_send >= self.write_idx {
                    let off = self.bytes_have_send - self.write_idx;
                    (empty, Some(&map[off..self.file_len]))
                } else {
                    (
                        &self.write_buf[self.bytes_have_send..self.write_idx],
                        Some(&map[..self.file_len]),
                    )
                }
            }
            _ => {
                if self.bytes_have_send >= self.write_idx {
                    (empty, None)
                } else {
                    (&self.write_buf[self.bytes_have_send..self.write_idx], None)
                }
            }
        }
    }

    // ---- Writing ----

    /// Push the staged response out with `writev`. On completion the mapping
    /// is dropped and, for keep-alive, the connection is reinitialized for
    /// the next request.
    pub fn write(&mut self) -> WriteOutcome {
        if self.bytes_to_send == 0 {
            self.reinit();
            return WriteOutcome::Complete { keep_alive: true };
        }
        loop {
            let result = {
                let (first, second) = self.gather_segments();
                let mut bufs: [&[u8]; 2] = [first, &[]];
                let mut count = 1;
                if let Some(body) = second {
                    bufs[1] = body;
                    count = 2;
                }
                syscalls::writev_nonblocking(self.fd, &bufs[..count])
            };
            match result {
                Ok(None) => return WriteOutcome::Again,
                Err(_) => {
                    self.unmap();
                    return WriteOutcome::Error;
                }
                Ok(Some(n)) => {
                    self.bytes_have_send += n;
                    self.bytes_to_send = self.bytes_to_send.saturating_sub(n);
                    if self.bytes_to_send == 0 {
                        self.unmap();
                        if self.keep_alive {
                            self.reinit();
                            return WriteOutcome::Complete { keep_alive: true };
                        }
                        return WriteOutcome::Complete { keep_alive: false };
                    }
                }
            }
        }
    }

    fn unmap(&mut self) {
        self.file_map = None;
    }

    /// Full parse-and-build pass, the unit of work a worker performs.
    pub fn process(&mut self, env: &ServeEnv) -> ProcessAction {
        let read_ret = self.process_read(env);
        if read_ret == HttpCode::NoRequest {
            return ProcessAction::NeedMoreData;
        }
        if !self.process_write(read_ret) {
            return ProcessAction::Close;
        }
        ProcessAction::ResponseReady
    }
}

impl Default for HttpConn {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_value(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(value.len());
    &value[start..]
}

/// First character after the last `/` of the URL.
fn last_segment_flag(url: &str) -> Option<u8> {
    let seg = url.rfind('/')?;
    url.as_bytes().get(seg + 1).copied()
}

/// Fixed-offset field extraction from the POST body. The literal layout is
/// `user=<u>&password=<p>`: value 1 starts at byte 5 and runs to the first
/// `&`, value 2 starts 10 bytes past that `&`. Reordered or URL-encoded
/// fields are silently mis-parsed.
fn parse_credentials(body: &str) -> Option<(String, String)> {
    let bytes = body.as_bytes();
    if bytes.len() <= 5 {
        return None;
    }
    let amp = bytes[5..].iter().position(|&b| b == b'&').map(|i| i + 5)?;
    let name = body.get(5..amp)?.to_string();
    let pass_start = amp + 10;
    if pass_start > bytes.len() {
        return None;
    }
    let password = body.get(pass_start..)?.to_string();
    Some((name, password))
}

fn login(env: &ServeEnv, name: &str, password: &str) -> String {
    let users = env.users.lock().unwrap();
    if users.get(name).map(|p| p == password).unwrap_or(false) {
        "/welcome.html".to_string()
    } else {
        "/logError.html".to_string()
    }
}

fn register(env: &ServeEnv, name: &str, password: &str) -> String {
    // The duplicate check, the INSERT and the map update form one atomic
    // unit with respect to other registrations.
    let mut users = env.users.lock().unwrap();
    if users.contains_key(name) {
        return "/registerError.html".to_string();
    }
    let res = env.backend.insert_user(name, password);
    users.insert(name.to_string(), password.to_string());
    match res {
        Ok(()) => "/log.html".to_string(),
        Err(e) => {
            tracing::error!(error = %e, username = name, "registration insert failed");
            "/registerError.html".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ServerError, ServerResult};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubBackend {
        fail: bool,
        called: AtomicBool,
    }

    impl StubBackend {
        fn ok() -> Self {
            Self {
                fail: false,
                called: AtomicBool::new(false),
            }
        }
        fn failing() -> Self {
            Self {
                fail: true,
                called: AtomicBool::new(false),
            }
        }
    }

    impl CredentialBackend for StubBackend {
        fn insert_user(&self, _username: &str, _password: &str) -> ServerResult<()> {
            self.called.store(true, Ordering::SeqCst);
            if self.fail {
                Err(ServerError::Db("insert failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct TestRoot {
        dir: PathBuf,
    }

    impl TestRoot {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "nocturne-root-{}-{}",
                tag,
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            Self { dir }
        }

        fn put(&self, name: &str, content: &[u8]) {
            let path = self.dir.join(name);
            fs::write(&path, content).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
    }

    impl Drop for TestRoot {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn feed(conn: &mut HttpConn, bytes: &[u8]) {
        conn.read_buf[conn.read_idx..conn.read_idx + bytes.len()].copy_from_slice(bytes);
        conn.read_idx += bytes.len();
    }

    fn env<'a>(
        root: &'a TestRoot,
        users: &'a Mutex<HashMap<String, String>>,
        backend: &'a dyn CredentialBackend,
    ) -> ServeEnv<'a> {
        ServeEnv {
            doc_root: &root.dir,
            users,
            backend,
        }
    }

    #[test]
    fn parse_line_detects_complete_and_partial() {
        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET / HTTP/1.1\r");
        assert_eq!(conn.parse_line(), LineStatus::Open);
        feed(&mut conn, b"\n");
        assert_eq!(conn.parse_line(), LineStatus::Ok);
        assert_eq!(conn.take_line(), b"GET / HTTP/1.1".to_vec());
    }

    #[test]
    fn parse_line_rejects_bare_newline() {
        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET\n");
        assert_eq!(conn.parse_line(), LineStatus::Bad);

        let mut conn = HttpConn::new();
        feed(&mut conn, b"GE\rT");
        assert_eq!(conn.parse_line(), LineStatus::Bad);
    }

    #[test]
    fn request_line_grammar() {
        let mut conn = HttpConn::new();
        assert_eq!(
            conn.parse_request_line(b"GET /index.html HTTP/1.1"),
            HttpCode::NoRequest
        );
        assert_eq!(conn.method(), Method::Get);
        assert_eq!(conn.url(), "/index.html");
        assert_eq!(conn.check_state(), CheckState::Header);
        assert!(!conn.cgi);

        let mut conn = HttpConn::new();
        assert_eq!(
            conn.parse_request_line(b"POST /3CGISQL.cgi HTTP/1.1"),
            HttpCode::NoRequest
        );
        assert_eq!(conn.method(), Method::Post);
        assert!(conn.cgi);

        let mut conn = HttpConn::new();
        assert_eq!(
            conn.parse_request_line(b"DELETE /x HTTP/1.1"),
            HttpCode::BadRequest
        );

        let mut conn = HttpConn::new();
        assert_eq!(
            conn.parse_request_line(b"GET /x HTTP/1.0"),
            HttpCode::BadRequest
        );
    }

    #[test]
    fn request_line_strips_absolute_urls() {
        let mut conn = HttpConn::new();
        assert_eq!(
            conn.parse_request_line(b"GET http://example.com/a/b.html HTTP/1.1"),
            HttpCode::NoRequest
        );
        assert_eq!(conn.url(), "/a/b.html");

        let mut conn = HttpConn::new();
        assert_eq!(
            conn.parse_request_line(b"GET https://example.com/c.html HTTP/1.1"),
            HttpCode::NoRequest
        );
        assert_eq!(conn.url(), "/c.html");
    }

    #[test]
    fn root_url_rewrites_to_judge() {
        let mut conn = HttpConn::new();
        assert_eq!(conn.parse_request_line(b"GET / HTTP/1.1"), HttpCode::NoRequest);
        assert_eq!(conn.url(), "/judge.html");
    }

    #[test]
    fn header_recognition() {
        let mut conn = HttpConn::new();
        assert_eq!(
            conn.parse_headers(b"Connection: keep-alive"),
            HttpCode::NoRequest
        );
        assert!(conn.keep_alive());
        assert_eq!(conn.parse_headers(b"content-length: 24"), HttpCode::NoRequest);
        assert_eq!(conn.content_length, 24);
        assert_eq!(conn.parse_headers(b"Host:\t example.com"), HttpCode::NoRequest);
        assert_eq!(conn.host(), "example.com");
        // unknown headers are ignored
        assert_eq!(conn.parse_headers(b"X-Custom: zzz"), HttpCode::NoRequest);
    }

    #[test]
    fn blank_line_ends_headers() {
        let mut conn = HttpConn::new();
        assert_eq!(conn.parse_headers(b""), HttpCode::GetRequest);

        let mut conn = HttpConn::new();
        conn.content_length = 10;
        assert_eq!(conn.parse_headers(b""), HttpCode::NoRequest);
        assert_eq!(conn.check_state(), CheckState::Content);
    }

    #[test]
    fn credential_offsets() {
        assert_eq!(
            parse_credentials("user=alice&password=s3cret"),
            Some(("alice".to_string(), "s3cret".to_string()))
        );
        // a `passwd=` field name lands two bytes short of the value; the
        // offsets are fixed, not parsed
        assert_eq!(
            parse_credentials("user=123&passwd=123"),
            Some(("123".to_string(), "3".to_string()))
        );
        assert_eq!(parse_credentials("user=abc"), None);
        assert_eq!(parse_credentials("u"), None);
        assert_eq!(parse_credentials("user=a&p="), None);
    }

    #[test]
    fn static_get_resolves_and_maps_file() {
        let root = TestRoot::new("static");
        root.put("judge.html", b"<html>judge</html>");
        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::ok();
        let env = env(&root, &users, &backend);

        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(conn.process_read(&env), HttpCode::FileRequest);
        assert_eq!(conn.url(), "/judge.html");
        assert_eq!(conn.host(), "x");
        assert!(conn.keep_alive());
        assert_eq!(conn.file_len, 18);

        assert!(conn.process_write(HttpCode::FileRequest));
        let head = String::from_utf8_lossy(conn.response_head()).into_owned();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length:18\r\n"));
        assert!(head.contains("Content-Type:text/html\r\n"));
        assert!(head.contains("Connection:keep-alive\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(conn.bytes_to_send(), head.len() + 18);

        let (first, second) = conn.gather_segments();
        assert_eq!(first, conn.response_head());
        assert_eq!(second.unwrap(), b"<html>judge</html>");
    }

    #[test]
    fn partial_line_across_reads_resumes() {
        let root = TestRoot::new("partial");
        root.put("judge.html", b"<html>judge</html>");
        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::ok();
        let env = env(&root, &users, &backend);

        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET / HTTP/1.1\r");
        assert_eq!(conn.process_read(&env), HttpCode::NoRequest);
        feed(&mut conn, b"\nHost: x\r\n\r\n");
        assert_eq!(conn.process_read(&env), HttpCode::FileRequest);
        assert_eq!(conn.url(), "/judge.html");
    }

    #[test]
    fn missing_file_is_404_with_canned_body() {
        let root = TestRoot::new("missing");
        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::ok();
        let env = env(&root, &users, &backend);

        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET /nope.html HTTP/1.1\r\nHost: x\r\n\r\n");
        let code = conn.process_read(&env);
        assert_eq!(code, HttpCode::NoResource);
        assert!(conn.process_write(code));
        let body = String::from_utf8_lossy(conn.response_head()).into_owned();
        assert!(body.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(body.contains("Connection:close\r\n"));
        assert!(body.ends_with(ERROR_404_FORM));
        assert_eq!(conn.bytes_to_send(), conn.response_head().len());
        let (_, second) = conn.gather_segments();
        assert!(second.is_none());
    }

    #[test]
    fn directory_and_unreadable_paths() {
        let root = TestRoot::new("perm");
        fs::create_dir_all(root.dir.join("sub")).unwrap();
        let mut dir_perms = fs::metadata(root.dir.join("sub")).unwrap().permissions();
        dir_perms.set_mode(0o755);
        fs::set_permissions(root.dir.join("sub"), dir_perms).unwrap();
        root.put("secret.html", b"s");
        let mut perms = fs::metadata(root.dir.join("secret.html"))
            .unwrap()
            .permissions();
        perms.set_mode(0o640);
        fs::set_permissions(root.dir.join("secret.html"), perms).unwrap();

        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::ok();
        let env = env(&root, &users, &backend);

        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET /sub HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.process_read(&env), HttpCode::BadRequest);

        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET /secret.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.process_read(&env), HttpCode::ForbiddenRequest);
    }

    #[test]
    fn zero_length_file_drops_connection() {
        let root = TestRoot::new("empty");
        root.put("empty.html", b"");
        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::ok();
        let env = env(&root, &users, &backend);

        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET /empty.html HTTP/1.1\r\nHost: x\r\n\r\n");
        let code = conn.process_read(&env);
        assert_eq!(code, HttpCode::FileRequest);
        assert!(!conn.process_write(code));
    }

    #[test]
    fn registration_and_login_flow() {
        let root = TestRoot::new("cgi");
        root.put("log.html", b"<html>log</html>");
        root.put("welcome.html", b"<html>welcome</html>");
        root.put("logError.html", b"<html>logError</html>");
        root.put("registerError.html", b"<html>registerError</html>");
        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::ok();
        let env = env(&root, &users, &backend);

        // register alice
        let body = "user=alice&password=s3cret";
        let mut conn = HttpConn::new();
        feed(
            &mut conn,
            format!(
                "POST /3CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .as_bytes(),
        );
        assert_eq!(conn.process_read(&env), HttpCode::FileRequest);
        assert_eq!(conn.url(), "/log.html");
        assert!(backend.called.load(Ordering::SeqCst));
        assert_eq!(users.lock().unwrap().get("alice").unwrap(), "s3cret");

        // duplicate registration fails without another INSERT
        backend.called.store(false, Ordering::SeqCst);
        let mut conn = HttpConn::new();
        feed(
            &mut conn,
            format!(
                "POST /3CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .as_bytes(),
        );
        assert_eq!(conn.process_read(&env), HttpCode::FileRequest);
        assert_eq!(conn.url(), "/registerError.html");
        assert!(!backend.called.load(Ordering::SeqCst));

        // login success
        let mut conn = HttpConn::new();
        feed(
            &mut conn,
            format!(
                "POST /2CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .as_bytes(),
        );
        assert_eq!(conn.process_read(&env), HttpCode::FileRequest);
        assert_eq!(conn.url(), "/welcome.html");

        // login failure
        let bad = "user=alice&password=wrong";
        let mut conn = HttpConn::new();
        feed(
            &mut conn,
            format!(
                "POST /2CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
                bad.len(),
                bad
            )
            .as_bytes(),
        );
        assert_eq!(conn.process_read(&env), HttpCode::FileRequest);
        assert_eq!(conn.url(), "/logError.html");
    }

    #[test]
    fn failed_insert_serves_register_error() {
        let root = TestRoot::new("dberr");
        root.put("registerError.html", b"<html>registerError</html>");
        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::failing();
        let env = env(&root, &users, &backend);

        let body = "user=bob&password=pw";
        let mut conn = HttpConn::new();
        feed(
            &mut conn,
            format!(
                "POST /3CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .as_bytes(),
        );
        assert_eq!(conn.process_read(&env), HttpCode::FileRequest);
        assert_eq!(conn.url(), "/registerError.html");
        // the map entry is inserted regardless, as it always has been
        assert!(users.lock().unwrap().contains_key("bob"));
    }

    #[test]
    fn canned_page_shortcuts() {
        let root = TestRoot::new("pages");
        root.put("register.html", b"r");
        root.put("log.html", b"l");
        root.put("picture.html", b"p");
        root.put("video.html", b"v");
        root.put("fans.html", b"f");
        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::ok();
        let env = env(&root, &users, &backend);

        for (url, expect_len) in [("/0", 1), ("/1", 1), ("/5", 1), ("/6", 1), ("/7", 1)] {
            let mut conn = HttpConn::new();
            feed(
                &mut conn,
                format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", url).as_bytes(),
            );
            assert_eq!(conn.process_read(&env), HttpCode::FileRequest, "url {url}");
            assert_eq!(conn.file_len, expect_len);
        }
    }

    #[test]
    fn builder_overflow_fails_cleanly() {
        let mut conn = HttpConn::new();
        conn.write_idx = WRITE_BUFFER_SIZE - 4;
        assert!(!conn.add_response(format_args!("{}", "too long for the space left")));
        // a failed append leaves the cursor untouched
        assert_eq!(conn.write_idx, WRITE_BUFFER_SIZE - 4);
    }

    #[test]
    fn reinit_zeroes_high_water_marks() {
        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.checked_idx = 5;
        conn.write_buf[..7].copy_from_slice(b"garbage");
        conn.write_idx = 7;
        conn.keep_alive = true;
        conn.reinit();
        assert_eq!(conn.check_state(), CheckState::RequestLine);
        assert_eq!(conn.read_idx, 0);
        assert_eq!(conn.checked_idx, 0);
        assert_eq!(conn.write_idx, 0);
        assert!(!conn.keep_alive());
        assert!(conn.read_buf.iter().all(|&b| b == 0));
        assert!(conn.write_buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn cursor_invariant_holds_through_parse() {
        let root = TestRoot::new("cursors");
        let users = Mutex::new(HashMap::new());
        let backend = StubBackend::ok();
        let env = env(&root, &users, &backend);

        let mut conn = HttpConn::new();
        feed(&mut conn, b"GET /nope HTTP/1.1\r\nHost: x");
        let _ = conn.process_read(&env);
        assert!(conn.checked_idx <= conn.read_idx);
        assert!(conn.read_idx <= READ_BUFFER_SIZE);
    }
}
