//! One accepted client socket and its request/response state.

use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use nix::errno::Errno;
use nix::poll::PollFlags;
use nix::sys::socket::{self, MsgFlags};

use crate::cgi::TimedOut;
use crate::config::ListenerConfig;
use crate::log::AccessEntry;
use crate::reactor::{Context, Disposition, Handler};
use crate::registry::{Pollable, Token};
use crate::request::{self, Request, HEADER_DELIMITER};
use crate::response::{Response, StatusCode};
use crate::router::{self, Routed};

const READ_CHUNK: usize = 1 << 15;

/// Header sections longer than this are rejected with 413.
pub const MAX_HEADER_LENGTH: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReadingRequest,
    Routing,
    /// A CGI worker is producing the response.
    AwaitingCgi,
    WritingResponse,
    Closed,
}

/// How much of the request has arrived.
#[derive(Debug, PartialEq)]
enum Progress {
    Incomplete,
    TooLarge,
    /// The request ends at this offset.
    Complete(usize),
}

#[derive(Debug)]
pub struct Connection {
    socket: TcpStream,
    peer: SocketAddr,
    config: Rc<ListenerConfig>,
    state: ConnectionState,
    last_active: Instant,
    request: Vec<u8>,
    header_end: Option<usize>,
    method: Option<String>,
    url: Option<String>,
    referer: Option<String>,
    user_agent: Option<String>,
    response: Vec<u8>,
    status: u16,
    sent: usize,
    /// The rest of the request is still unread, so the socket can't carry another one.
    close_after_flush: bool,
}

impl Connection {
    pub fn new(socket: TcpStream, peer: SocketAddr, config: Rc<ListenerConfig>, now: Instant) -> Self {
        Self {
            socket,
            peer,
            config,
            state: ConnectionState::ReadingRequest,
            last_active: now,
            request: Vec::new(),
            header_end: None,
            method: None,
            url: None,
            referer: None,
            user_agent: None,
            response: Vec::new(),
            status: 0,
            sent: 0,
            close_after_flush: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Whether the connection has waited on its peer for longer than `timeout`. Connections
    /// waiting on a CGI script are governed by the script deadline instead.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        matches!(
            self.state,
            ConnectionState::ReadingRequest | ConnectionState::WritingResponse
        ) && now.saturating_duration_since(self.last_active) >= timeout
    }

    /// Hand over the outcome of this connection's CGI run.
    pub fn finish_cgi(&mut self, result: Result<Vec<u8>>, ctx: &mut Context) -> Disposition {
        if self.state != ConnectionState::AwaitingCgi {
            return Disposition::Keep;
        }
        let response = match result {
            Ok(output) => Response::passthrough(output),
            Err(e) => {
                eprintln!("warning: CGI request from {} failed: {:#}", self.peer, e);
                let status = if e.is::<TimedOut>() {
                    StatusCode::GatewayTimeout
                } else {
                    StatusCode::InternalServerError
                };
                Response::error(&self.config, status)
            }
        };
        self.respond(response, ctx)
    }

    fn close(&mut self) -> Disposition {
        self.state = ConnectionState::Closed;
        Disposition::Close
    }

    /// Read what the peer sent and route the request once it is complete.
    fn receive(&mut self, token: Token, ctx: &mut Context) -> Disposition {
        let mut buf = [0; READ_CHUNK];
        let received = match socket::recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(0) => return self.close(), // peer closed
            Ok(received) => received,
            Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EINTR)) => {
                return Disposition::Keep;
            }
            Err(_) => return self.close(),
        };
        self.last_active = ctx.now;
        ctx.stats.received(received);
        self.request.extend_from_slice(&buf[..received]);

        match self.progress() {
            Progress::Incomplete => Disposition::Keep,
            Progress::TooLarge => {
                self.close_after_flush = true;
                let response = Response::error(&self.config, StatusCode::PayloadTooLarge);
                self.respond(response, ctx)
            }
            Progress::Complete(end) => {
                // One request per read; anything after it is dropped.
                self.request.truncate(end);
                self.dispatch(token, ctx)
            }
        }
    }

    fn progress(&mut self) -> Progress {
        if self.header_end.is_none() {
            self.header_end = request::header_end(&self.request);
        }
        let header_end = match self.header_end {
            Some(header_end) => header_end,
            None if self.request.len() > MAX_HEADER_LENGTH => return Progress::TooLarge,
            None => return Progress::Incomplete,
        };
        if header_end > MAX_HEADER_LENGTH {
            return Progress::TooLarge;
        }

        let body_start = header_end + HEADER_DELIMITER.len();
        let received = self.request.len() - body_start;
        let max_body_size = self.config.max_body_size();
        let content_length =
            Request::parse(&self.request, header_end).and_then(|request| request.content_length());
        match content_length {
            Some(length) if length > max_body_size => Progress::TooLarge,
            Some(length) if received < length => Progress::Incomplete,
            Some(length) => Progress::Complete(body_start + length),
            None if received > max_body_size => Progress::TooLarge,
            None => Progress::Complete(self.request.len()),
        }
    }

    fn dispatch(&mut self, token: Token, ctx: &mut Context) -> Disposition {
        self.state = ConnectionState::Routing;
        ctx.stats.num_requests += 1;

        let header_end = self.header_end.unwrap_or_else(|| self.request.len());
        let routed = match Request::parse(&self.request, header_end) {
            Some(request) => {
                self.method = Some(request.method().to_string());
                self.url = request.uri().map(str::to_string);
                self.referer = request.header("Referer").map(str::to_string);
                self.user_agent = request.header("User-Agent").map(str::to_string);
                router::route(&self.config, &request)
            }
            None => Routed::Response(Response::error(&self.config, StatusCode::BadRequest)),
        };

        match routed {
            Routed::Response(response) => self.respond(response, ctx),
            Routed::Cgi(cgi) => {
                ctx.stats.cgi_runs += 1;
                match ctx.cgi.submit(token, cgi) {
                    Ok(()) => {
                        self.state = ConnectionState::AwaitingCgi;
                        Disposition::Keep
                    }
                    Err(e) => {
                        eprintln!("warning: failed to start CGI worker: {}", e);
                        let response =
                            Response::error(&self.config, StatusCode::InternalServerError);
                        self.respond(response, ctx)
                    }
                }
            }
        }
    }

    /// Queue `response` and try to send it right away.
    fn respond(&mut self, response: Response, ctx: &mut Context) -> Disposition {
        self.response = response.bytes;
        self.status = response.status;
        self.sent = 0;
        self.state = ConnectionState::WritingResponse;
        self.last_active = ctx.now;
        self.flush(ctx)
    }

    /// Write as much of the response as the socket takes. Writable interest stays armed until
    /// the whole response is out.
    fn flush(&mut self, ctx: &mut Context) -> Disposition {
        while self.sent < self.response.len() {
            match socket::send(
                self.socket.as_raw_fd(),
                &self.response[self.sent..],
                // nix 0.21 has no MSG_NOSIGNAL constant; pass the identical libc bit.
                unsafe { MsgFlags::from_bits_unchecked(libc::MSG_NOSIGNAL) },
            ) {
                Ok(0) => return self.close(),
                Ok(sent) => {
                    self.sent += sent;
                    self.last_active = ctx.now;
                    ctx.stats.sent(sent);
                }
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Disposition::Keep,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(_) => return self.close(),
            }
        }
        self.log(ctx);
        if self.close_after_flush {
            return self.close();
        }
        self.recycle();
        Disposition::Keep
    }

    fn log(&self, ctx: &mut Context) {
        let entry = AccessEntry {
            client: self.peer.ip(),
            method: self.method.as_deref().unwrap_or("-"),
            url: self.url.as_deref().unwrap_or("-"),
            status: self.status,
            bytes_sent: self.sent,
            referer: self.referer.as_deref(),
            user_agent: self.user_agent.as_deref(),
        };
        if let Err(e) = ctx.log.log(&entry.format(SystemTime::now())) {
            eprintln!("warning: failed to write access log: {}", e);
        }
    }

    /// Reset per-request state so the next request starts clean.
    fn recycle(&mut self) {
        self.request = Vec::new();
        self.header_end = None;
        self.method = None;
        self.url = None;
        self.referer = None;
        self.user_agent = None;
        self.response = Vec::new();
        self.status = 0;
        self.sent = 0;
        self.state = ConnectionState::ReadingRequest;
    }
}

impl Pollable for Connection {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn interest(&self) -> PollFlags {
        match self.state {
            ConnectionState::ReadingRequest => PollFlags::POLLIN,
            ConnectionState::WritingResponse => PollFlags::POLLOUT,
            ConnectionState::Routing | ConnectionState::AwaitingCgi | ConnectionState::Closed => {
                PollFlags::empty()
            }
        }
    }
}

impl Handler for Connection {
    fn on_readable(&mut self, token: Token, ctx: &mut Context) -> Disposition {
        match self.state {
            ConnectionState::ReadingRequest => self.receive(token, ctx),
            // POLLIN isn't requested in other states, so this is a hangup or an error.
            _ => self.close(),
        }
    }

    fn on_writable(&mut self, _token: Token, ctx: &mut Context) -> Disposition {
        match self.state {
            ConnectionState::WritingResponse => self.flush(ctx),
            _ => Disposition::Keep,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::{Read, Write};
    use std::net::TcpListener;

    use nix::poll::{poll, PollFd};

    use crate::log::LogSink;

    fn pair(config: ListenerConfig) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let conn = Connection::new(stream, peer, Rc::new(config), Instant::now());
        (conn, client)
    }

    fn context() -> Context {
        Context::new(LogSink::Stdout, None).unwrap().0
    }

    fn wait_readable(conn: &Connection) {
        let mut fds = [PollFd::new(conn.fd(), PollFlags::POLLIN)];
        poll(&mut fds, 1000).unwrap();
    }

    fn read_response(client: &mut TcpStream, len: usize) -> String {
        let mut buf = vec![0; len];
        client.read_exact(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn root_config() -> (tempfile::TempDir, ListenerConfig) {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hi.txt"), "hi").unwrap();
        let config = ListenerConfig::default().with_root(root.path().to_str().unwrap());
        (root, config)
    }

    #[test]
    fn round_trip_then_ready_for_next_request() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config);
        let mut ctx = context();
        let token = Token::from_raw(1);

        for _ in 0..2 {
            client.write_all(b"GET /hi.txt HTTP/1.1\r\n\r\n").unwrap();
            wait_readable(&conn);
            assert_eq!(conn.on_readable(token, &mut ctx), Disposition::Keep);
            let expected = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
            assert_eq!(read_response(&mut client, expected.len()), expected);
            assert_eq!(conn.state(), ConnectionState::ReadingRequest);
            assert_eq!(conn.interest(), PollFlags::POLLIN);
        }
        assert_eq!(ctx.stats.num_requests, 2);
    }

    #[test]
    fn request_split_across_reads() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config);
        let mut ctx = context();
        let token = Token::from_raw(1);

        client.write_all(b"GET /hi.txt HT").unwrap();
        wait_readable(&conn);
        assert_eq!(conn.on_readable(token, &mut ctx), Disposition::Keep);
        assert_eq!(conn.state(), ConnectionState::ReadingRequest);

        client.write_all(b"TP/1.1\r\n\r\n").unwrap();
        wait_readable(&conn);
        assert_eq!(conn.on_readable(token, &mut ctx), Disposition::Keep);
        let expected = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        assert_eq!(read_response(&mut client, expected.len()), expected);
    }

    #[test]
    fn missing_delimiter_does_not_route() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config);
        let mut ctx = context();

        client.write_all(b"GET /hi.txt HTTP/1.1\r\n").unwrap();
        wait_readable(&conn);
        assert_eq!(conn.on_readable(Token::from_raw(1), &mut ctx), Disposition::Keep);
        assert_eq!(conn.state(), ConnectionState::ReadingRequest);
        assert_eq!(ctx.stats.num_requests, 0);
    }

    #[test]
    fn peer_close_closes() {
        let (_root, config) = root_config();
        let (mut conn, client) = pair(config);
        let mut ctx = context();
        drop(client);
        wait_readable(&conn);
        assert_eq!(conn.on_readable(Token::from_raw(1), &mut ctx), Disposition::Close);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config.with_max_body_size(4));
        let mut ctx = context();

        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789")
            .unwrap();
        wait_readable(&conn);
        assert_eq!(conn.on_readable(Token::from_raw(1), &mut ctx), Disposition::Close);
        assert_eq!(conn.state(), ConnectionState::Closed);
        let mut head = [0; 32];
        client.read_exact(&mut head).unwrap();
        assert!(head.starts_with(b"HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[test]
    fn rejected_body_is_not_parsed_as_a_request() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config.with_max_body_size(4));
        let mut ctx = context();

        let smuggled = b"GET /hi.txt HTTP/1.1\r\n\r\n";
        let mut request =
            format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", smuggled.len()).into_bytes();
        request.extend_from_slice(smuggled);
        client.write_all(&request).unwrap();
        wait_readable(&conn);
        assert_eq!(conn.on_readable(Token::from_raw(1), &mut ctx), Disposition::Close);
        assert_eq!(ctx.stats.num_requests, 0);
        drop(conn);

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert_eq!(reply.matches("HTTP/1.1").count(), 1);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config);
        let mut ctx = context();

        let mut request = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        request.resize(MAX_HEADER_LENGTH + 100, b'a');
        client.write_all(&request).unwrap();
        // The header may take more than one read to cross the limit.
        let mut disposition = Disposition::Keep;
        while ctx.stats.total_out == 0 {
            assert_eq!(disposition, Disposition::Keep);
            wait_readable(&conn);
            disposition = conn.on_readable(Token::from_raw(1), &mut ctx);
        }
        assert_eq!(disposition, Disposition::Close);
        let mut head = [0; 32];
        client.read_exact(&mut head).unwrap();
        assert!(head.starts_with(b"HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[test]
    fn idle_only_while_waiting_on_peer() {
        let (_root, config) = root_config();
        let (mut conn, _client) = pair(config);
        let later = Instant::now() + Duration::from_secs(60);
        assert!(conn.is_idle(later, Duration::from_secs(30)));
        assert!(!conn.is_idle(Instant::now(), Duration::from_secs(30)));
        conn.state = ConnectionState::AwaitingCgi;
        assert!(!conn.is_idle(later, Duration::from_secs(30)));
        assert_eq!(conn.interest(), PollFlags::empty());
    }

    #[test]
    fn failed_cgi_becomes_500() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config);
        let mut ctx = context();
        conn.state = ConnectionState::AwaitingCgi;

        let disposition = conn.finish_cgi(Err(anyhow::anyhow!("boom")), &mut ctx);
        assert_eq!(disposition, Disposition::Keep);
        let mut head = [0; 36];
        client.read_exact(&mut head).unwrap();
        assert!(head.starts_with(b"HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn timed_out_cgi_becomes_504() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config);
        let mut ctx = context();
        conn.state = ConnectionState::AwaitingCgi;

        let error = anyhow::Error::new(TimedOut(Duration::from_secs(1)));
        conn.finish_cgi(Err(error), &mut ctx);
        let mut head = [0; 30];
        client.read_exact(&mut head).unwrap();
        assert!(head.starts_with(b"HTTP/1.1 504 Gateway Timeout\r\n"));
    }

    #[test]
    fn cgi_output_passes_through() {
        let (_root, config) = root_config();
        let (mut conn, mut client) = pair(config);
        let mut ctx = context();
        conn.state = ConnectionState::AwaitingCgi;

        let output = b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n".to_vec();
        conn.finish_cgi(Ok(output.clone()), &mut ctx);
        let mut buf = vec![0; output.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, output);
    }
}
