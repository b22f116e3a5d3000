//! Fully serialised responses.

use std::fmt;
use std::fs::DirEntry;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::ListenerConfig;
use crate::encoding::{HtmlEscaped, UrlEncoded, UrlEncodedPath};

/// Directory, relative to the document root, holding `<code>.html` error pages.
pub const DEFAULT_PAGES_DIR: &str = "default_pages";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    MovedPermanently,
    BadRequest,
    Forbidden,
    NotFound,
    PayloadTooLarge,
    InternalServerError,
    NotImplemented,
    GatewayTimeout,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::MovedPermanently => 301,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::PayloadTooLarge => 413,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::GatewayTimeout => 504,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::MovedPermanently => "Moved Permanently",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::GatewayTimeout => "Gateway Timeout",
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Self::BadRequest => "You sent a request that the server couldn't understand.",
            Self::Forbidden => "You don't have permission to access this URL.",
            Self::NotFound => "The URL you requested was not found.",
            Self::PayloadTooLarge => "Your request was dropped because it was too long.",
            Self::NotImplemented => "The method you specified is not implemented.",
            Self::GatewayTimeout => "The script handling your request took too long.",
            _ => {
                "The server encountered an unexpected condition that prevented it from \
                fulfilling the request."
            }
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// A response ready to be written to the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Status code for the access log. Zero if the CGI output had no parsable status line.
    pub status: u16,
    pub bytes: Vec<u8>,
}

impl Response {
    /// Status line, `Content-Length` and body.
    pub fn new(status: StatusCode, body: &[u8]) -> Self {
        let mut bytes = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\n\r\n",
            status,
            body.len()
        )
        .into_bytes();
        bytes.extend_from_slice(body);
        Self {
            status: status.code(),
            bytes,
        }
    }

    pub fn redirect(location: &str) -> Self {
        let bytes = format!(
            "HTTP/1.1 {}\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
            StatusCode::MovedPermanently,
            location
        )
        .into_bytes();
        Self {
            status: StatusCode::MovedPermanently.code(),
            bytes,
        }
    }

    /// DELETE is recognised but not implemented yet.
    pub fn delete_stub() -> Self {
        Self {
            status: 400,
            bytes: b"HTTP/1.1 400 Method In Development\r\nContent-Length: 0\r\n\r\n".to_vec(),
        }
    }

    /// Default page for `status`, read from the listener's `default_pages` directory.
    ///
    /// Falls back to a generated page if the file can't be read.
    pub fn error(config: &ListenerConfig, status: StatusCode) -> Self {
        let path = error_page_path(config, status);
        match std::fs::read(&path) {
            Ok(body) => Self::new(status, &body),
            Err(e) => {
                eprintln!(
                    "warning: failed to read error page {}: {}",
                    path.display(),
                    e
                );
                Self::new(status, generated_page(status).as_bytes())
            }
        }
    }

    /// Raw CGI output, passed through unmodified.
    pub fn passthrough(bytes: Vec<u8>) -> Self {
        Self {
            status: parse_status(&bytes).unwrap_or(0),
            bytes,
        }
    }
}

fn error_page_path(config: &ListenerConfig, status: StatusCode) -> PathBuf {
    Path::new(config.root())
        .join(DEFAULT_PAGES_DIR)
        .join(format!("{}.html", status.code()))
}

fn generated_page(status: StatusCode) -> String {
    format!(
        "<html>\r\n\
        <head><title>{}</title></head>\r\n\
        <body>\r\n\
        <h1>{}</h1>\r\n\
        <p>{}</p>\r\n\
        <a href=\"/\">Back to Home</a>\r\n\
        </body>\r\n\
        </html>\r\n",
        status,
        status,
        status.explanation(),
    )
}

/// Status code from a `HTTP/x.y NNN ...` first line.
fn parse_status(bytes: &[u8]) -> Option<u16> {
    let line = bytes.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut words = line.split_ascii_whitespace();
    if !words.next()?.starts_with("HTTP/") {
        return None;
    }
    words.next()?.parse().ok()
}

/// Entries of a directory listing. Dot entries are omitted.
pub struct Listing {
    url: String,
    entries: Vec<DirEntry>,
}

impl Listing {
    /// Read `dir`, which is served at `url`.
    pub fn read(dir: &Path, url: &str) -> io::Result<Self> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with('.') {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|entry| entry.file_name());
        let mut url = url.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        Ok(Self { url, entries })
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<html>\r\n\
            <head><title>Index of {0}</title></head>\r\n\
            <body>\r\n\
            <h1>Index of {0}</h1>\r\n\
            <hr>\r\n\
            <pre>\r\n",
            HtmlEscaped(&self.url)
        )?;
        for entry in &self.entries {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let slash = match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => "/",
                _ => "",
            };
            write!(
                f,
                "<a href=\"{}{}{}\">{}{}</a>\r\n",
                UrlEncodedPath(&self.url),
                UrlEncoded(&name),
                slash,
                HtmlEscaped(&name),
                slash
            )?;
        }
        write!(f, "</pre>\r\n<hr>\r\n</body>\r\n</html>\r\n")
    }
}
