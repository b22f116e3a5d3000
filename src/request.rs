//! Parsing over the raw bytes a connection has accumulated.

/// Separates the header section from the body.
pub const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Offset of the header/body boundary, if the delimiter has arrived.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    find(HEADER_DELIMITER, buf)
}

/// A request whose header section is complete.
#[derive(Debug)]
pub struct Request<'a> {
    head: &'a str,
    method: &'a str,
    uri: Option<&'a str>,
    body: &'a [u8],
}

impl<'a> Request<'a> {
    /// Split `buf` at `header_end` into head and body. Returns None if the head is not UTF-8.
    ///
    /// The body is everything after the delimiter; callers trim it to `Content-Length`.
    pub fn parse(buf: &'a [u8], header_end: usize) -> Option<Self> {
        let head = std::str::from_utf8(&buf[..header_end]).ok()?;
        let body = buf
            .get(header_end + HEADER_DELIMITER.len()..)
            .unwrap_or(&[]);
        let request_line = head.lines().next().unwrap_or("");
        let mut words = request_line.split_ascii_whitespace();
        let method = words.next().unwrap_or("");
        let uri = words.next();
        Some(Self {
            head,
            method,
            uri,
            body,
        })
    }

    /// The first whitespace-delimited token of the request line.
    pub fn method(&self) -> &'a str {
        self.method
    }

    /// The request target as sent, including any query string.
    pub fn uri(&self) -> Option<&'a str> {
        self.uri
    }

    /// The request target without its query string.
    pub fn path(&self) -> Option<&'a str> {
        self.uri.map(|uri| uri.splitn(2, '?').next().unwrap_or(""))
    }

    pub fn query(&self) -> &'a str {
        self.uri
            .and_then(|uri| uri.splitn(2, '?').nth(1))
            .unwrap_or("")
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.head.lines().skip(1).find_map(|line| {
            let mut parts = line.splitn(2, ':');
            let key = parts.next()?;
            let value = parts.next()?;
            if key.trim().eq_ignore_ascii_case(name) {
                Some(value.trim())
            } else {
                None
            }
        })
    }

    /// Declared body length. An unparsable value is treated as absent.
    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")
            .and_then(|value| value.parse().ok())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case(b"abc", b"", Some(0) ; "empty needle")]
    #[test_case(b"", b"a", None ; "empty haystack")]
    #[test_case(b"hello\r\n\r\nbody", b"\r\n\r\n", Some(5) ; "delimiter")]
    #[test_case(b"hello\n\nbody", b"\r\n\r\n", None ; "bare newlines")]
    fn find_works(haystack: &[u8], needle: &[u8], expected: Option<usize>) {
        assert_eq!(find(needle, haystack), expected);
    }

    #[test]
    fn parses_head_and_body() {
        let buf = b"POST /cgi?x=1 HTTP/1.1\r\nHost: a\r\ncontent-type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let end = header_end(buf).unwrap();
        let request = Request::parse(buf, end).unwrap();
        assert_eq!(request.method(), "POST");
        assert_eq!(request.uri(), Some("/cgi?x=1"));
        assert_eq!(request.path(), Some("/cgi"));
        assert_eq!(request.query(), "x=1");
        assert_eq!(request.header("Content-Type"), Some("text/plain"));
        assert_eq!(request.header("host"), Some("a"));
        assert_eq!(request.header("Referer"), None);
        assert_eq!(request.content_length(), Some(5));
        assert_eq!(request.body(), b"hello");
    }

    #[test]
    fn request_line_is_not_a_header() {
        let buf = b"GET /Host:x HTTP/1.1\r\n\r\n";
        let request = Request::parse(buf, header_end(buf).unwrap()).unwrap();
        assert_eq!(request.header("GET /Host"), None);
    }

    #[test]
    fn missing_uri() {
        let buf = b"GET\r\n\r\n";
        let request = Request::parse(buf, header_end(buf).unwrap()).unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.uri(), None);
        assert_eq!(request.path(), None);
    }

    #[test]
    fn whole_buffer_as_head() {
        let buf = b"GET /x HTTP/1.1";
        let request = Request::parse(buf, buf.len()).unwrap();
        assert_eq!(request.uri(), Some("/x"));
        assert!(request.body().is_empty());
    }

    #[test]
    fn rejects_binary_head() {
        let buf = b"GET /\xff HTTP/1.1\r\n\r\n";
        assert!(Request::parse(buf, header_end(buf).unwrap()).is_none());
    }
}
