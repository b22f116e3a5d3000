//! Text transformations applied to request paths, listing markup and log lines.

use std::fmt;

/// Percent-encode a single path segment. Everything outside the RFC3986 unreserved set is escaped.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.as_bytes() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

/// Percent-encode a path, keeping its `/` separators.
pub struct UrlEncodedPath<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncodedPath<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.split('/').enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", UrlEncoded(segment))?;
        }
        Ok(())
    }
}

/// Decode `%XX` escapes. Malformed escapes are kept as-is and invalid UTF-8 is replaced.
pub fn url_decode(url: &str) -> String {
    let mut decoded = Vec::with_capacity(url.len());
    let mut rest = url.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        match escaped_byte(first, tail) {
            Some(byte) => {
                decoded.push(byte);
                rest = &tail[2..];
            }
            None => {
                decoded.push(first);
                rest = tail;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// The byte spelled by `%` and the two hex digits that follow it.
fn escaped_byte(first: u8, tail: &[u8]) -> Option<u8> {
    if first != b'%' {
        return None;
    }
    let digits = tail.get(..2)?;
    // from_str_radix would also take a sign.
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()
}

fn html_entity(c: char) -> Option<&'static str> {
    match c {
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        '&' => Some("&amp;"),
        '\'' => Some("&apos;"),
        '"' => Some("&quot;"),
        _ => None,
    }
}

/// Escape `< > & ' "` into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut plain = 0;
        for (i, c) in self.0.char_indices() {
            if let Some(entity) = html_entity(c) {
                f.write_str(&self.0[plain..i])?;
                f.write_str(entity)?;
                plain = i + c.len_utf8();
            }
        }
        f.write_str(&self.0[plain..])
    }
}

/// Escape a client-supplied string for the access log: no control characters, quotes or
/// non-ASCII bytes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.as_bytes() {
            if !b.is_ascii() || b.is_ascii_control() || b == b'"' {
                write!(f, "%{:02X}", b)?;
            } else {
                write!(f, "{}", b as char)?;
            }
        }
        Ok(())
    }
}

/// Resolve `//`, `/./` and `/../` in a decoded path.
///
/// Returns None if the path does not start with a slash or climbs above the root. A trailing
/// slash survives unless the path collapses to `/`.
pub fn make_safe_url(url: &str) -> Option<String> {
    let relative = url.strip_prefix('/')?;
    let mut segments = Vec::new();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            segment => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Some("/".to_string());
    }

    let mut safe = String::with_capacity(url.len());
    for segment in &segments {
        safe.push('/');
        safe.push_str(segment);
    }
    if url.ends_with('/') {
        safe.push('/');
    }
    Some(safe)
}
