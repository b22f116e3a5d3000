#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir_all, write};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

const ERROR_CODES: &[u16] = &[400, 403, 404, 413, 500, 501, 504];

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

/// Document root and server settings, built up before the server starts.
pub struct Site {
    root: TempDir,
    directives: Vec<String>,
    args: Vec<String>,
}

impl Site {
    /// A root holding one `page NNN` default page per error code.
    pub fn new() -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let site = Self {
            root,
            directives: Vec::new(),
            args: Vec::new(),
        };
        for code in ERROR_CODES {
            site.file(&format!("default_pages/{}.html", code), &format!("page {}", code));
        }
        site
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).expect("failed to create directory");
        }
        write(&path, contents).expect("failed to write file");
        path
    }

    pub fn dir(&self, name: &str) {
        create_dir_all(self.root().join(name)).expect("failed to create directory");
    }

    /// Install `body` as the listener's upload script.
    pub fn cgi_script(&self, body: &str) {
        let path = self.file("cgi-bin/upload.py", &format!("#!/bin/sh\n{}", body));
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make script executable");
    }

    /// Extra line inside the `server` block.
    pub fn directive(mut self, line: &str) -> Self {
        self.directives.push(line.to_string());
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn start(self) -> Server {
        // Assumes the port won't be reused before the server binds it.
        let port = get_unused_port().expect("failed to get unused port");
        let config = self.root().join("webserv.conf");
        write(
            &config,
            format!(
                "server {{\n    listen 127.0.0.1:{}\n    root {}\n    {}\n}}\n",
                port,
                self.root().display(),
                self.directives.join("\n    ")
            ),
        )
        .expect("failed to write config");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv"))
            .arg(&config)
            .args(&self.args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv");
        let child = ScopedChild(child);

        assert!(wait_for_port(port), "failed to connect to webserv");

        Server {
            _child: child,
            port,
            site: self,
        }
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    site: Site,
}

impl Server {
    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send `raw` on a fresh connection and read one response.
    pub fn send(&self, raw: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(raw).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    pub fn get(&self, path: &str) -> Response {
        self.send(format!("GET {} HTTP/1.1\r\n\r\n", path).as_bytes())
    }
}

pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let length = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .unwrap_or(0);
        let mut body = vec![0; length];
        reader.read_exact(&mut body)?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    /// Status code and reason, e.g. `404 Not Found`.
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not valid UTF-8")
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
