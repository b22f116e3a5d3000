//! Command-line options and the listener configuration file.
//!
//! A configuration file holds one or more `server` blocks:
//!
//! ```text
//! # comments run to the end of the line
//! server {
//!     listen 127.0.0.1:8080
//!     root www
//!     max_body_size 1048576
//!     autoindex on
//!     redirect /old http://example.com/new
//!     cgi_script cgi-bin/upload.py
//! }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::log::LogSink;

pub const DEFAULT_CONFIG_PATH: &str = "conf/webserv.conf";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1 << 20;
pub const DEFAULT_CGI_SCRIPT: &str = "cgi-bin/upload.py";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Immutable routing configuration of one listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    ip: IpAddr,
    port: u16,
    root: String,
    max_body_size: usize,
    autoindex: bool,
    redirects: HashMap<String, String>,
    cgi_script: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            root: ".".to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            autoindex: false,
            redirects: HashMap::new(),
            cgi_script: DEFAULT_CGI_SCRIPT.to_string(),
        }
    }
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Document root, without a trailing slash (unless it is `/` itself).
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub fn autoindex(&self) -> bool {
        self.autoindex
    }

    /// Configured redirect target for an exact request path.
    pub fn redirect(&self, path: &str) -> Option<&str> {
        self.redirects.get(path).map(String::as_str)
    }

    /// Absolute or root-relative location of the upload script.
    pub fn cgi_script(&self) -> PathBuf {
        Path::new(&self.root).join(&self.cgi_script)
    }

    pub fn with_address(mut self, ip: IpAddr, port: u16) -> Self {
        self.ip = ip;
        self.port = port;
        self
    }

    pub fn with_root(mut self, root: &str) -> Self {
        self.set_root(root);
        self
    }

    pub fn with_autoindex(mut self, autoindex: bool) -> Self {
        self.autoindex = autoindex;
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn with_redirect(mut self, path: &str, target: &str) -> Self {
        self.redirects.insert(path.to_string(), target.to_string());
        self
    }

    fn set_root(&mut self, root: &str) {
        self.root = root.to_string();
        // Strip ending slash.
        if self.root.len() > 1 && self.root.ends_with('/') {
            self.root.pop();
        }
    }

    /// Apply a single directive from inside a `server` block.
    fn apply_directive(&mut self, name: &str, args: &[&str]) -> Result<()> {
        match (name, args) {
            ("listen", [addr]) => {
                if let Ok(port) = addr.parse::<u16>() {
                    self.port = port;
                } else {
                    let addr: SocketAddr = addr
                        .parse()
                        .with_context(|| format!("invalid listen address `{}'", addr))?;
                    self.ip = addr.ip();
                    self.port = addr.port();
                }
            }
            ("root", [root]) => self.set_root(root),
            ("max_body_size", [size]) => {
                self.max_body_size = size
                    .parse()
                    .with_context(|| format!("max_body_size {} is invalid", size))?;
                if self.max_body_size == 0 {
                    bail!("max_body_size must be positive");
                }
            }
            ("autoindex", ["on"]) => self.autoindex = true,
            ("autoindex", ["off"]) => self.autoindex = false,
            ("autoindex", [other]) => bail!("autoindex expects on or off, got `{}'", other),
            ("redirect", [path, target]) => {
                if !path.starts_with('/') {
                    bail!("redirect path `{}' must start with /", path);
                }
                self.redirects.insert(path.to_string(), target.to_string());
            }
            ("cgi_script", [script]) => self.cgi_script = script.to_string(),
            ("listen", _)
            | ("root", _)
            | ("max_body_size", _)
            | ("autoindex", _)
            | ("redirect", _)
            | ("cgi_script", _) => {
                bail!("wrong number of arguments for `{}'", name)
            }
            _ => bail!("unknown directive `{}'", name),
        }
        Ok(())
    }
}

/// Read and parse a configuration file.
pub fn load(path: &Path) -> Result<Vec<ListenerConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid config file {}", path.display()))
}

/// Parse configuration text into one `ListenerConfig` per `server` block.
pub fn parse(text: &str) -> Result<Vec<ListenerConfig>> {
    let mut configs = Vec::new();
    let mut current: Option<ListenerConfig> = None;

    for (number, line) in text.lines().enumerate() {
        let line = line.splitn(2, '#').next().unwrap_or("");
        let words: Vec<&str> = line
            .split_ascii_whitespace()
            .map(|word| word.trim_end_matches(';'))
            .filter(|word| !word.is_empty())
            .collect();
        let (name, args) = match words.split_first() {
            Some(split) => split,
            None => continue, // blank line
        };
        let lineno = number + 1;

        let config = match current.as_mut() {
            Some(config) => config,
            None => {
                match (*name, args) {
                    ("server", ["{"]) => current = Some(ListenerConfig::default()),
                    ("server", _) => bail!("line {}: expected `server {{'", lineno),
                    ("}", _) => bail!("line {}: unexpected `}}'", lineno),
                    (name, _) => bail!("line {}: `{}' outside of a server block", lineno, name),
                }
                continue;
            }
        };
        match (*name, args) {
            ("}", []) => configs.extend(current.take()),
            ("}", _) => bail!("line {}: unexpected arguments after `}}'", lineno),
            ("server", _) => bail!("line {}: nested server block", lineno),
            (name, args) => config
                .apply_directive(name, args)
                .with_context(|| format!("line {}", lineno))?,
        }
    }

    if current.is_some() {
        return Err(anyhow!("unterminated server block"));
    }
    if configs.is_empty() {
        return Err(anyhow!("no server blocks"));
    }
    Ok(configs)
}

/// Process-wide options from the command line.
#[derive(Debug)]
pub struct Options {
    pub config_path: PathBuf,
    pub log_sink: LogSink,
    /// Idle connections are closed after this long.
    pub timeout: Option<Duration>,
    /// CGI scripts are killed after this long.
    pub cgi_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            log_sink: LogSink::Stdout,
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            cgi_timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }
}

impl Options {
    /// Parse `std::env::args`. Prints usage and exits on `--help`.
    pub fn from_command_line() -> Result<Self> {
        let mut args = std::env::args();
        let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        match Self::parse(args)? {
            Some(options) => Ok(options),
            None => {
                usage(&name);
                std::process::exit(0);
            }
        }
    }

    /// Returns None if usage was requested.
    pub fn parse<I: Iterator<Item = String>>(mut args: I) -> Result<Option<Self>> {
        let mut options = Self::default();
        let mut config_given = false;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--help" => return Ok(None),
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    options.log_sink = LogSink::file(Path::new(&filename))?;
                }
                "--syslog" => options.log_sink = LogSink::Syslog,
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    options.timeout = parse_timeout(&number)
                        .with_context(|| format!("timeout number {} is invalid", number))?;
                }
                "--cgi-timeout" => {
                    let number = args.next().context("missing number after --cgi-timeout")?;
                    options.cgi_timeout = parse_timeout(&number)
                        .with_context(|| format!("cgi-timeout number {} is invalid", number))?;
                }
                path if !path.starts_with("--") && !config_given => {
                    options.config_path = PathBuf::from(path);
                    config_given = true;
                }
                _ => return Err(anyhow!("unknown argument `{}'", arg)),
            }
        }
        Ok(Some(options))
    }
}

/// Zero disables the timeout.
fn parse_timeout(number: &str) -> Result<Option<Duration>> {
    Ok(match number.parse::<u64>()? {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    })
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} [config-file] [flags]\n\n\
        \tconfig-file (default: {})\n\
        \t\tListener definitions, one `server {{ ... }}' block each.\n\n\
        flags:\t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append the request log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for request log.\n\n\
        \t--timeout secs (default: {})\n\
        \t\tIf a connection is idle for more than this many seconds,\n\
        \t\tit will be closed. Set to zero to disable timeouts.\n\n\
        \t--cgi-timeout secs (default: {})\n\
        \t\tKill CGI scripts that run longer than this and answer\n\
        \t\twith 504. Set to zero to let scripts run forever.\n\n",
        argv0, DEFAULT_CONFIG_PATH, DEFAULT_TIMEOUT_SECS, DEFAULT_TIMEOUT_SECS,
    );
}
