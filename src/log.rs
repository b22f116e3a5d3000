//! Access log.

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::encoding::LogEncoded;

/// Where to put the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    /// Open `path` for appending, creating it if needed.
    pub fn file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self::File(BufWriter::new(file)))
    }

    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                // Escaped log lines never contain NUL, but don't trust that here.
                let message = CString::new(message.replace('\0', ""))?;
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl fmt::Display for ClfDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// One completed request, as it appears in the access log.
#[derive(Debug)]
pub struct AccessEntry<'a> {
    pub client: IpAddr,
    pub method: &'a str,
    pub url: &'a str,
    pub status: u16,
    pub bytes_sent: usize,
    pub referer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

impl<'a> AccessEntry<'a> {
    pub fn format(&self, now: SystemTime) -> String {
        format!(
            "{} - - {} \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"\n",
            self.client,
            ClfDate(now),
            LogEncoded(self.method),
            LogEncoded(self.url),
            self.status,
            self.bytes_sent,
            LogEncoded(self.referer.unwrap_or("")),
            LogEncoded(self.user_agent.unwrap_or("")),
        )
    }
}
