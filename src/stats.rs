use std::mem::MaybeUninit;

use anyhow::{Context, Result};

/// Process-wide counters, printed on shutdown.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections: u64,
    pub num_requests: u64,
    pub cgi_runs: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl ServerStats {
    pub fn received(&mut self, bytes: usize) {
        self.total_in += bytes as u64;
    }

    pub fn sent(&mut self, bytes: usize) {
        self.total_out += bytes as u64;
    }

    pub fn print(&self) -> Result<()> {
        let rusage = getrusage().context("failed to get resource usage")?;
        println!(
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        );
        println!(
            "Connections: {}, requests: {} ({} via CGI)",
            self.connections, self.num_requests, self.cgi_runs
        );
        println!("Bytes: {} in, {} out", self.total_in, self.total_out);
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> std::io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}
