//! CGI bridge.
//!
//! Scripts run on worker threads so a slow script never holds up the reactor. Each worker reports
//! its outcome on a channel and then writes a byte to a wake-up pipe; the read end of that pipe is
//! registered with the reactor as a [`CompletionQueue`].

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, setpgid, Pid};

use crate::registry::Token;
use crate::request::Request;

const WAIT_INTERVAL: Duration = Duration::from_millis(5);

/// The script ran past its deadline and was killed.
#[derive(Debug)]
pub struct TimedOut(pub Duration);

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CGI script timed out after {}s", self.0.as_secs())
    }
}

impl std::error::Error for TimedOut {}

/// Everything needed to run one script: its path, environment and input.
#[derive(Debug, Clone)]
pub struct CgiRequest {
    script: PathBuf,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    body: Vec<u8>,
}

impl CgiRequest {
    pub fn new(script: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            script,
            working_dir,
            env: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn push_env(&mut self, key: &str, value: &str) {
        self.env.push((key.to_string(), value.to_string()));
    }

    /// Copy a request header into the environment, if the request has it.
    pub fn push_env_from_header(&mut self, request: &Request<'_>, header: &str, key: &str) {
        if let Some(value) = request.header(header) {
            self.push_env(key, value);
        }
    }

    pub fn set_body(&mut self, body: &[u8]) {
        self.body = body.to_vec();
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Run the script to completion and return everything it wrote to stdout.
    ///
    /// Fails if the script can't be spawned, exits unsuccessfully, outlives `timeout`, or if its
    /// pipes fail.
    pub fn execute(self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let script = if self.script.is_absolute() {
            self.script
        } else {
            // Relative paths would resolve against the script's working directory.
            std::env::current_dir()
                .context("failed to get current directory")?
                .join(&self.script)
        };

        let mut command = Command::new(&script);
        command
            .env_clear()
            .envs(self.env)
            .env("SCRIPT_FILENAME", &script)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        // The script leads its own process group so the deadline reaches whatever it starts.
        unsafe {
            command.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(|_| io::Error::last_os_error())
            });
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", script.display()))?;

        let mut stdin = child.stdin.take().context("CGI stdin not captured")?;
        let mut stdout = child.stdout.take().context("CGI stdout not captured")?;
        let body = self.body;
        let writer = thread::spawn(move || match stdin.write_all(&body) {
            // A script is free to ignore its input.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            result => result,
        });
        let reader = thread::spawn(move || {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).map(|_| output)
        });

        let status = wait(&mut child, timeout)?;

        let output = reader
            .join()
            .map_err(|_| anyhow!("CGI output reader panicked"))?
            .context("failed to read CGI output")?;
        writer
            .join()
            .map_err(|_| anyhow!("CGI input writer panicked"))?
            .context("failed to write CGI input")?;

        if !status.success() {
            bail!("{} exited with {}", script.display(), status);
        }
        Ok(output)
    }
}

/// Wait for `child`, killing its process group once `timeout` has passed.
fn wait(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus> {
    let timeout = match timeout {
        Some(timeout) => timeout,
        None => return child.wait().context("failed to wait for CGI script"),
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to wait for CGI script")? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            killpg(Pid::from_raw(child.id() as libc::pid_t), Signal::SIGKILL).ok();
            child.kill().ok();
            child.wait().ok();
            return Err(TimedOut(timeout).into());
        }
        thread::sleep(WAIT_INTERVAL);
    }
}

/// Outcome of one script run, addressed to the connection that asked for it.
#[derive(Debug)]
pub struct CgiCompletion {
    pub token: Token,
    pub result: Result<Vec<u8>>,
}

/// Starts each script run on its own worker thread.
#[derive(Debug)]
pub struct CgiSpawner {
    sender: Sender<CgiCompletion>,
    waker: Arc<File>,
    timeout: Option<Duration>,
}

impl CgiSpawner {
    /// Create the spawner and the queue its workers report to.
    pub fn new(timeout: Option<Duration>) -> Result<(Self, CompletionQueue)> {
        let (read_fd, write_fd) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .context("failed to create CGI wake-up pipe")?;
        // Both ends are owned from here on and closed on drop.
        let (pipe, waker) = unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) };
        let (sender, receiver) = channel();
        let spawner = Self {
            sender,
            waker: Arc::new(waker),
            timeout,
        };
        Ok((spawner, CompletionQueue { pipe, receiver }))
    }

    /// Run `request` in the background; its outcome arrives on the completion queue tagged with
    /// `token`.
    pub fn submit(&self, token: Token, request: CgiRequest) -> io::Result<()> {
        let sender = self.sender.clone();
        let waker = Arc::clone(&self.waker);
        let timeout = self.timeout;
        thread::Builder::new()
            .name(format!("cgi-{}", token))
            .spawn(move || {
                let result = request.execute(timeout);
                if sender.send(CgiCompletion { token, result }).is_ok() {
                    // A full pipe already guarantees a wake-up.
                    (&*waker).write(&[1]).ok();
                }
            })
            .map(|_| ())
    }
}

/// Read end of the wake-up pipe plus the channel workers report on.
#[derive(Debug)]
pub struct CompletionQueue {
    pipe: File,
    receiver: Receiver<CgiCompletion>,
}

impl CompletionQueue {
    pub fn fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }

    /// Empty the wake-up pipe and move every finished run into `completions`.
    pub fn drain(&mut self, completions: &mut Vec<CgiCompletion>) -> io::Result<()> {
        let mut buf = [0; 64];
        loop {
            match self.pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        loop {
            match self.receiver.try_recv() {
                Ok(completion) => completions.push(completion),
                Err(TryRecvError::Empty) => return Ok(()),
                // The pool holds a sender for as long as the queue is polled.
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }
}
