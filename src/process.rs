//! Low-level process spawning, the waitable handle, and tree destruction.
//!
//! Spawning goes through [`SpawnSpec`], a frozen description of one child:
//! program, argument vector, environment, working directory, and one
//! [`StdioSpec`] per standard stream. Prewired pipe ends (for OS-level
//! pipeline chaining and stderr redirection) are passed as owned fds.
//!
//! [`ProcessHandle`] is the view handed to while-running hooks: identity,
//! liveness, wait, and graceful/forcible termination. The exit code is
//! published on a watch channel by the stage waiter after it reaps the
//! child, so any number of handle clones can await it.

use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::debug;

/// Disposition of one standard stream at spawn time.
pub(crate) enum StdioSpec {
    /// Connect to the null device.
    Null,
    /// Inherit the parent's stream.
    Inherit,
    /// A pipe serviced by a runner task.
    Piped,
    /// Read from a file (stdin only).
    ReadFile(PathBuf),
    /// Write to a file, truncating or appending (stdout/stderr only).
    WriteFile { path: PathBuf, append: bool },
    /// A prewired pipe end, e.g. one side of an OS-level pipeline chain.
    Fd(OwnedFd),
}

impl StdioSpec {
    fn into_stdio(self, read_side: bool) -> io::Result<Stdio> {
        match self {
            Self::Null => Ok(Stdio::null()),
            Self::Inherit => Ok(Stdio::inherit()),
            Self::Piped => Ok(Stdio::piped()),
            Self::ReadFile(path) => {
                debug_assert!(read_side);
                Ok(Stdio::from(std::fs::File::open(path)?))
            }
            Self::WriteFile { path, append } => {
                debug_assert!(!read_side);
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .append(append)
                    .truncate(!append)
                    .open(path)?;
                Ok(Stdio::from(file))
            }
            Self::Fd(fd) => Ok(Stdio::from(fd)),
        }
    }
}

/// Frozen description of one child process, ready to spawn.
pub(crate) struct SpawnSpec {
    /// Program to execute (element 0 of the formatted command line).
    pub program: String,
    /// Remaining formatted arguments.
    pub arguments: Vec<String>,
    pub directory: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
    pub stdin: StdioSpec,
    pub stdout: StdioSpec,
    pub stderr: StdioSpec,
}

/// Spawn one child from its spec.
///
/// `kill_on_drop` is set as a safety net: if the owning future is dropped
/// before the waiter reaps the child, the child is killed rather than
/// orphaned.
pub(crate) fn spawn_stage(spec: SpawnSpec) -> io::Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.arguments);
    cmd.env_clear();
    cmd.envs(spec.environment.iter().map(|(k, v)| (k, v)));
    if let Some(dir) = &spec.directory {
        cmd.current_dir(dir);
    }
    cmd.stdin(spec.stdin.into_stdio(true)?);
    cmd.stdout(spec.stdout.into_stdio(false)?);
    cmd.stderr(spec.stderr.into_stdio(false)?);
    cmd.kill_on_drop(true);
    cmd.spawn()
}

/// Waitable view of a running child, passed to while-running hooks.
///
/// Cloneable; all clones observe the same exit publication.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    command: PathBuf,
    arguments: Vec<String>,
    exit: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: u32,
        command: PathBuf,
        arguments: Vec<String>,
        exit: watch::Receiver<Option<i32>>,
    ) -> Self {
        Self {
            pid,
            command,
            arguments,
            exit,
        }
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The command path the stage was configured with.
    pub fn command(&self) -> &Path {
        &self.command
    }

    /// The argument vector the stage was configured with.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// The recorded exit code, or `None` while the child has not been
    /// reaped yet.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Whether the child is still running.
    pub fn is_alive(&self) -> bool {
        if self.exit_code().is_some() {
            return false;
        }
        // Signal 0 probes existence without delivering anything.
        signal::kill(Pid::from_raw(self.pid as i32), None).is_ok()
    }

    /// Wait until the child has exited and return its exit code.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit.clone();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                // The runner went away without publishing; report the
                // conventional unknown status.
                return rx.borrow().unwrap_or(-1);
            }
        }
    }

    /// Wait up to `timeout`; `None` if the child is still running after it.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Direct children of the child process.
    pub fn children(&self) -> Vec<u32> {
        children_of(self.pid)
    }

    /// All descendants of the child process, parents before their children.
    pub fn descendants(&self) -> Vec<u32> {
        descendants_of(self.pid)
    }

    /// Request graceful termination (SIGTERM).
    pub fn terminate(&self) {
        let _ = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
    }

    /// Destroy the child forcibly (SIGKILL). Descendants are not touched;
    /// use [`destroy_process_tree`] for the whole tree.
    pub fn kill(&self) {
        let _ = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
    }
}

/// Parent pid of `pid`, from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn parent_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Field 2 (comm) may contain spaces and parentheses; everything after
    // the last ')' is well-formed space-separated fields, starting with the
    // state and then the ppid.
    let after = stat.rsplit_once(')')?.1;
    after.split_whitespace().nth(1)?.parse().ok()
}

/// Direct children of `pid`, by scanning `/proc` for matching parent pids.
#[cfg(target_os = "linux")]
pub(crate) fn children_of(pid: u32) -> Vec<u32> {
    all_processes()
        .into_iter()
        .filter(|&p| parent_of(p) == Some(pid))
        .collect()
}

#[cfg(target_os = "linux")]
fn all_processes() -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
        .collect()
}

/// Every descendant of `pid`, breadth-first so parents precede children.
#[cfg(target_os = "linux")]
pub(crate) fn descendants_of(pid: u32) -> Vec<u32> {
    let all = all_processes();
    let parents: Vec<(u32, Option<u32>)> = all.iter().map(|&p| (p, parent_of(p))).collect();

    let mut out = Vec::new();
    let mut frontier = vec![pid];
    while let Some(current) = frontier.pop() {
        for &(p, parent) in &parents {
            if parent == Some(current) && !out.contains(&p) {
                out.push(p);
                frontier.push(p);
            }
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn children_of(_pid: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn descendants_of(_pid: u32) -> Vec<u32> {
    Vec::new()
}

/// Forcibly destroy `pid` and every descendant.
///
/// The descendant set is captured before any kill, because killing the
/// root reparents its children and puts them beyond reach of the parent
/// relationship. Descendants are killed deepest-first, the target last.
pub fn destroy_process_tree(pid: u32) {
    let descendants = descendants_of(pid);
    if !descendants.is_empty() {
        debug!(pid, count = descendants.len(), "destroying descendants");
    }
    for &p in descendants.iter().rev() {
        let _ = signal::kill(Pid::from_raw(p as i32), Signal::SIGKILL);
    }
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

/// Map an exit status to the code reported in results and errors.
///
/// Signal deaths use the shell convention `128 + signal`; a status with
/// neither code nor signal reports `-1`.
pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}
