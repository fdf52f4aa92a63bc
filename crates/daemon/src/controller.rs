//! Starting, stopping and inspecting the background daemon.
//!
//! The controller runs in a short-lived CLI process and never executes tasks.
//! It finds the daemon by scanning the process table for [`DISCOVERY_KEYS`],
//! in order, and takes the first PID found. The scan is check-then-act: two
//! concurrent `start` calls can both see no daemon and both launch one.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Fragments of the daemon's command line, most specific first.
pub const DISCOVERY_KEYS: [&str; 2] = ["sokrates-daemon", "sokrates_daemon"];

/// Hidden subcommand the launcher re-executes the binary with.
pub const RUN_SUBCOMMAND: &str = "run";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("process discovery failed: {0}")]
    Discovery(#[source] io::Error),
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch daemon: {0}")]
    Launch(String),
    #[error("cannot launch daemon: {0}")]
    NotReady(String),
}

/// Lists PIDs whose command line contains a fragment.
pub trait ProcessDiscovery {
    fn candidate_pids(&self, fragment: &str) -> io::Result<Vec<u32>>;
}

pub trait ProcessSignals {
    /// Ask the process to exit. A process that is already gone is not an error.
    fn terminate(&self, pid: u32) -> io::Result<()>;
    /// Force the process to exit. A process that is already gone is not an error.
    fn kill(&self, pid: u32) -> io::Result<()>;
    fn is_alive(&self, pid: u32) -> bool;
}

/// Starts a detached daemon and returns its PID.
pub trait DaemonLauncher {
    fn launch(&self) -> Result<u32, ControlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(u32),
    AlreadyRunning(u32),
}

impl StartOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Started(pid) | Self::AlreadyRunning(pid) => *pid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to stop. Reported as a failure by the CLI.
    NotRunning,
    Stopped { pid: u32, forced: bool },
}

impl StopOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(u32),
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartOutcome {
    pub stopped: StopOutcome,
    pub started: StartOutcome,
}

/// How long `stop` waits for a graceful exit before escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTiming {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for StopTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct ProcessController<D, P, L> {
    discovery: D,
    signals: P,
    launcher: L,
    timing: StopTiming,
}

impl<D, P, L> ProcessController<D, P, L>
where
    D: ProcessDiscovery,
    P: ProcessSignals,
    L: DaemonLauncher,
{
    pub fn new(discovery: D, signals: P, launcher: L) -> Self {
        Self {
            discovery,
            signals,
            launcher,
            timing: StopTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: StopTiming) -> Self {
        self.timing = timing;
        self
    }

    /// First PID matching the discovery keys, tried in order.
    pub fn discover(&self) -> Result<Option<u32>, ControlError> {
        for key in DISCOVERY_KEYS {
            let pids = self
                .discovery
                .candidate_pids(key)
                .map_err(ControlError::Discovery)?;
            if let Some(pid) = pids.first() {
                debug!(key, pid, "found daemon process");
                return Ok(Some(*pid));
            }
        }
        Ok(None)
    }

    /// Start the daemon unless one is already running.
    pub fn start(&self) -> Result<StartOutcome, ControlError> {
        self.start_with(|| Ok(()))
    }

    /// Like [`start`](Self::start), but `ready` must pass before a launch.
    /// It is not consulted when a daemon is already running.
    pub fn start_with<F>(&self, ready: F) -> Result<StartOutcome, ControlError>
    where
        F: FnOnce() -> Result<(), ControlError>,
    {
        if let Some(pid) = self.discover()? {
            info!(pid, "daemon already running");
            return Ok(StartOutcome::AlreadyRunning(pid));
        }
        ready()?;
        let pid = self.launcher.launch()?;
        info!(pid, "daemon started");
        Ok(StartOutcome::Started(pid))
    }

    /// Stop `pid`, or the discovered daemon. Escalates to a kill after the timeout.
    pub fn stop(&self, pid: Option<u32>) -> Result<StopOutcome, ControlError> {
        let pid = match pid {
            Some(pid) if self.signals.is_alive(pid) => pid,
            Some(pid) => {
                warn!(pid, "no such process");
                return Ok(StopOutcome::NotRunning);
            }
            None => match self.discover()? {
                Some(pid) => pid,
                None => {
                    warn!("no running daemon found");
                    return Ok(StopOutcome::NotRunning);
                }
            },
        };

        self.signals
            .terminate(pid)
            .map_err(|source| ControlError::Signal { pid, source })?;

        let deadline = Instant::now() + self.timing.timeout;
        while Instant::now() < deadline {
            if !self.signals.is_alive(pid) {
                info!(pid, "daemon stopped");
                return Ok(StopOutcome::Stopped { pid, forced: false });
            }
            std::thread::sleep(self.timing.poll_interval);
        }
        if !self.signals.is_alive(pid) {
            return Ok(StopOutcome::Stopped { pid, forced: false });
        }

        warn!(pid, timeout_secs = self.timing.timeout.as_secs_f64(), "daemon did not exit; killing");
        self.signals
            .kill(pid)
            .map_err(|source| ControlError::Signal { pid, source })?;
        Ok(StopOutcome::Stopped { pid, forced: true })
    }

    /// Stop then start. Not atomic: no daemon runs in between.
    pub fn restart(&self) -> Result<RestartOutcome, ControlError> {
        let stopped = self.stop(None)?;
        let started = self.start()?;
        Ok(RestartOutcome { stopped, started })
    }

    pub fn status(&self) -> Result<DaemonStatus, ControlError> {
        Ok(match self.discover()? {
            Some(pid) => DaemonStatus::Running(pid),
            None => DaemonStatus::NotRunning,
        })
    }
}

/// Discovery via `pgrep -f`, excluding this process and its parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgrepDiscovery;

impl ProcessDiscovery for PgrepDiscovery {
    fn candidate_pids(&self, fragment: &str) -> io::Result<Vec<u32>> {
        let output = Command::new("pgrep").arg("-f").arg(fragment).output()?;
        // pgrep exits 1 when nothing matched.
        match output.status.code() {
            Some(0) => {}
            Some(1) => return Ok(Vec::new()),
            _ => {
                return Err(io::Error::other(format!(
                    "pgrep failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        let own = [std::process::id(), std::os::unix::process::parent_id()];
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .filter(|pid| !own.contains(pid))
            .collect())
    }
}

/// Signals via `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixSignals;

impl UnixSignals {
    fn send(&self, pid: u32, signal: libc::c_int) -> io::Result<()> {
        let pid = to_pid(pid)?;
        if unsafe { libc::kill(pid, signal) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }
}

impl ProcessSignals for UnixSignals {
    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.send(pid, libc::SIGTERM)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        self.send(pid, libc::SIGKILL)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = to_pid(pid) else {
            return false;
        };
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Only positive PIDs; 0 and negatives would address process groups.
fn to_pid(pid: u32) -> io::Result<libc::pid_t> {
    libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))
}

/// Re-executes a binary with [`RUN_SUBCOMMAND`] in its own process group,
/// output appended to the log file.
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    exe: PathBuf,
    log_file: PathBuf,
    grace: Duration,
}

impl DetachedLauncher {
    pub fn new(exe: impl Into<PathBuf>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            log_file: log_file.into(),
            grace: Duration::from_millis(200),
        }
    }

    /// Launcher for the currently running executable.
    pub fn current_exe(log_file: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, log_file))
    }

    /// How long to wait before checking that the child survived startup.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl DaemonLauncher for DetachedLauncher {
    fn launch(&self) -> Result<u32, ControlError> {
        let launch_err = |what: &str, e: io::Error| ControlError::Launch(format!("{what}: {e}"));

        if let Some(parent) = self.log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| launch_err(&format!("creating {}", parent.display()), e))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(|e| launch_err(&format!("opening {}", self.log_file.display()), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| launch_err("duplicating log handle", e))?;

        let mut child = Command::new(&self.exe)
            .arg(RUN_SUBCOMMAND)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(|e| launch_err(&format!("spawning {}", self.exe.display()), e))?;
        let pid = child.id();

        std::thread::sleep(self.grace);
        match child.try_wait() {
            Ok(None) => Ok(pid),
            Ok(Some(status)) => Err(ControlError::Launch(format!(
                "daemon exited immediately ({status}); see {}",
                self.log_file.display()
            ))),
            Err(e) => Err(launch_err("checking daemon state", e)),
        }
    }
}
