//! OS process plumbing: building the child command, owning the live handle,
//! and the two termination strategies (by retained handle, by port lookup).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::definition::ServiceDefinition;

const POSIX_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash"];

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "exit status unknown"),
        }
    }
}

/// Program and argv for a definition. A shell invoked with its "run a command line"
/// flag gets the remaining arguments joined into one string, so the shell resolves
/// the target program through its own PATH lookup.
pub fn command_line(definition: &ServiceDefinition) -> (String, Vec<String>) {
    let program = definition.command.clone();
    let args = &definition.args;

    if let Some(flag) = args.first() {
        if is_command_line_flag(&program, flag) && args.len() > 1 {
            return (program, vec![flag.clone(), args[1..].join(" ")]);
        }
    }

    (program, args.clone())
}

fn is_command_line_flag(program: &str, flag: &str) -> bool {
    let base = Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
        .to_lowercase();
    let base = base.strip_suffix(".exe").unwrap_or(&base);

    match base {
        shell if POSIX_SHELLS.contains(&shell) => flag == "-c",
        "cmd" => flag.eq_ignore_ascii_case("/c"),
        "powershell" | "pwsh" => flag.eq_ignore_ascii_case("-command") || flag == "-c",
        _ => false,
    }
}

/// Relative working directories are resolved against `base`; no directory means `base`.
pub fn resolve_working_directory(base: &Path, directory: Option<&Path>) -> PathBuf {
    match directory {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => base.join(dir),
        None => base.to_path_buf(),
    }
}

/// Build the command for a definition: inherited environment with the configured
/// overrides on top, both output streams piped, and (on unix) a fresh process group
/// so the whole tree can be signalled at once.
pub fn build_command(definition: &ServiceDefinition, base: &Path) -> Command {
    let (program, args) = command_line(definition);

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(resolve_working_directory(
            base,
            definition.working_directory.as_deref(),
        ))
        .envs(&definition.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    command.process_group(0);

    command
}

/// The retained handle of a process spawned by this session. A background task
/// owns the `Child` and publishes its exit; this handle only observes and signals.
pub struct LiveProcess {
    pub run_id: u64,
    pub pid: u32,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill: CancellationToken,
}

impl LiveProcess {
    pub fn watch(run_id: u64, pid: u32, mut child: Child) -> Self {
        let (tx, rx) = watch::channel(None);
        let kill = CancellationToken::new();

        let kill_requested = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_requested.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!(pid, "start_kill failed: {}", e);
                    }
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!(pid, "failed to wait on child process: {}", e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            tx.send_replace(Some(info));
        });

        Self {
            run_id,
            pid,
            exit: rx,
            kill,
        }
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut exit = self.exit.clone();
        tokio::time::timeout(timeout, wait_for_exit(&mut exit))
            .await
            .ok()
    }

    /// Polite termination of the whole process group.
    pub fn terminate(&self) -> io::Result<()> {
        signal_group(self.pid, false)
    }

    /// Forced termination of the whole process group.
    pub fn kill(&self) {
        if let Err(e) = signal_group(self.pid, true) {
            debug!(pid = self.pid, "failed to kill process group: {}", e);
        }
        self.kill.cancel();
    }
}

/// Resolve once the watched process has exited.
pub async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match exit.wait_for(Option::is_some).await {
        Ok(info) => info.clone().unwrap_or(ExitInfo {
            code: None,
            signal: None,
        }),
        // The watcher task is gone without publishing, so the child is gone with it.
        Err(_) => ExitInfo {
            code: None,
            signal: None,
        },
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, force: bool) -> io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, force: bool) -> io::Result<()> {
    if force {
        // The watcher task falls back to Child::start_kill.
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "graceful termination signals are not supported on this platform",
        ))
    }
}

/// Signal a process found through the OS process table, plus every descendant.
/// Used for processes this session did not spawn and holds no handle to.
#[cfg(unix)]
pub fn signal_tree(pid: u32, force: bool) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    for child in descendants(pid) {
        if let Err(errno) = kill(Pid::from_raw(child as i32), signal) {
            debug!(pid = child, "failed to signal descendant: {}", errno);
        }
    }

    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
pub fn signal_tree(_pid: u32, _force: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "terminating processes by id is not supported on this platform",
    ))
}

/// All descendants of `pid`, parents before their children.
pub fn descendants(pid: u32) -> Vec<u32> {
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (child, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(child.as_u32());
        }
    }
    collect_descendants(&children, pid)
}

fn collect_descendants(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut frontier = VecDeque::from([root]);
    while let Some(current) = frontier.pop_front() {
        for &child in children.get(&current).into_iter().flatten() {
            if seen.insert(child) {
                found.push(child);
                frontier.push_back(child);
            }
        }
    }
    found
}

/// Pid of the process listening on a local TCP port, if the OS process table can tell.
#[cfg(target_os = "linux")]
pub fn find_port_owner(port: u16) -> Option<u32> {
    let inodes: Vec<u64> = ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|table| std::fs::read_to_string(table).ok())
        .flat_map(|table| listening_inodes(&table, port))
        .collect();
    if inodes.is_empty() {
        return None;
    }

    let targets: Vec<String> = inodes
        .iter()
        .map(|inode| format!("socket:[{}]", inode))
        .collect();

    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if targets.iter().any(|t| link.as_os_str() == t.as_str()) {
                    return Some(pid);
                }
            }
        }
    }
    None
}

/// Without /proc, ask `lsof` for the listener.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn find_port_owner(port: u16) -> Option<u32> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", "-t", "-sTCP:LISTEN"])
        .arg(format!("-iTCP:{}", port))
        .stderr(Stdio::null())
        .output()
        .map_err(|e| debug!(port, "lsof is unavailable: {}", e))
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.trim().parse().ok())
}

#[cfg(not(unix))]
pub fn find_port_owner(_port: u16) -> Option<u32> {
    None
}

/// Socket inodes in LISTEN state bound to `port`, from a /proc/net/tcp{,6} table.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;

            let local_port = u16::from_str_radix(local.rsplit(':').next()?, 16).ok()?;
            if local_port != port || *state != TCP_LISTEN {
                return None;
            }
            inode.parse().ok()
        })
        .collect()
}
