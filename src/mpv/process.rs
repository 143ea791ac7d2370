//! MPV process detection, spawning and supervision.
//!
//! The `Child` handle is moved into a background wait task which publishes the
//! exit status on a watch channel; [`MpvProcess`] keeps a kill channel to
//! request a forced kill and a ring buffer with the tail of the player's output.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV ({path}): {source}")]
  SpawnFailed {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Native window the player renders into (X11 window ID, HWND, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle(pub u64);

impl fmt::Display for WindowHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Process state as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
  Running,
  Exited(i32),
  /// Ended without an exit code (killed by a signal).
  Terminated,
}

impl ExitStatus {
  pub fn is_running(&self) -> bool {
    matches!(self, ExitStatus::Running)
  }

  /// Exited on its own with status 0.
  pub fn is_clean(&self) -> bool {
    matches!(self, ExitStatus::Exited(0))
  }

  pub fn code(&self) -> Option<i32> {
    match self {
      ExitStatus::Exited(code) => Some(*code),
      _ => None,
    }
  }
}

impl From<std::process::ExitStatus> for ExitStatus {
  fn from(status: std::process::ExitStatus) -> Self {
    status.code().map_or(ExitStatus::Terminated, ExitStatus::Exited)
  }
}

impl fmt::Display for ExitStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ExitStatus::Running => f.write_str("running"),
      ExitStatus::Exited(code) => write!(f, "exit code {}", code),
      ExitStatus::Terminated => f.write_str("terminated by signal"),
    }
  }
}

/// Flags beyond the ones every embedded player needs.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
  pub extra_args: Vec<String>,
  pub keep_open: bool,
  /// Lines of player output kept for diagnostics.
  pub output_tail: usize,
}

impl Default for LaunchOptions {
  fn default() -> Self {
    Self {
      extra_args: Vec::new(),
      keep_open: true,
      output_tail: 50,
    }
  }
}

/// A fresh per-instance IPC socket/pipe path.
pub fn default_socket_path() -> String {
  let id = uuid::Uuid::new_v4().simple();
  #[cfg(windows)]
  {
    format!(r"\\.\pipe\mpvbridge-{}", id)
  }
  #[cfg(not(windows))]
  {
    std::env::temp_dir()
      .join(format!("mpvbridge-{}.sock", id))
      .to_string_lossy()
      .into_owned()
  }
}

/// Remove a leftover socket file. Windows named pipes are cleaned up automatically.
pub fn cleanup_socket(path: &str) {
  #[cfg(not(windows))]
  {
    match std::fs::remove_file(path) {
      Ok(()) => log::debug!("Removed socket {}", path),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => log::warn!("Failed to remove socket {}: {}", path, e),
    }
  }
  #[cfg(windows)]
  {
    let _ = path;
  }
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  let common_paths: &[&str] = &[
    r"C:\Program Files\mpv\mpv.exe",
    r"C:\Program Files (x86)\mpv\mpv.exe",
    r"C:\mpv\mpv.exe",
  ];
  #[cfg(target_os = "macos")]
  let common_paths: &[&str] = &[
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
    "/Applications/mpv.app/Contents/MacOS/mpv",
  ];
  #[cfg(not(any(windows, target_os = "macos")))]
  let common_paths: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

  common_paths.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Command-line flags for an embedded, idle player controlled over `socket_path`.
pub fn build_args(
  window: Option<WindowHandle>,
  socket_path: &str,
  options: &LaunchOptions,
) -> Vec<String> {
  let mut args = vec![
    "--no-border".to_string(),
    "--osc=no".to_string(),
    format!("--input-ipc-server={}", socket_path),
    "--idle=yes".to_string(),
    "--input-terminal=no".to_string(),
    format!("--keep-open={}", if options.keep_open { "yes" } else { "no" }),
  ];

  match window {
    Some(handle) => args.push(format!("--wid={}", handle)),
    None => args.push("--force-window=yes".to_string()),
  }

  args.extend(options.extra_args.iter().cloned());
  args
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

/// A running (or finished) MPV child process.
pub struct MpvProcess {
  pid: Option<u32>,
  status_rx: watch::Receiver<ExitStatus>,
  /// Consumed on the first forced kill.
  kill_tx: Mutex<Option<oneshot::Sender<()>>>,
  terminating: AtomicBool,
  output: OutputTail,
}

impl MpvProcess {
  /// Spawn MPV with IPC server enabled, embedded into `window` when given.
  pub fn spawn(
    executable: &Path,
    window: Option<WindowHandle>,
    socket_path: &str,
    options: &LaunchOptions,
  ) -> Result<Self, ProcessError> {
    let args = build_args(window, socket_path, options);
    log::info!("Spawning MPV: {:?} {}", executable, args.join(" "));

    let mut child = Command::new(executable)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
          ProcessError::NotFound
        } else {
          ProcessError::SpawnFailed {
            path: executable.to_path_buf(),
            source: e,
          }
        }
      })?;

    let pid = child.id();
    log::info!("MPV process started with PID: {:?}", pid);

    let output: OutputTail = Arc::new(Mutex::new(VecDeque::with_capacity(options.output_tail)));
    if let Some(stdout) = child.stdout.take() {
      tokio::spawn(capture_output(stdout, "stdout", output.clone(), options.output_tail));
    }
    if let Some(stderr) = child.stderr.take() {
      tokio::spawn(capture_output(stderr, "stderr", output.clone(), options.output_tail));
    }

    let (status_tx, status_rx) = watch::channel(ExitStatus::Running);
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(wait_for_exit(child, kill_rx, status_tx));

    Ok(Self {
      pid,
      status_rx,
      kill_tx: Mutex::new(Some(kill_tx)),
      terminating: AtomicBool::new(false),
      output,
    })
  }

  pub fn id(&self) -> Option<u32> {
    self.pid
  }

  /// Non-blocking status check.
  pub fn try_status(&self) -> ExitStatus {
    *self.status_rx.borrow()
  }

  /// Wait until the process has exited.
  pub async fn wait(&self) -> ExitStatus {
    let mut status_rx = self.status_rx.clone();
    let status = match status_rx.wait_for(|status| !status.is_running()).await {
      Ok(status) => *status,
      Err(_) => ExitStatus::Terminated,
    };
    status
  }

  /// Ask the player to exit, force-killing it once `grace` has passed.
  ///
  /// Only the first call signals the process; later calls just wait for the exit.
  pub async fn terminate(&self, grace: Duration) -> ExitStatus {
    if self.terminating.swap(true, Ordering::SeqCst) {
      return self.wait().await;
    }

    let status = self.try_status();
    if !status.is_running() {
      return status;
    }

    self.request_exit();

    match tokio::time::timeout(grace, self.wait()).await {
      Ok(status) => {
        log::info!("MPV exited gracefully ({})", status);
        status
      }
      Err(_) => {
        log::warn!("MPV did not exit within {:?}, force killing", grace);
        self.force_kill();
        self.wait().await
      }
    }
  }

  #[cfg(unix)]
  fn request_exit(&self) {
    if let Some(pid) = self.pid {
      // SAFETY: plain signal delivery to our own child; the wait task has not reaped it yet.
      let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
      if rc != 0 {
        log::debug!(
          "SIGTERM to MPV (pid {}) failed: {}",
          pid,
          std::io::Error::last_os_error()
        );
      }
    }
  }

  #[cfg(not(unix))]
  fn request_exit(&self) {
    // No polite signal here; callers send `quit` over IPC first.
  }

  /// Force kill the process by signalling the wait task.
  pub fn force_kill(&self) {
    if let Some(tx) = self.kill_tx.lock().take() {
      let _ = tx.send(());
    }
  }

  /// Last lines the player wrote to stdout/stderr, oldest first.
  pub fn recent_output(&self) -> Vec<String> {
    self.output.lock().iter().cloned().collect()
  }
}

/// Background task: owns `child`, waits for it to exit, publishes the status.
async fn wait_for_exit(
  mut child: Child,
  kill_rx: oneshot::Receiver<()>,
  status_tx: watch::Sender<ExitStatus>,
) {
  let result = tokio::select! {
    result = child.wait() => result,
    _ = kill_rx => {
      if let Err(e) = child.kill().await {
        log::error!("Failed to kill MPV process: {}", e);
      }
      child.wait().await
    }
  };

  let status = match result {
    Ok(status) => ExitStatus::from(status),
    Err(e) => {
      log::error!("Error waiting for MPV process: {}", e);
      ExitStatus::Terminated
    }
  };
  log::info!("MPV process finished: {}", status);
  status_tx.send_replace(status);
}

async fn capture_output<R: AsyncRead + Unpin>(
  stream: R,
  label: &'static str,
  tail: OutputTail,
  capacity: usize,
) {
  let mut lines = BufReader::new(stream).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => {
        log::debug!(target: "mpv", "{}: {}", label, line);
        if capacity == 0 {
          continue;
        }
        let mut tail = tail.lock();
        if tail.len() == capacity {
          tail.pop_front();
        }
        tail.push_back(line);
      }
      Ok(None) => break,
      Err(e) => {
        log::debug!("MPV {} reader stopped: {}", label, e);
        break;
      }
    }
  }
}
