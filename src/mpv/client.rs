//! High-level MPV player: lifecycle, commands and observers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{EventDispatcher, ObserverHandle};
use super::ipc::{IpcError, MpvIpc};
use super::process::{
  cleanup_socket, default_socket_path, find_mpv, ExitStatus, MpvProcess, ProcessError,
  WindowHandle,
};
use super::protocol::{MpvCommand, MpvEvent, MpvReply, PropertyValue, SeekMode, StepDirection, Topic};
use crate::command::PlayerSnapshot;
use crate::config::PlayerConfig;

/// Lowest playback speed reachable through [`MpvPlayer::adjust_speed`].
pub const MIN_SPEED: f64 = 0.1;

/// Player lifecycle. `Closed` and `Crashed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
  Uninitialized,
  Launching,
  AwaitingSocket,
  Ready,
  Closed,
  Crashed,
}

impl PlayerState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, PlayerState::Closed | PlayerState::Crashed)
  }
}

impl fmt::Display for PlayerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PlayerState::Uninitialized => "uninitialized",
      PlayerState::Launching => "launching",
      PlayerState::AwaitingSocket => "awaiting socket",
      PlayerState::Ready => "ready",
      PlayerState::Closed => "closed",
      PlayerState::Crashed => "crashed",
    };
    f.write_str(name)
  }
}

/// Stage of [`MpvPlayer::load`] that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
  Open,
  Pause,
  Rewind,
}

impl fmt::Display for LoadStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LoadStep::Open => f.write_str("open"),
      LoadStep::Pause => f.write_str("pause"),
      LoadStep::Rewind => f.write_str("reset position"),
    }
  }
}

#[derive(Error, Debug)]
pub enum PlayerError {
  #[error("Player is not ready ({0})")]
  NotReady(PlayerState),
  #[error("Player was already launched ({0})")]
  AlreadyLaunched(PlayerState),
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("MPV command {command} failed: {error}")]
  CommandFailed { command: String, error: String },
  #[error("Loading {path} failed at step '{step}': {source}")]
  Load {
    path: String,
    step: LoadStep,
    #[source]
    source: Box<PlayerError>,
  },
  #[error("MPV exited during startup ({0})")]
  ExitedDuringStartup(ExitStatus),
  #[error("No {event} event within {after:?}")]
  EventTimeout { event: String, after: Duration },
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),
  #[error("Property {0} is unavailable")]
  Unavailable(String),
}

/// One `observe_property` registration on the player side, shared by every local observer.
struct ObservedProperty {
  observer_id: i64,
  handles: Vec<u64>,
}

enum Reconnect {
  Restored,
  Failed,
  ProcessExited(ExitStatus),
}

/// What the monitor does once the IPC connection drops.
#[derive(Debug, PartialEq)]
enum ConnectionLost {
  /// The process already exited; report that instead of a plain close.
  Exited(ExitStatus),
  Reconnect,
  Finish,
}

fn on_connection_lost(status: Option<ExitStatus>, reconnected: bool) -> ConnectionLost {
  match status {
    Some(status) if !status.is_running() => ConnectionLost::Exited(status),
    Some(_) if !reconnected => ConnectionLost::Reconnect,
    _ => ConnectionLost::Finish,
  }
}

struct PlayerInner {
  config: PlayerConfig,
  socket_path: String,
  dispatcher: Arc<EventDispatcher>,
  ipc: MpvIpc,
  state: watch::Sender<PlayerState>,
  process: Mutex<Option<Arc<MpvProcess>>>,
  observed: Mutex<HashMap<String, ObservedProperty>>,
  bound_keys: Mutex<HashSet<String>>,
  /// Serializes observe/unobserve so the player-side registration matches the local count.
  observe_lock: tokio::sync::Mutex<()>,
  next_observer_id: AtomicI64,
  shutdown: CancellationToken,
  shutting_down: AtomicBool,
}

impl PlayerInner {
  /// Move to `to` unless the lifecycle already ended.
  fn transition(&self, to: PlayerState) -> bool {
    self.state.send_if_modified(|state| {
      if state.is_terminal() || *state == to {
        return false;
      }
      log::info!("Player state: {} -> {}", state, to);
      *state = to;
      true
    })
  }

  fn current_process(&self) -> Option<Arc<MpvProcess>> {
    self.process.lock().clone()
  }

  fn process_exited(&self, status: ExitStatus, process: &MpvProcess) {
    if status.is_clean() {
      log::info!("MPV exited ({})", status);
      self.transition(PlayerState::Closed);
    } else {
      log::error!("MPV crashed ({})", status);
      for line in process.recent_output() {
        log::error!(target: "mpv", "{}", line);
      }
      self.transition(PlayerState::Crashed);
    }
    self.ipc.close();
    cleanup_socket(&self.socket_path);
  }

  /// Connection dropped for good: close and stop the player.
  async fn finish(&self) {
    self.transition(PlayerState::Closed);
    self.ipc.close();
    if let Some(process) = self.current_process() {
      process.terminate(self.config.shutdown_grace()).await;
      cleanup_socket(&self.socket_path);
    }
  }

  async fn reconnect(&self, process: &MpvProcess) -> Reconnect {
    log::warn!("MPV IPC connection lost, reconnecting to {}", self.socket_path);
    let connected = tokio::select! {
      result = self.ipc.connect(&self.socket_path, self.config.connect_timeout()) => result,
      status = process.wait() => return Reconnect::ProcessExited(status),
    };
    if let Err(e) = connected {
      log::error!("Reconnect failed: {}", e);
      return Reconnect::Failed;
    }

    let observed: Vec<(String, i64)> = self
      .observed
      .lock()
      .iter()
      .map(|(name, entry)| (name.clone(), entry.observer_id))
      .collect();
    let keys: Vec<String> = self.bound_keys.lock().iter().cloned().collect();
    let deadline = Some(self.config.request_timeout());

    for (name, observer_id) in observed {
      if let Err(e) = self
        .ipc
        .submit(MpvCommand::observe_property(observer_id, &name), deadline)
        .await
      {
        log::warn!("Failed to restore observer for {}: {}", name, e);
      }
    }
    for key in keys {
      if let Err(e) = self.ipc.submit(MpvCommand::keybind(&key), deadline).await {
        log::warn!("Failed to restore key binding {}: {}", key, e);
      }
    }
    log::info!("MPV IPC connection restored");
    Reconnect::Restored
  }

  /// Watches the process and the connection until the lifecycle ends.
  async fn monitor(self: Arc<Self>) {
    let process = self.current_process();
    let mut reconnected = false;

    loop {
      tokio::select! {
        biased;
        _ = self.shutdown.cancelled() => return,
        status = wait_process(process.as_deref()) => {
          if let Some(process) = &process {
            self.process_exited(status, process);
          }
          return;
        }
        _ = self.ipc.closed() => {
          if self.shutdown.is_cancelled() {
            return;
          }
          let status = process.as_ref().map(|p| p.try_status());
          match (process.as_deref(), on_connection_lost(status, reconnected)) {
            (Some(p), ConnectionLost::Exited(status)) => {
              self.process_exited(status, p);
              return;
            }
            (Some(p), ConnectionLost::Reconnect) => {
              reconnected = true;
              match self.reconnect(p).await {
                Reconnect::Restored => continue,
                Reconnect::ProcessExited(status) => {
                  self.process_exited(status, p);
                  return;
                }
                Reconnect::Failed => {}
              }
            }
            _ => {}
          }
          self.finish().await;
          return;
        }
      }
    }
  }
}

async fn wait_process(process: Option<&MpvProcess>) -> ExitStatus {
  match process {
    Some(process) => process.wait().await,
    None => std::future::pending().await,
  }
}

fn round_speed(speed: f64) -> f64 {
  (speed * 1000.0).round() / 1000.0
}

/// Handle to one MPV instance. Clones share the same player.
///
/// Call [`MpvPlayer::shutdown`] when done; dropping the handle leaves the process running.
#[derive(Clone)]
pub struct MpvPlayer {
  inner: Arc<PlayerInner>,
}

impl MpvPlayer {
  pub fn new(config: PlayerConfig) -> Self {
    let socket_path = config.socket_path.clone().unwrap_or_else(default_socket_path);
    let dispatcher = Arc::new(EventDispatcher::new());
    let (state, _) = watch::channel(PlayerState::Uninitialized);

    Self {
      inner: Arc::new(PlayerInner {
        config,
        socket_path,
        ipc: MpvIpc::new(dispatcher.clone()),
        dispatcher,
        state,
        process: Mutex::new(None),
        observed: Mutex::new(HashMap::new()),
        bound_keys: Mutex::new(HashSet::new()),
        observe_lock: tokio::sync::Mutex::new(()),
        next_observer_id: AtomicI64::new(1),
        shutdown: CancellationToken::new(),
        shutting_down: AtomicBool::new(false),
      }),
    }
  }

  /// Drive a player that is already listening on `stream`, without spawning a process.
  ///
  /// The player starts `Ready`; losing the stream closes it.
  pub fn with_stream<S>(stream: S, config: PlayerConfig) -> Self
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let player = Self::new(config);
    player.inner.ipc.attach(stream);
    player.inner.state.send_replace(PlayerState::Ready);
    tokio::spawn(player.inner.clone().monitor());
    player
  }

  /// Spawn MPV (embedded into `window` when given) and connect to its IPC socket.
  pub async fn launch(&self, window: Option<WindowHandle>) -> Result<(), PlayerError> {
    let mut current = PlayerState::Uninitialized;
    let started = self.inner.state.send_if_modified(|state| {
      current = *state;
      if *state == PlayerState::Uninitialized {
        *state = PlayerState::Launching;
        true
      } else {
        false
      }
    });
    if !started {
      return Err(PlayerError::AlreadyLaunched(current));
    }

    match self.start_process(window).await {
      Ok(()) => {
        if !self.inner.transition(PlayerState::Ready) {
          return Err(PlayerError::NotReady(self.state()));
        }
        tokio::spawn(self.inner.clone().monitor());
        Ok(())
      }
      Err(e) => {
        log::error!("MPV launch failed: {}", e);
        if let Some(process) = self.inner.current_process() {
          for line in process.recent_output() {
            log::error!(target: "mpv", "{}", line);
          }
          process.terminate(self.inner.config.shutdown_grace()).await;
        }
        cleanup_socket(&self.inner.socket_path);
        let crashed = matches!(&e, PlayerError::ExitedDuringStartup(status) if !status.is_clean());
        self.inner.transition(if crashed {
          PlayerState::Crashed
        } else {
          PlayerState::Closed
        });
        Err(e)
      }
    }
  }

  async fn start_process(&self, window: Option<WindowHandle>) -> Result<(), PlayerError> {
    let config = &self.inner.config;
    let executable = config
      .mpv_path
      .clone()
      .or_else(find_mpv)
      .ok_or(ProcessError::NotFound)?;

    cleanup_socket(&self.inner.socket_path);
    let process = Arc::new(MpvProcess::spawn(
      &executable,
      window,
      &self.inner.socket_path,
      &config.launch_options(),
    )?);
    *self.inner.process.lock() = Some(process.clone());
    self.inner.transition(PlayerState::AwaitingSocket);

    tokio::select! {
      connected = self.inner.ipc.connect(&self.inner.socket_path, config.connect_timeout()) => {
        connected?;
        Ok(())
      }
      status = process.wait() => Err(PlayerError::ExitedDuringStartup(status)),
    }
  }

  pub fn state(&self) -> PlayerState {
    *self.inner.state.borrow()
  }

  /// Receiver that sees every lifecycle transition.
  pub fn watch_state(&self) -> watch::Receiver<PlayerState> {
    self.inner.state.subscribe()
  }

  pub fn socket_path(&self) -> &str {
    &self.inner.socket_path
  }

  /// Exit status of the player process, once it has exited.
  pub fn exit_status(&self) -> Option<ExitStatus> {
    self
      .inner
      .current_process()
      .map(|process| process.try_status())
      .filter(|status| !status.is_running())
  }

  /// Wait until the lifecycle ends; returns the process exit status if a process was spawned.
  pub async fn wait_for_exit(&self) -> Option<ExitStatus> {
    let mut state = self.watch_state();
    let _ = state.wait_for(PlayerState::is_terminal).await;
    match self.inner.current_process() {
      Some(process) => Some(process.wait().await),
      None => None,
    }
  }

  /// Last lines MPV wrote to stdout/stderr.
  pub fn recent_output(&self) -> Vec<String> {
    self
      .inner
      .current_process()
      .map(|process| process.recent_output())
      .unwrap_or_default()
  }

  fn ensure_ready(&self) -> Result<(), PlayerError> {
    match self.state() {
      PlayerState::Ready => Ok(()),
      state => Err(PlayerError::NotReady(state)),
    }
  }

  /// Send a command to MPV.
  async fn send(&self, command: MpvCommand) -> Result<MpvReply, PlayerError> {
    self.ensure_ready()?;
    let name = command.name().to_string();
    let reply = self
      .inner
      .ipc
      .submit(command, Some(self.inner.config.request_timeout()))
      .await?;

    if !reply.is_success() {
      return Err(PlayerError::CommandFailed {
        command: name,
        error: reply.error,
      });
    }
    Ok(reply)
  }

  /// Load a file, then pause it at the start.
  ///
  /// Each step waits for the previous one; the error names the step that failed.
  pub async fn load(&self, path: &str) -> Result<(), PlayerError> {
    self.ensure_ready()?;
    log::info!("Loading file: {}", path);
    let failed = |step: LoadStep| {
      move |e: PlayerError| PlayerError::Load {
        path: path.to_string(),
        step,
        source: Box::new(e),
      }
    };

    // Subscribe first: file-loaded can arrive before the loadfile reply is read.
    let (loaded_handle, loaded) = self.inner.dispatcher.subscribe(Topic::event("file-loaded"));
    let (ended_handle, ended) = self.inner.dispatcher.subscribe(Topic::event("end-file"));
    let opened: Result<(), PlayerError> = async {
      self.send(MpvCommand::loadfile(path)).await?;
      self.wait_until_loaded(&loaded, &ended).await
    }
    .await;
    self.inner.dispatcher.unregister(&loaded_handle);
    self.inner.dispatcher.unregister(&ended_handle);
    opened.map_err(failed(LoadStep::Open))?;

    self
      .send(MpvCommand::set_pause(true))
      .await
      .map_err(failed(LoadStep::Pause))?;
    self
      .send(MpvCommand::set_property("time-pos", 0.0.into()))
      .await
      .map_err(failed(LoadStep::Rewind))?;
    Ok(())
  }

  async fn wait_until_loaded(
    &self,
    loaded: &Receiver<MpvEvent>,
    ended: &Receiver<MpvEvent>,
  ) -> Result<(), PlayerError> {
    let gone = || PlayerError::Ipc(IpcError::ConnectionLost("player shut down".into()));
    let wait = async {
      loop {
        tokio::select! {
          event = loaded.recv() => return event.map(|_| ()).map_err(|_| gone()),
          event = ended.recv() => match event {
            Err(_) => return Err(gone()),
            Ok(event) if event.reason.as_deref() == Some("error") => {
              let error = event
                .extra
                .get("file_error")
                .and_then(Value::as_str)
                .unwrap_or("error")
                .to_string();
              return Err(PlayerError::CommandFailed {
                command: "loadfile".into(),
                error,
              });
            }
            // Ending of the previously playing file.
            Ok(_) => {}
          },
          _ = self.inner.ipc.closed() => {
            return Err(PlayerError::Ipc(IpcError::ConnectionLost(
              "connection closed while loading".into(),
            )));
          }
        }
      }
    };

    let after = self.inner.config.request_timeout();
    tokio::time::timeout(after, wait)
      .await
      .map_err(|_| PlayerError::EventTimeout {
        event: "file-loaded".into(),
        after,
      })?
  }

  pub async fn play(&self) -> Result<(), PlayerError> {
    self.send(MpvCommand::set_pause(false)).await?;
    Ok(())
  }

  pub async fn pause(&self) -> Result<(), PlayerError> {
    self.send(MpvCommand::set_pause(true)).await?;
    Ok(())
  }

  pub async fn toggle_pause(&self) -> Result<(), PlayerError> {
    self.send(MpvCommand::cycle("pause")).await?;
    Ok(())
  }

  /// Stop playback; MPV stays up in idle mode.
  pub async fn stop(&self) -> Result<(), PlayerError> {
    self.send(MpvCommand::stop()).await?;
    Ok(())
  }

  pub async fn seek(&self, position: f64, mode: SeekMode) -> Result<(), PlayerError> {
    if !position.is_finite() {
      return Err(PlayerError::InvalidArgument(format!(
        "seek position {}",
        position
      )));
    }
    self.send(MpvCommand::seek(position, mode)).await?;
    Ok(())
  }

  /// Seek to `fraction` (0.0 to 1.0) of the current file's duration.
  pub async fn seek_fraction(&self, fraction: f64) -> Result<(), PlayerError> {
    if !(0.0..=1.0).contains(&fraction) {
      return Err(PlayerError::InvalidArgument(format!(
        "seek fraction {} outside 0..=1",
        fraction
      )));
    }
    let duration = self
      .get_number("duration")
      .await?
      .ok_or_else(|| PlayerError::Unavailable("duration".into()))?;
    self.seek(duration * fraction, SeekMode::Absolute).await
  }

  pub async fn step_frame(&self, direction: StepDirection) -> Result<(), PlayerError> {
    self.send(MpvCommand::frame_step(direction)).await?;
    Ok(())
  }

  pub async fn get_property(&self, name: &str) -> Result<PropertyValue, PlayerError> {
    match self.send(MpvCommand::get_property(name)).await {
      Ok(reply) => Ok(reply.data.map(PropertyValue::from).unwrap_or(PropertyValue::Null)),
      Err(PlayerError::CommandFailed { error, .. }) if error == "property unavailable" => {
        Err(PlayerError::Unavailable(name.to_string()))
      }
      Err(e) => Err(e),
    }
  }

  /// Numeric property, `None` while MPV reports it unavailable (e.g. no file loaded).
  pub async fn get_number(&self, name: &str) -> Result<Option<f64>, PlayerError> {
    match self.get_property(name).await {
      Ok(value) => Ok(value.as_f64()),
      Err(PlayerError::Unavailable(_)) => Ok(None),
      Err(e) => Err(e),
    }
  }

  pub async fn set_property(&self, name: &str, value: Value) -> Result<(), PlayerError> {
    self.send(MpvCommand::set_property(name, value)).await?;
    Ok(())
  }

  pub async fn set_speed(&self, speed: f64) -> Result<(), PlayerError> {
    if !speed.is_finite() || speed <= 0.0 {
      return Err(PlayerError::InvalidArgument(format!("speed {}", speed)));
    }
    self.set_property("speed", speed.into()).await
  }

  /// Change speed by `delta`, clamped to [`MIN_SPEED`]. Returns the new speed.
  pub async fn adjust_speed(&self, delta: f64) -> Result<f64, PlayerError> {
    let current = self.get_number("speed").await?.unwrap_or(1.0);
    let speed = round_speed((current + delta).max(MIN_SPEED));
    self.set_speed(speed).await?;
    Ok(speed)
  }

  pub async fn set_volume(&self, volume: f64) -> Result<(), PlayerError> {
    if !volume.is_finite() || volume < 0.0 {
      return Err(PlayerError::InvalidArgument(format!("volume {}", volume)));
    }
    self.set_property("volume", volume.into()).await
  }

  /// Current playback state in one call.
  pub async fn snapshot(&self) -> Result<PlayerSnapshot, PlayerError> {
    PlayerSnapshot::capture(self).await
  }

  /// Send a raw command and return its data.
  pub async fn command(&self, args: Vec<Value>) -> Result<Option<Value>, PlayerError> {
    Ok(self.send(MpvCommand::new(args)).await?.data)
  }

  /// Call `callback` with every new value of `name`.
  ///
  /// The first observer of a property starts MPV's `observe_property`; MPV then
  /// reports the current value right away.
  pub async fn observe_property<F>(&self, name: &str, callback: F) -> Result<ObserverHandle, PlayerError>
  where
    F: Fn(&PropertyValue) + Send + Sync + 'static,
  {
    self
      .observe_with(name, || {
        self
          .inner
          .dispatcher
          .register(Topic::property(name), move |event| callback(&event.value()))
      })
      .await
  }

  /// Like [`MpvPlayer::observe_property`], delivering `property-change` events through a channel.
  pub async fn subscribe_property(
    &self,
    name: &str,
  ) -> Result<(ObserverHandle, Receiver<MpvEvent>), PlayerError> {
    let mut receiver = None;
    let handle = self
      .observe_with(name, || {
        let (handle, rx) = self.inner.dispatcher.subscribe(Topic::property(name));
        receiver = Some(rx);
        handle
      })
      .await?;
    match receiver {
      Some(rx) => Ok((handle, rx)),
      None => Err(PlayerError::NotReady(self.state())),
    }
  }

  async fn observe_with<R>(&self, name: &str, register: R) -> Result<ObserverHandle, PlayerError>
  where
    R: FnOnce() -> ObserverHandle,
  {
    self.ensure_ready()?;
    let _guard = self.inner.observe_lock.lock().await;
    let handle = register();

    let new_observer = {
      let mut observed = self.inner.observed.lock();
      match observed.get_mut(name) {
        Some(entry) => {
          entry.handles.push(handle.id());
          None
        }
        None => {
          let observer_id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
          observed.insert(
            name.to_string(),
            ObservedProperty {
              observer_id,
              handles: vec![handle.id()],
            },
          );
          Some(observer_id)
        }
      }
    };

    if let Some(observer_id) = new_observer {
      log::debug!("Observing {} as #{}", name, observer_id);
      if let Err(e) = self.send(MpvCommand::observe_property(observer_id, name)).await {
        self.inner.dispatcher.unregister(&handle);
        self.inner.observed.lock().remove(name);
        return Err(e);
      }
    }
    Ok(handle)
  }

  /// Call `callback` whenever `key` (e.g. `MBTN_LEFT`, `MBTN_LEFT_DBL`, `Ctrl+s`) is pressed
  /// in the player window.
  pub async fn on_input_event<F>(&self, key: &str, callback: F) -> Result<ObserverHandle, PlayerError>
  where
    F: Fn(&MpvEvent) + Send + Sync + 'static,
  {
    self.ensure_ready()?;
    let _guard = self.inner.observe_lock.lock().await;
    let handle = self.inner.dispatcher.register(Topic::input(key), callback);

    let first_binding = self.inner.bound_keys.lock().insert(key.to_string());
    if first_binding {
      log::debug!("Binding key {}", key);
      if let Err(e) = self.send(MpvCommand::keybind(key)).await {
        self.inner.dispatcher.unregister(&handle);
        self.inner.bound_keys.lock().remove(key);
        return Err(e);
      }
    }
    Ok(handle)
  }

  /// Call `callback` for a raw player event such as `file-loaded`, `end-file` or `idle`.
  pub fn on_event<F>(&self, event: &str, callback: F) -> ObserverHandle
  where
    F: Fn(&MpvEvent) + Send + Sync + 'static,
  {
    self.inner.dispatcher.register(Topic::event(event), callback)
  }

  /// Channel of events for `topic`. Property topics are only fed while observed.
  pub fn subscribe(&self, topic: Topic) -> (ObserverHandle, Receiver<MpvEvent>) {
    self.inner.dispatcher.subscribe(topic)
  }

  /// Remove an observer. The last observer of a property stops MPV's observation.
  ///
  /// Returns false if the handle was already removed.
  pub async fn unobserve(&self, handle: &ObserverHandle) -> Result<bool, PlayerError> {
    let _guard = self.inner.observe_lock.lock().await;
    if !self.inner.dispatcher.unregister(handle) {
      return Ok(false);
    }

    let Topic::Property(name) = handle.topic() else {
      return Ok(true);
    };
    let last = {
      let mut observed = self.inner.observed.lock();
      match observed.get_mut(name) {
        Some(entry) => {
          entry.handles.retain(|id| *id != handle.id());
          if entry.handles.is_empty() {
            observed.remove(name).map(|entry| entry.observer_id)
          } else {
            None
          }
        }
        None => None,
      }
    };

    if let Some(observer_id) = last {
      log::debug!("No observers left for {}, unobserving #{}", name, observer_id);
      if self.state() == PlayerState::Ready {
        self.send(MpvCommand::unobserve_property(observer_id)).await?;
      }
    }
    Ok(true)
  }

  /// Quit MPV and release everything. Safe to call more than once.
  pub async fn shutdown(&self) {
    let inner = &self.inner;
    if inner.shutting_down.swap(true, Ordering::SeqCst) {
      let mut state = self.watch_state();
      let _ = state.wait_for(PlayerState::is_terminal).await;
      return;
    }
    log::info!("Shutting down MPV player ({})", self.state());
    inner.shutdown.cancel();

    if inner.ipc.is_connected() {
      let deadline = inner.config.request_timeout().min(inner.config.shutdown_grace());
      if let Err(e) = inner.ipc.submit(MpvCommand::quit(), Some(deadline)).await {
        log::debug!("quit: {}", e);
      }
    }
    inner.ipc.close();

    if let Some(process) = inner.current_process() {
      let status = process.terminate(inner.config.shutdown_grace()).await;
      log::info!("MPV stopped ({})", status);
      cleanup_socket(&inner.socket_path);
    }

    inner.dispatcher.clear();
    inner.observed.lock().clear();
    inner.bound_keys.lock().clear();
    inner.transition(PlayerState::Closed);
  }
}
