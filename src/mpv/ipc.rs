//! Async IPC connection to MPV.
//!
//! Handles platform-specific socket/pipe connections (Named Pipes on Windows,
//! Unix Sockets elsewhere). Each connection runs one reader task, which decodes
//! inbound lines and routes replies to the [`Correlator`] and events to the
//! [`EventDispatcher`], and one writer task draining the outbound queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::correlator::Correlator;
use super::dispatcher::EventDispatcher;
use super::protocol::{self, CodecError, MpvCommand, MpvMessage, MpvReply};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  Connect(String),
  #[error("Not connected")]
  NotConnected,
  #[error("Send failed: {0}")]
  Send(String),
  #[error("Connection lost: {0}")]
  ConnectionLost(String),
  #[error("Request {request_id} timed out after {after:?}")]
  Timeout { request_id: i64, after: Duration },
  #[error("Request ID {0} is already in flight")]
  DuplicateRequestId(i64),
  #[error(transparent)]
  Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Closed,
}

/// Writer channel message.
enum WriteMessage {
  Frame(Vec<u8>),
  Close,
}

/// One established connection. Replaced wholesale on reconnect.
struct Link {
  generation: u64,
  correlator: Correlator,
  write_tx: Sender<WriteMessage>,
  cancel: CancellationToken,
}

/// State shared between the handle and the connection tasks.
struct Shared {
  state: watch::Sender<ConnectionState>,
  link: RwLock<Option<Arc<Link>>>,
  dispatcher: Arc<EventDispatcher>,
  generation: AtomicU64,
}

impl Shared {
  /// Tear down `link` after a read/write failure. Stale links do not touch the state.
  fn link_down(&self, link: &Link, reason: &str) {
    link.cancel.cancel();
    link.correlator.cancel_all(reason);

    let mut current = self.link.write();
    if current.as_ref().map(|l| l.generation) == Some(link.generation) {
      *current = None;
      self.state.send_replace(ConnectionState::Closed);
      log::info!("MPV IPC connection closed: {}", reason);
    }
  }
}

/// Falls back to `Disconnected` if a connect attempt ends (or is dropped) without attaching.
struct ConnectingGuard<'a>(&'a watch::Sender<ConnectionState>);

impl Drop for ConnectingGuard<'_> {
  fn drop(&mut self) {
    self.0.send_if_modified(|state| {
      if *state == ConnectionState::Connecting {
        *state = ConnectionState::Disconnected;
        true
      } else {
        false
      }
    });
  }
}

#[cfg(unix)]
type PlatformStream = tokio::net::UnixStream;
#[cfg(windows)]
type PlatformStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// MPV IPC connection.
pub struct MpvIpc {
  shared: Arc<Shared>,
}

impl MpvIpc {
  pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    Self {
      shared: Arc::new(Shared {
        state,
        link: RwLock::new(None),
        dispatcher,
        generation: AtomicU64::new(0),
      }),
    }
  }

  /// Wrap an already open stream (socket, pipe or in-memory duplex).
  pub fn from_stream<S>(stream: S, dispatcher: Arc<EventDispatcher>) -> Self
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let ipc = Self::new(dispatcher);
    ipc.attach(stream);
    ipc
  }

  /// Connect to the MPV IPC socket/pipe at `path`.
  ///
  /// MPV creates its socket some time after the process starts, so failed
  /// attempts are retried with exponential backoff until `timeout` elapses.
  pub async fn connect(&self, path: &str, timeout: Duration) -> Result<(), IpcError> {
    match self.state() {
      ConnectionState::Connected => return Ok(()),
      ConnectionState::Connecting => {
        return Err(IpcError::Connect("connect already in progress".into()))
      }
      ConnectionState::Disconnected | ConnectionState::Closed => {}
    }
    self.shared.state.send_replace(ConnectionState::Connecting);
    let _connecting = ConnectingGuard(&self.shared.state);

    let deadline = Instant::now() + timeout;
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 0u32;

    loop {
      attempt += 1;
      match Self::try_open(path).await {
        Ok(stream) => {
          log::info!("MPV IPC connected to {} (attempt {})", path, attempt);
          self.attach(stream);
          return Ok(());
        }
        Err(e) => {
          let now = Instant::now();
          if now >= deadline {
            return Err(IpcError::Connect(format!(
              "{}: {} (gave up after {} attempts in {:?})",
              path, e, attempt, timeout
            )));
          }
          log::debug!("IPC connect attempt {} failed: {}", attempt, e);
          tokio::time::sleep(delay.min(deadline - now)).await;
          delay = (delay * 2).min(MAX_BACKOFF);
        }
      }
    }
  }

  #[cfg(unix)]
  async fn try_open(path: &str) -> std::io::Result<PlatformStream> {
    tokio::net::UnixStream::connect(path).await
  }

  #[cfg(windows)]
  async fn try_open(path: &str) -> std::io::Result<PlatformStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
  }

  /// Start the reader and writer tasks on `stream`, replacing any previous connection.
  pub fn attach<S>(&self, stream: S)
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    self.close();

    let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (write_tx, write_rx) = async_channel::unbounded();
    let link = Arc::new(Link {
      generation,
      correlator: Correlator::new(),
      write_tx,
      cancel: CancellationToken::new(),
    });

    // Must be current before the tasks start: link_down ignores other generations.
    *self.shared.link.write() = Some(link.clone());
    self.shared.state.send_replace(ConnectionState::Connected);

    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(Self::reader_loop(reader, self.shared.clone(), link.clone()));
    tokio::spawn(Self::writer_loop(writer, write_rx, self.shared.clone(), link));
  }

  async fn reader_loop<R: AsyncRead + Unpin>(reader: R, shared: Arc<Shared>, link: Arc<Link>) {
    log::debug!("MPV IPC reader loop started (connection #{})", link.generation);
    let mut buf_reader = BufReader::new(reader);
    let mut line = Vec::new();

    let reason = loop {
      line.clear();
      let read = tokio::select! {
        _ = link.cancel.cancelled() => break None,
        read = buf_reader.read_until(b'\n', &mut line) => read,
      };

      match read {
        Ok(0) => break Some("MPV closed the IPC connection".to_string()),
        Ok(_) => Self::route(&shared.dispatcher, &link.correlator, &line),
        Err(e) => break Some(format!("read error: {}", e)),
      }
    };

    if let Some(reason) = reason {
      shared.link_down(&link, &reason);
    }
    log::debug!("MPV IPC reader loop finished (connection #{})", link.generation);
  }

  /// Decode one line and hand it to the correlator or the dispatcher.
  fn route(dispatcher: &EventDispatcher, correlator: &Correlator, line: &[u8]) {
    if line.iter().all(u8::is_ascii_whitespace) {
      return;
    }

    match protocol::decode(line) {
      Ok(MpvMessage::Reply(reply)) => {
        correlator.resolve(reply);
      }
      Ok(MpvMessage::Event(event)) => {
        log::trace!("MPV event {}", event.topic());
        dispatcher.dispatch(&event);
      }
      Err(e) => {
        log::warn!(
          "Skipping malformed MPV message: {} - {}",
          e,
          String::from_utf8_lossy(line).trim()
        );
      }
    }
  }

  async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    write_rx: Receiver<WriteMessage>,
    shared: Arc<Shared>,
    link: Arc<Link>,
  ) {
    while let Ok(msg) = write_rx.recv().await {
      match msg {
        WriteMessage::Frame(data) => {
          let written = async {
            writer.write_all(&data).await?;
            writer.flush().await
          }
          .await;
          if let Err(e) = written {
            log::error!("MPV IPC write error: {}", e);
            shared.link_down(&link, &format!("write error: {}", e));
            return;
          }
        }
        WriteMessage::Close => {
          log::debug!("MPV IPC writer closing");
          break;
        }
      }
    }
    let _ = writer.shutdown().await;
  }

  fn link(&self) -> Result<Arc<Link>, IpcError> {
    self.shared.link.read().clone().ok_or(IpcError::NotConnected)
  }

  /// Queue one framed message for the writer task.
  pub async fn send(&self, frame: Vec<u8>) -> Result<(), IpcError> {
    let link = self.link()?;
    link
      .write_tx
      .send(WriteMessage::Frame(frame))
      .await
      .map_err(|_| IpcError::Send("writer task has stopped".into()))
  }

  /// Send a command and wait for its reply.
  ///
  /// A request ID is assigned unless the command pins one. With a `deadline`,
  /// the call fails with [`IpcError::Timeout`] and a late reply is discarded.
  pub async fn submit(
    &self,
    command: MpvCommand,
    deadline: Option<Duration>,
  ) -> Result<MpvReply, IpcError> {
    let link = self.link()?;
    let pending = link.correlator.register(command.name(), command.request_id)?;
    let request_id = pending.request_id();
    let command = command.with_request_id(request_id);

    let frame = match protocol::encode(&command) {
      Ok(frame) => frame,
      Err(e) => {
        link.correlator.forget(request_id);
        return Err(e.into());
      }
    };
    log::debug!(
      "Sending MPV command: {}",
      String::from_utf8_lossy(&frame).trim_end()
    );

    if link.write_tx.send(WriteMessage::Frame(frame)).await.is_err() {
      link.correlator.forget(request_id);
      return Err(IpcError::Send("writer task has stopped".into()));
    }

    link.correlator.wait(pending, deadline).await
  }

  pub fn state(&self) -> ConnectionState {
    *self.shared.state.borrow()
  }

  pub fn is_connected(&self) -> bool {
    self.state() == ConnectionState::Connected
  }

  /// Resolves once the connection reaches `Closed`.
  pub async fn closed(&self) {
    let mut state = self.shared.state.subscribe();
    let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
  }

  /// Requests awaiting a reply on the current connection.
  pub fn pending_count(&self) -> usize {
    self
      .shared
      .link
      .read()
      .as_ref()
      .map_or(0, |link| link.correlator.pending_count())
  }

  /// Close the connection, failing every pending request. Idempotent.
  pub fn close(&self) {
    let Some(link) = self.shared.link.write().take() else {
      return;
    };
    log::info!("Closing MPV IPC connection #{}", link.generation);
    let _ = link.write_tx.try_send(WriteMessage::Close);
    link.cancel.cancel();
    link.correlator.cancel_all("connection closed");
    self.shared.state.send_replace(ConnectionState::Closed);
  }
}

impl Drop for MpvIpc {
  fn drop(&mut self) {
    self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mpv::protocol::{decode_command, MpvEvent, Topic};
  use parking_lot::Mutex;
  use serde_json::{json, Value};
  use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};
  use tokio::sync::mpsc;

  struct FakePlayer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
  }

  impl FakePlayer {
    async fn next_command(&mut self) -> MpvCommand {
      let line = self.lines.next_line().await.unwrap().expect("client hung up");
      decode_command(line.as_bytes()).unwrap()
    }

    async fn write_line(&mut self, line: &str) {
      self.writer.write_all(line.as_bytes()).await.unwrap();
      self.writer.write_all(b"\n").await.unwrap();
    }

    async fn reply(&mut self, reply: MpvReply) {
      self.write_line(&serde_json::to_string(&reply).unwrap()).await;
    }

    async fn emit(&mut self, event: MpvEvent) {
      self.write_line(&serde_json::to_string(&event).unwrap()).await;
    }
  }

  fn connected() -> (Arc<MpvIpc>, Arc<EventDispatcher>, FakePlayer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let dispatcher = Arc::new(EventDispatcher::new());
    let ipc = Arc::new(MpvIpc::from_stream(client, dispatcher.clone()));
    let (read, writer) = tokio::io::split(server);
    let player = FakePlayer {
      lines: BufReader::new(read).lines(),
      writer,
    };
    (ipc, dispatcher, player)
  }

  #[tokio::test]
  async fn test_replies_reach_callers_in_emission_order() {
    let (ipc, _dispatcher, mut player) = connected();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    for command in [
      MpvCommand::new(vec!["loadfile".into(), "/tmp/a.mp4".into()]).with_request_id(1),
      MpvCommand::new(vec!["get_property".into(), "pause".into()]).with_request_id(2),
    ] {
      let ipc = ipc.clone();
      let done_tx = done_tx.clone();
      tokio::spawn(async move {
        let reply = ipc.submit(command, None).await.unwrap();
        done_tx.send(reply).unwrap();
      });
    }

    let mut seen = vec![player.next_command().await, player.next_command().await];
    seen.sort_by_key(|c| c.request_id);
    assert_eq!(seen[0].name(), "loadfile");
    assert_eq!(seen[1].name(), "get_property");

    player.reply(MpvReply::success(2, Some(json!(false)))).await;
    let first = done_rx.recv().await.unwrap();
    assert_eq!(first.request_id, 2);
    assert_eq!(first.data, Some(json!(false)));

    player.reply(MpvReply::success(1, None)).await;
    let second = done_rx.recv().await.unwrap();
    assert_eq!(second.request_id, 1);
    assert_eq!(second.data, None);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_commands_get_their_own_reply() {
    let (ipc, _dispatcher, mut player) = connected();
    let names: Vec<String> = (0..20).map(|i| format!("prop-{}", i)).collect();

    let mut callers = Vec::new();
    for name in &names {
      let ipc = ipc.clone();
      let name = name.clone();
      callers.push(tokio::spawn(async move {
        let reply = ipc
          .submit(MpvCommand::get_property(&name), Some(Duration::from_secs(5)))
          .await
          .unwrap();
        (name, reply.data)
      }));
    }

    let mut received = Vec::new();
    for _ in 0..names.len() {
      received.push(player.next_command().await);
    }
    // Answer in reverse arrival order, echoing the property name back.
    for command in received.iter().rev() {
      let id = command.request_id.unwrap();
      player
        .reply(MpvReply::success(id, Some(command.command[1].clone())))
        .await;
    }

    for caller in callers {
      let (name, data) = caller.await.unwrap();
      assert_eq!(data, Some(Value::String(name)));
    }
    assert_eq!(ipc.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_malformed_line_does_not_stop_reader() {
    let (ipc, _dispatcher, mut player) = connected();

    let first = {
      let ipc = ipc.clone();
      tokio::spawn(async move { ipc.submit(MpvCommand::get_property("pause"), None).await })
    };
    let a = player.next_command().await.request_id.unwrap();
    let second = {
      let ipc = ipc.clone();
      tokio::spawn(async move { ipc.submit(MpvCommand::get_property("volume"), None).await })
    };
    let b = player.next_command().await.request_id.unwrap();

    player.reply(MpvReply::success(a, Some(json!(true)))).await;
    player.write_line("{\"request_id\": oops").await;
    player.write_line("").await;
    player.reply(MpvReply::success(b, Some(json!(80.0)))).await;

    assert_eq!(first.await.unwrap().unwrap().data, Some(json!(true)));
    assert_eq!(second.await.unwrap().unwrap().data, Some(json!(80.0)));
    assert!(ipc.is_connected());
  }

  #[tokio::test]
  async fn test_events_route_to_dispatcher_in_order() {
    let (ipc, dispatcher, mut player) = connected();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    dispatcher.register(Topic::property("time-pos"), move |event| {
      sink.lock().push(event.value().as_f64().unwrap());
    });
    let (_handle, done) = dispatcher.subscribe(Topic::event("seek"));

    for value in [1.0, 2.0, 3.0] {
      player.emit(MpvEvent::property_change(1, "time-pos", json!(value))).await;
    }
    player.emit(MpvEvent::named("seek")).await;
    done.recv().await.unwrap();

    assert_eq!(*seen.lock(), vec![1.0, 2.0, 3.0]);
    assert!(ipc.is_connected());
  }

  #[tokio::test]
  async fn test_timeout_and_late_reply_dropped() {
    let (ipc, _dispatcher, mut player) = connected();

    let started = Instant::now();
    let waiter = {
      let ipc = ipc.clone();
      tokio::spawn(async move {
        ipc
          .submit(MpvCommand::get_property("time-pos"), Some(Duration::from_millis(50)))
          .await
      })
    };
    let late_id = player.next_command().await.request_id.unwrap();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(IpcError::Timeout { request_id, .. }) if request_id == late_id));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2));

    player.reply(MpvReply::success(late_id, Some(json!(9.0)))).await;

    // The connection keeps working after the stray reply.
    let next = {
      let ipc = ipc.clone();
      tokio::spawn(async move { ipc.submit(MpvCommand::get_property("pause"), None).await })
    };
    let id = player.next_command().await.request_id.unwrap();
    assert_ne!(id, late_id);
    player.reply(MpvReply::success(id, Some(json!(true)))).await;
    assert_eq!(next.await.unwrap().unwrap().data, Some(json!(true)));
  }

  #[tokio::test]
  async fn test_eof_cancels_pending_requests() {
    let (ipc, _dispatcher, mut player) = connected();

    let waiter = {
      let ipc = ipc.clone();
      tokio::spawn(async move { ipc.submit(MpvCommand::get_property("pause"), None).await })
    };
    player.next_command().await;
    drop(player);

    match tokio::time::timeout(Duration::from_secs(2), waiter).await {
      Ok(Ok(Err(IpcError::ConnectionLost(_)))) => {}
      other => panic!("Expected ConnectionLost, got {:?}", other),
    }
    ipc.closed().await;
    assert_eq!(ipc.state(), ConnectionState::Closed);
    assert!(matches!(
      ipc.submit(MpvCommand::quit(), None).await,
      Err(IpcError::NotConnected)
    ));
  }

  #[tokio::test]
  async fn test_close_is_idempotent_and_fails_waiters() {
    let (ipc, _dispatcher, mut player) = connected();
    let waiter = {
      let ipc = ipc.clone();
      tokio::spawn(async move { ipc.submit(MpvCommand::get_property("pause"), None).await })
    };
    player.next_command().await;

    ipc.close();
    ipc.close();
    assert!(matches!(
      waiter.await.unwrap(),
      Err(IpcError::ConnectionLost(_))
    ));
    assert_eq!(ipc.state(), ConnectionState::Closed);
  }

  #[tokio::test]
  async fn test_unencodable_command_is_not_sent() {
    let (ipc, _dispatcher, _player) = connected();
    let bad = MpvCommand::new(vec!["loadfile".into(), json!({"path": "/tmp/a"})]);
    assert!(matches!(
      ipc.submit(bad, None).await,
      Err(IpcError::Codec(CodecError::Encoding(_)))
    ));
    assert_eq!(ipc.pending_count(), 0);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_connect_waits_for_socket_to_appear() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let bind_path = path.clone();

    let server = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(200)).await;
      let listener = tokio::net::UnixListener::bind(&bind_path).unwrap();
      let (stream, _) = listener.accept().await.unwrap();
      stream
    });

    let ipc = MpvIpc::new(Arc::new(EventDispatcher::new()));
    ipc
      .connect(path.to_str().unwrap(), Duration::from_secs(3))
      .await
      .unwrap();
    assert!(ipc.is_connected());
    let _stream = server.await.unwrap();
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_connect_gives_up_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.sock");

    let ipc = MpvIpc::new(Arc::new(EventDispatcher::new()));
    let started = Instant::now();
    let result = ipc
      .connect(path.to_str().unwrap(), Duration::from_millis(150))
      .await;
    assert!(matches!(result, Err(IpcError::Connect(_))));
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(ipc.state(), ConnectionState::Disconnected);
  }
}
