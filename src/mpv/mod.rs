//! MPV IPC module - spawns and controls an external MPV player via JSON IPC.
//!
//! Architecture:
//! - `protocol.rs` - JSON command/reply/event types and line framing
//! - `ipc.rs` - Async IPC connection (Named Pipes on Windows, Unix Sockets elsewhere)
//! - `correlator.rs` - Matches replies to the commands that caused them
//! - `dispatcher.rs` - Routes unsolicited events to registered observers
//! - `process.rs` - MPV binary detection, spawning and supervision
//! - `client.rs` - High-level player with lifecycle and command methods

mod client;
mod correlator;
mod dispatcher;
mod ipc;
mod process;
mod protocol;

pub use client::{LoadStep, MpvPlayer, PlayerError, PlayerState, MIN_SPEED};
pub use correlator::{Correlator, PendingReply, ReplyResult};
pub use dispatcher::{Callback, EventDispatcher, ObserverHandle};
pub use ipc::{ConnectionState, IpcError, MpvIpc};
pub use process::{
  build_args, cleanup_socket, default_socket_path, find_mpv, ExitStatus, LaunchOptions,
  MpvProcess, ProcessError, WindowHandle,
};
pub use protocol::{
  decode, decode_command, encode, CodecError, MpvCommand, MpvEvent, MpvMessage, MpvReply,
  PropertyValue, SeekMode, StepDirection, Topic, INPUT_MESSAGE,
};
