//! Control an external MPV player over its JSON IPC channel.
//!
//! [`MpvPlayer`] spawns MPV embedded into a native window, connects to its IPC
//! socket and exposes playback commands plus property and input observers.

pub mod command;
pub mod config;
pub mod mpv;

pub use command::{format_position, PlayerControl, PlayerSnapshot};
pub use config::{ConfigError, PlayerConfig};
pub use mpv::{
  ExitStatus, MpvEvent, MpvPlayer, ObserverHandle, PlayerError, PlayerState, PropertyValue,
  SeekMode, StepDirection, Topic, WindowHandle,
};
