//! Player controls and state snapshot, as driven by a button bar or a text console.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mpv::{MpvPlayer, PlayerError, StepDirection};

/// Frame rate assumed when the file does not report one.
pub const DEFAULT_FPS: f64 = 25.0;

/// Speed change per Slower/Faster press.
pub const SPEED_STEP: f64 = 0.1;

/// Position label: seconds with millisecond precision and the 1-based frame number.
///
/// `format_position(12.345, 25.0)` is `"12.345 frame: 310"`.
pub fn format_position(time_pos: f64, fps: f64) -> String {
  format!("{:.3} frame: {}", time_pos, (time_pos * fps).round() as i64 + 1)
}

/// `video-pan-x`/`video-pan-y` that bring the clicked point to the center.
///
/// `pointer` and `frame` are in window pixels (`mouse-pos`, `osd-width`/`osd-height`),
/// `video` is the source size (`width`/`height`). The video is letterboxed to keep
/// its aspect ratio, so clicks on the black bars give None.
pub fn pan_to_pointer(pointer: (f64, f64), frame: (f64, f64), video: (f64, f64)) -> Option<(f64, f64)> {
  let ((x, y), (fw, fh), (vw, vh)) = (pointer, frame, video);
  if fw <= 0.0 || fh <= 0.0 || vw <= 0.0 || vh <= 0.0 {
    return None;
  }

  let (px, py) = if fw * vh >= vw * fh {
    // Bars left and right.
    let shown = vw * fh / vh;
    let px = x - (fw - shown) / 2.0;
    if !(0.0..shown).contains(&px) {
      return None;
    }
    ((px / shown * vw).round(), (y / fh * vh).round())
  } else {
    // Bars top and bottom.
    let shown = vh * fw / vw;
    let py = y - (fh - shown) / 2.0;
    if !(0.0..shown).contains(&py) {
      return None;
    }
    ((x / fw * vw).round(), (py / shown * vh).round())
  };
  Some((0.5 - px / vw, 0.5 - py / vh))
}

/// Player state returned in one piece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
  pub paused: bool,
  /// None while no file is loaded.
  pub time_pos: Option<f64>,
  pub duration: Option<f64>,
  pub volume: f64,
  pub speed: f64,
  pub fps: Option<f64>,
}

impl Default for PlayerSnapshot {
  fn default() -> Self {
    Self {
      paused: true,
      time_pos: None,
      duration: None,
      volume: 100.0,
      speed: 1.0,
      fps: None,
    }
  }
}

impl PlayerSnapshot {
  /// Query the current state. Properties MPV reports as unavailable keep their defaults.
  pub async fn capture(player: &MpvPlayer) -> Result<Self, PlayerError> {
    let defaults = Self::default();

    let paused = match player.get_property("pause").await {
      Ok(value) => value.as_bool().unwrap_or(defaults.paused),
      Err(PlayerError::Unavailable(_)) => defaults.paused,
      Err(e) => return Err(e),
    };

    Ok(Self {
      paused,
      time_pos: player.get_number("time-pos").await?,
      duration: player.get_number("duration").await?,
      volume: player.get_number("volume").await?.unwrap_or(defaults.volume),
      speed: player.get_number("speed").await?.unwrap_or(defaults.speed),
      fps: player.get_number("container-fps").await?,
    })
  }

  pub fn position_label(&self) -> String {
    match self.time_pos {
      Some(time_pos) => format_position(time_pos, self.fps.unwrap_or(DEFAULT_FPS)),
      None => "-".to_string(),
    }
  }
}

impl fmt::Display for PlayerSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let duration = self
      .duration
      .map_or_else(|| "-".to_string(), |d| format!("{:.3}", d));
    write!(
      f,
      "{} position={} duration={} volume={} speed={}",
      if self.paused { "paused" } else { "playing" },
      self.position_label(),
      duration,
      self.volume,
      self.speed
    )
  }
}

/// One button-bar action.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerControl {
  Load(String),
  Play,
  Pause,
  TogglePause,
  Stop,
  FrameForward,
  FrameBackward,
  Slower,
  Faster,
  /// Slider position, 0.0 to 1.0 of the duration.
  Seek(f64),
  Volume(f64),
  /// Report the position label.
  Position,
  /// Report the whole snapshot.
  Info,
}

impl PlayerControl {
  /// Parse a console line such as `load /tmp/a.mp4`, `seek 0.5` or `next`.
  pub fn parse(line: &str) -> Result<Self, PlayerError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
      Some((word, rest)) => (word, rest.trim()),
      None => (line, ""),
    };

    let number = |what: &str| {
      rest
        .parse::<f64>()
        .map_err(|_| PlayerError::InvalidArgument(format!("{} needs a number, got '{}'", what, rest)))
    };

    let control = match word.to_ascii_lowercase().as_str() {
      "load" | "open" if !rest.is_empty() => PlayerControl::Load(rest.to_string()),
      "load" | "open" => return Err(PlayerError::InvalidArgument("load needs a path".into())),
      "play" => PlayerControl::Play,
      "pause" => PlayerControl::Pause,
      "toggle" | "p" => PlayerControl::TogglePause,
      "stop" => PlayerControl::Stop,
      "next" | "step" => PlayerControl::FrameForward,
      "prev" | "back" => PlayerControl::FrameBackward,
      "slower" | "-" => PlayerControl::Slower,
      "faster" | "+" => PlayerControl::Faster,
      "seek" => PlayerControl::Seek(number("seek")?),
      "volume" | "vol" => PlayerControl::Volume(number("volume")?),
      "pos" | "position" => PlayerControl::Position,
      "info" => PlayerControl::Info,
      "" => return Err(PlayerError::InvalidArgument("empty command".into())),
      other => {
        return Err(PlayerError::InvalidArgument(format!(
          "unknown command '{}'",
          other
        )))
      }
    };
    Ok(control)
  }

  /// Run the action. Returns text to show for actions that report something.
  pub async fn apply(&self, player: &MpvPlayer) -> Result<Option<String>, PlayerError> {
    match self {
      PlayerControl::Load(path) => player.load(path).await?,
      PlayerControl::Play => player.play().await?,
      PlayerControl::Pause => player.pause().await?,
      PlayerControl::TogglePause => player.toggle_pause().await?,
      PlayerControl::Stop => player.stop().await?,
      PlayerControl::FrameForward => player.step_frame(StepDirection::Forward).await?,
      PlayerControl::FrameBackward => player.step_frame(StepDirection::Backward).await?,
      PlayerControl::Slower => {
        let speed = player.adjust_speed(-SPEED_STEP).await?;
        return Ok(Some(format!("speed {}", speed)));
      }
      PlayerControl::Faster => {
        let speed = player.adjust_speed(SPEED_STEP).await?;
        return Ok(Some(format!("speed {}", speed)));
      }
      PlayerControl::Seek(fraction) => player.seek_fraction(*fraction).await?,
      PlayerControl::Volume(volume) => player.set_volume(*volume).await?,
      PlayerControl::Position => return Ok(Some(player.snapshot().await?.position_label())),
      PlayerControl::Info => return Ok(Some(player.snapshot().await?.to_string())),
    }
    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_format_position() {
    assert_eq!(format_position(12.345, 25.0), "12.345 frame: 310");
    assert_eq!(format_position(0.0, 25.0), "0.000 frame: 1");
    assert_eq!(format_position(1.0, 30.0), "1.000 frame: 31");
  }

  #[test]
  fn test_pan_to_pointer_maps_through_letterbox() {
    // 16:9 video in a 4:3 frame: bars top and bottom, 75px each.
    assert_eq!(
      pan_to_pointer((400.0, 300.0), (800.0, 600.0), (1920.0, 1080.0)),
      Some((0.0, 0.0))
    );
    assert_eq!(
      pan_to_pointer((200.0, 75.0), (800.0, 600.0), (1920.0, 1080.0)),
      Some((0.25, 0.5))
    );
    assert_eq!(pan_to_pointer((400.0, 50.0), (800.0, 600.0), (1920.0, 1080.0)), None);

    // 4:3 video in a 16:9 frame: bars left and right, 120px each.
    assert_eq!(
      pan_to_pointer((120.0, 270.0), (960.0, 540.0), (640.0, 480.0)),
      Some((0.5, 0.0))
    );
    assert_eq!(pan_to_pointer((900.0, 270.0), (960.0, 540.0), (640.0, 480.0)), None);

    assert_eq!(pan_to_pointer((1.0, 1.0), (0.0, 600.0), (1920.0, 1080.0)), None);
  }

  #[test]
  fn test_position_label_falls_back() {
    let idle = PlayerSnapshot::default();
    assert_eq!(idle.position_label(), "-");

    let playing = PlayerSnapshot {
      time_pos: Some(2.0),
      ..PlayerSnapshot::default()
    };
    assert_eq!(playing.position_label(), "2.000 frame: 51");

    let with_fps = PlayerSnapshot {
      fps: Some(50.0),
      ..playing
    };
    assert_eq!(with_fps.position_label(), "2.000 frame: 101");
  }

  #[test]
  fn test_snapshot_display() {
    let snapshot = PlayerSnapshot {
      paused: false,
      time_pos: Some(1.5),
      duration: Some(60.0),
      volume: 80.0,
      speed: 1.25,
      fps: None,
    };
    assert_eq!(
      snapshot.to_string(),
      "playing position=1.500 frame: 39 duration=60.000 volume=80 speed=1.25"
    );
  }

  #[test]
  fn test_parse_controls() {
    assert_eq!(
      PlayerControl::parse("load /tmp/my clip.mp4").unwrap(),
      PlayerControl::Load("/tmp/my clip.mp4".into())
    );
    assert_eq!(PlayerControl::parse("  PLAY ").unwrap(), PlayerControl::Play);
    assert_eq!(PlayerControl::parse("p").unwrap(), PlayerControl::TogglePause);
    assert_eq!(PlayerControl::parse("next").unwrap(), PlayerControl::FrameForward);
    assert_eq!(PlayerControl::parse("back").unwrap(), PlayerControl::FrameBackward);
    assert_eq!(PlayerControl::parse("+").unwrap(), PlayerControl::Faster);
    assert_eq!(PlayerControl::parse("seek 0.25").unwrap(), PlayerControl::Seek(0.25));
    assert_eq!(PlayerControl::parse("vol 40").unwrap(), PlayerControl::Volume(40.0));
    assert_eq!(PlayerControl::parse("info").unwrap(), PlayerControl::Info);
  }

  #[test]
  fn test_parse_rejects_bad_input() {
    for line in ["", "load", "seek", "seek half", "rewind"] {
      assert!(
        matches!(PlayerControl::parse(line), Err(PlayerError::InvalidArgument(_))),
        "{:?} should be rejected",
        line
      );
    }
  }
}
