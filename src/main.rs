use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};

use mpvbridge::command::{pan_to_pointer, DEFAULT_FPS};
use mpvbridge::{format_position, MpvPlayer, PlayerConfig, PlayerControl, PlayerState, WindowHandle};

/// Drive an MPV player over JSON IPC.
///
/// Controls are read from stdin, one per line: load PATH, play, pause, p, stop,
/// next, back, slower, faster, seek FRACTION, volume N, pos, info, quit.
#[derive(Parser, Debug)]
#[command(name = "mpvbridge", version)]
struct Cli {
  /// Media file or URL to load once the player is ready.
  media: Option<String>,

  /// Native window ID to embed the video into.
  #[arg(long)]
  wid: Option<u64>,

  /// IPC socket (or named pipe) path.
  #[arg(long)]
  socket: Option<String>,

  /// MPV executable.
  #[arg(long)]
  mpv: Option<PathBuf>,

  /// Config file (JSON).
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Debug logging.
  #[arg(short, long)]
  verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  let level = if cli.verbose { "debug" } else { "info" };
  env_logger::init_from_env(Env::default().default_filter_or(level));

  let code = run(cli).await?;
  if code != 0 {
    std::process::exit(code);
  }
  Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
  let mut config = PlayerConfig::load(cli.config.as_deref()).context("Failed to load config")?;
  if let Some(mpv) = cli.mpv {
    config.mpv_path = Some(mpv);
  }
  if let Some(socket) = cli.socket {
    config.socket_path = Some(socket);
  }
  config.validate()?;

  let player = MpvPlayer::new(config);
  player
    .launch(cli.wid.map(WindowHandle))
    .await
    .context("Failed to start MPV")?;

  if let Err(e) = install_observers(&player).await {
    player.shutdown().await;
    return Err(e);
  }

  if let Some(media) = &cli.media {
    if let Err(e) = player.load(media).await {
      log::error!("{}", e);
    }
  }

  let mut stdin = BufReader::new(tokio::io::stdin()).lines();
  let mut stdin_open = true;
  loop {
    tokio::select! {
      line = stdin.next_line(), if stdin_open => match line {
        Ok(Some(line)) => {
          let line = line.trim();
          if line.is_empty() {
            continue;
          }
          if line == "quit" || line == "q" {
            break;
          }
          match PlayerControl::parse(line) {
            Ok(control) => match control.apply(&player).await {
              Ok(Some(output)) => println!("{}", output),
              Ok(None) => {}
              Err(e) => log::error!("{}", e),
            },
            Err(e) => log::warn!("{}", e),
          }
        }
        Ok(None) => stdin_open = false,
        Err(e) => {
          log::warn!("stdin: {}", e);
          stdin_open = false;
        }
      },
      _ = tokio::signal::ctrl_c() => {
        log::info!("Interrupted");
        break;
      }
      status = player.wait_for_exit() => {
        log::info!("Player finished ({})", player.state());
        if player.state() == PlayerState::Crashed {
          return Ok(status.and_then(|s| s.code()).filter(|c| *c != 0).unwrap_or(1));
        }
        return Ok(0);
      }
    }
  }

  player.shutdown().await;
  Ok(0)
}

/// Position label on every `time-pos` change, plus mouse handling in the video area.
async fn install_observers(player: &MpvPlayer) -> anyhow::Result<()> {
  let fps = Arc::new(Mutex::new(DEFAULT_FPS));

  let fps_sink = fps.clone();
  player
    .observe_property("container-fps", move |value| {
      if let Some(rate) = value.as_f64().filter(|r| *r > 0.0) {
        *fps_sink.lock() = rate;
      }
    })
    .await?;

  player
    .observe_property("time-pos", move |value| {
      if let Some(time_pos) = value.as_f64() {
        log::info!(target: "position", "{}", format_position(time_pos, *fps.lock()));
      }
    })
    .await?;

  let clicked = player.clone();
  player
    .on_input_event("MBTN_LEFT", move |_| {
      let player = clicked.clone();
      tokio::spawn(async move {
        if let Err(e) = center_on_pointer(&player).await {
          log::warn!("Pan failed: {}", e);
        }
      });
    })
    .await?;

  let clicked = player.clone();
  player
    .on_input_event("MBTN_RIGHT", move |_| {
      let player = clicked.clone();
      tokio::spawn(async move {
        for property in ["video-pan-x", "video-pan-y", "video-zoom"] {
          if let Err(e) = player.set_property(property, 0.0.into()).await {
            log::warn!("Pan reset failed: {}", e);
          }
        }
      });
    })
    .await?;

  player
    .on_input_event("MBTN_LEFT_DBL", |_| log::info!("Double click"))
    .await?;

  Ok(())
}

/// Pan the video so the clicked point moves to the center, at 2x zoom.
async fn center_on_pointer(player: &MpvPlayer) -> anyhow::Result<()> {
  let pointer = match player.get_property("mouse-pos").await? {
    mpvbridge::PropertyValue::Json(pointer) => pointer,
    other => anyhow::bail!("unexpected mouse-pos value: {}", other),
  };
  let x = pointer.get("x").and_then(|v| v.as_f64());
  let y = pointer.get("y").and_then(|v| v.as_f64());
  let frame = (
    player.get_number("osd-width").await?,
    player.get_number("osd-height").await?,
  );
  let video = (
    player.get_number("width").await?,
    player.get_number("height").await?,
  );

  let (Some(x), Some(y), (Some(fw), Some(fh)), (Some(vw), Some(vh))) = (x, y, frame, video) else {
    return Ok(());
  };
  log::info!("Click at {}x{} of {}x{} (video {}x{})", x, y, fw, fh, vw, vh);
  let Some((pan_x, pan_y)) = pan_to_pointer((x, y), (fw, fh), (vw, vh)) else {
    log::debug!("Click outside the video area");
    return Ok(());
  };

  player.set_property("video-pan-x", pan_x.into()).await?;
  player.set_property("video-pan-y", pan_y.into()).await?;
  player.set_property("video-zoom", 1.0.into()).await?;
  Ok(())
}
