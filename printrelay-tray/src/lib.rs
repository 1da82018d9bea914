//! Interactive host: the agent runs on a background runtime while a
//! notification-area icon mirrors listener status.

use std::{
    io,
    net::SocketAddr,
    process::{Command, Stdio},
    sync::mpsc,
};

use printrelay_agent::{
    PrintAgent,
    host::{ExecutionHost, HostError},
    serve,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use url::Url;

pub const APP_NAME: &str = "PrintRelay";
/// Notification-area tooltips hold at most 127 characters.
pub const MAX_TOOLTIP_CHARS: usize = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrayStatus {
    Starting,
    Listening(SocketAddr),
    Failed(String),
}

impl TrayStatus {
    pub fn tooltip(&self) -> String {
        let text = match self {
            TrayStatus::Starting => format!("{APP_NAME} | starting"),
            TrayStatus::Listening(addr) => {
                format!("{APP_NAME} | listening on port {}", addr.port())
            }
            TrayStatus::Failed(reason) => format!("{APP_NAME} | {reason}"),
        };
        text.chars().take(MAX_TOOLTIP_CHARS).collect()
    }

    pub fn color(&self) -> [u8; 3] {
        match self {
            TrayStatus::Starting => [0xF5, 0xA6, 0x23],
            TrayStatus::Listening(_) => [0x2E, 0xA0, 0x43],
            TrayStatus::Failed(_) => [0xD7, 0x3A, 0x49],
        }
    }

    /// Square RGBA image of a filled status disc on a transparent background.
    pub fn icon_rgba(&self, size: u32) -> Vec<u8> {
        let [r, g, b] = self.color();
        let center = (size as f32 - 1.0) / 2.0;
        let radius = size as f32 / 2.0 - 1.0;

        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let dx = x as f32 - center;
                let dy = y as f32 - center;
                if dx * dx + dy * dy <= radius * radius {
                    pixels.extend_from_slice(&[r, g, b, 0xFF]);
                } else {
                    pixels.extend_from_slice(&[0, 0, 0, 0]);
                }
            }
        }
        pixels
    }
}

/// Updates sent from the agent runtime to the UI thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrayEvent {
    ListenerReady(SocketAddr),
    ListenerFailed(String),
}

impl TrayEvent {
    pub fn status(&self) -> TrayStatus {
        match self {
            TrayEvent::ListenerReady(addr) => TrayStatus::Listening(*addr),
            TrayEvent::ListenerFailed(reason) => TrayStatus::Failed(reason.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrayError {
    #[error("invalid tray icon: {0}")]
    Icon(String),
    #[error("failed to create tray icon: {0}")]
    Create(String),
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Browser-facing address of the listener. Wildcard binds map to `localhost`.
pub fn local_url(addr: SocketAddr) -> Result<Url, url::ParseError> {
    if addr.ip().is_unspecified() {
        Url::parse(&format!("http://localhost:{}/", addr.port()))
    } else {
        Url::parse(&format!("http://{addr}/"))
    }
}

pub fn browser_command(url: &Url) -> Command {
    let mut command = if cfg!(target_os = "windows") {
        let mut command = Command::new("rundll32");
        command.arg("url.dll,FileProtocolHandler");
        command
    } else if cfg!(target_os = "macos") {
        Command::new("open")
    } else {
        Command::new("xdg-open")
    };
    command.arg(url.as_str());
    command
}

pub fn open_in_browser(url: &Url) -> io::Result<()> {
    info!("opening {} in the default browser", url);
    browser_command(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(drop)
}

/// Runs the agent until the tray asks it to quit.
///
/// A bind failure is pushed to the tray as [`TrayEvent::ListenerFailed`] and the
/// host idles until quit, so the icon can keep showing the error.
pub struct TrayHost {
    events: mpsc::Sender<TrayEvent>,
    quit: oneshot::Receiver<()>,
}

impl TrayHost {
    pub fn new(events: mpsc::Sender<TrayEvent>, quit: oneshot::Receiver<()>) -> Self {
        Self { events, quit }
    }
}

impl ExecutionHost for TrayHost {
    async fn run(self, agent: PrintAgent) -> Result<(), HostError> {
        let Self { events, quit } = self;

        let listener = match agent.start_listener().await {
            Ok(listener) => listener,
            Err(err) => {
                error!("{}; tray stays up without a listener", err);
                let _ = events.send(TrayEvent::ListenerFailed(err.to_string()));
                let _ = quit.await;
                return Ok(());
            }
        };

        match listener.local_addr() {
            Ok(addr) => {
                let _ = events.send(TrayEvent::ListenerReady(addr));
            }
            Err(err) => warn!("listener address unavailable: {}", err),
        }

        serve(listener, agent.router(), async move {
            let _ = quit.await;
        })
        .await
    }
}
