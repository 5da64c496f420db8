//! Render engine capability
//!
//! The capture protocol only ever talks to these traits. `ChromeEngine` is the
//! production implementation; tests drive the pool and capture worker with a
//! scripted engine instead.

use crate::{CaptureError, Viewport};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Notifications the engine pushes to whoever owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The underlying browser went away; every open session is dead.
    Disconnected { reason: String },
}

pub type EngineEvents = mpsc::UnboundedSender<EngineEvent>;

#[async_trait]
pub trait RenderEngine: Send + Sync + 'static {
    /// Start (or restart) the engine. Disconnects are reported on `events`.
    async fn connect(&self, events: EngineEvents) -> Result<(), CaptureError>;

    async fn open_session(&self) -> Result<Box<dyn RenderSession>, CaptureError>;

    fn is_connected(&self) -> bool;

    /// Tear the engine down, closing every session it still has open.
    async fn disconnect(&self);
}

/// One isolated page used for a single navigate and capture cycle.
#[async_trait]
pub trait RenderSession: Send + Sync {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), CaptureError>;

    /// Advertise `prefers-reduced-motion: reduce` to the page.
    async fn emulate_reduced_motion(&self) -> Result<(), CaptureError>;

    /// Load `url` and wait until the page has settled.
    async fn navigate(&self, url: &str) -> Result<(), CaptureError>;

    async fn inject_style(&self, css: &str) -> Result<(), CaptureError>;

    async fn run_script(&self, script: &str) -> Result<serde_json::Value, CaptureError>;

    async fn scroll_to(&self, y: u64) -> Result<(), CaptureError>;

    /// PNG bytes of the viewport, or of the whole document when `full_page`.
    async fn snapshot(&self, full_page: bool) -> Result<Vec<u8>, CaptureError>;

    async fn close(self: Box<Self>);
}
