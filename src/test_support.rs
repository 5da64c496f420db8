//! In-process render engine for tests
//!
//! Behaves like a browser from the pool's and capture worker's point of view:
//! every session call is recorded, navigation can be made to fail or stall per
//! URL, and a disconnect can be injected at any time.

use crate::{CaptureError, EngineEvent, EngineEvents, RenderEngine, RenderSession, Viewport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct EngineState {
    pub connected: AtomicBool,
    pub connects: AtomicUsize,
    /// Upcoming `connect` calls that should fail
    pub failing_connects: AtomicUsize,
    pub fail_open: AtomicBool,
    /// Snapshots come back as bytes no image decoder accepts
    pub corrupt_snapshots: AtomicBool,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    /// `document.documentElement.scrollHeight` reported to the capture worker
    pub page_height: AtomicU64,
    pub calls: Mutex<Vec<String>>,
    failing_urls: Mutex<HashSet<String>>,
    slow_urls: Mutex<HashMap<String, Duration>>,
    panicking_urls: Mutex<HashSet<String>>,
    events: Mutex<Option<EngineEvents>>,
}

#[derive(Clone)]
pub struct ScriptedEngine {
    state: Arc<EngineState>,
}

impl Deref for ScriptedEngine {
    type Target = EngineState;

    fn deref(&self) -> &EngineState {
        &self.state
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState {
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                failing_connects: AtomicUsize::new(0),
                fail_open: AtomicBool::new(false),
                corrupt_snapshots: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
                page_height: AtomicU64::new(1080),
                calls: Mutex::new(Vec::new()),
                failing_urls: Mutex::new(HashSet::new()),
                slow_urls: Mutex::new(HashMap::new()),
                panicking_urls: Mutex::new(HashSet::new()),
                events: Mutex::new(None),
            }),
        }
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn slow_url(&self, url: &str, delay: Duration) {
        self.slow_urls.lock().unwrap().insert(url.to_string(), delay);
    }

    /// Navigating to `url` panics the calling task.
    pub fn panic_on(&self, url: &str) {
        self.panicking_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn max_live_sessions(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Drop the "browser" the way a crashed process would.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(EngineEvent::Disconnected {
                reason: "simulated crash".to_string(),
            });
        }
    }
}

#[async_trait]
impl RenderEngine for ScriptedEngine {
    async fn connect(&self, events: EngineEvents) -> Result<(), CaptureError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(CaptureError::Engine("launch refused".to_string()));
        }
        *self.events.lock().unwrap() = Some(events);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn RenderSession>, CaptureError> {
        if !self.is_connected() {
            return Err(CaptureError::Engine("not connected".to_string()));
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CaptureError::Engine("tab refused".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            state: self.state.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

struct ScriptedSession {
    state: Arc<EngineState>,
}

impl ScriptedSession {
    fn record(&self, call: String) {
        self.state.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RenderSession for ScriptedSession {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), CaptureError> {
        self.record(format!("viewport {}x{}", viewport.width, viewport.height));
        Ok(())
    }

    async fn emulate_reduced_motion(&self) -> Result<(), CaptureError> {
        self.record("reduced_motion".to_string());
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), CaptureError> {
        self.record(format!("navigate {url}"));
        let delay = self.state.slow_urls.lock().unwrap().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.panicking_urls.lock().unwrap().contains(url) {
            panic!("scripted panic while loading {url}");
        }
        if self.state.failing_urls.lock().unwrap().contains(url) {
            return Err(CaptureError::Navigation(format!("net::ERR_FAILED {url}")));
        }
        Ok(())
    }

    async fn inject_style(&self, _css: &str) -> Result<(), CaptureError> {
        self.record("inject_style".to_string());
        Ok(())
    }

    async fn run_script(&self, script: &str) -> Result<serde_json::Value, CaptureError> {
        if script.contains("scrollHeight") {
            return Ok(serde_json::json!(self.state.page_height.load(Ordering::SeqCst)));
        }
        Ok(serde_json::Value::Null)
    }

    async fn scroll_to(&self, y: u64) -> Result<(), CaptureError> {
        self.record(format!("scroll {y}"));
        Ok(())
    }

    async fn snapshot(&self, full_page: bool) -> Result<Vec<u8>, CaptureError> {
        self.record(format!("snapshot full_page={full_page}"));
        if self.state.corrupt_snapshots.load(Ordering::SeqCst) {
            return Ok(b"not an image".to_vec());
        }
        Ok(tiny_png())
    }

    async fn close(self: Box<Self>) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A valid 4x4 PNG so re-encoding paths see real image data.
pub fn tiny_png() -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(4, 4, image::Rgba([200, 40, 40, 255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageOutputFormat::Png,
        )
        .unwrap();
    bytes
}
