//! Chrome headless implementation of the render engine
//!
//! One browser process backs the whole pool; every session is a fresh tab.
//! The CDP handler stream is polled on its own task and its end is reported
//! as [`EngineEvent::Disconnected`].

use crate::{
    create_browser_config, BrowserSettings, CaptureError, EngineEvent, EngineEvents, RenderEngine,
    RenderSession, Viewport,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    MediaFeature, SetDeviceMetricsOverrideParams, SetEmulatedMediaParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Polls of the resource count that must agree before the network counts as quiet
const QUIET_POLLS: usize = 2;
const QUIET_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MAX_QUIET_POLLS: usize = 40;

const RESOURCE_COUNT_SCRIPT: &str = "performance.getEntriesByType('resource').length";

struct ChromeState {
    browser: Browser,
    handler: tokio::task::JoinHandle<()>,
}

pub struct ChromeEngine {
    settings: BrowserSettings,
    state: Mutex<Option<ChromeState>>,
    connected: Arc<AtomicBool>,
    /// Bumped on every launch and deliberate teardown so a stale handler
    /// task never reports a disconnect for a browser we replaced ourselves.
    epoch: Arc<AtomicU64>,
}

impl ChromeEngine {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl RenderEngine for ChromeEngine {
    async fn connect(&self, events: EngineEvents) -> Result<(), CaptureError> {
        let launch_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
        let config = create_browser_config(&self.settings, &launch_id)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CaptureError::Engine(format!("browser launch failed: {e}")))?;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let current_epoch = self.epoch.clone();
        let connected = self.connected.clone();

        // The handler implements Stream and must be polled for CDP traffic to flow
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler error: {}", e);
                }
            }

            if current_epoch.load(Ordering::SeqCst) == epoch {
                connected.store(false, Ordering::SeqCst);
                let _ = events.send(EngineEvent::Disconnected {
                    reason: "CDP handler stream ended".to_string(),
                });
            }
        });

        let previous = self.state.lock().await.replace(ChromeState {
            browser,
            handler: handler_task,
        });
        self.connected.store(true, Ordering::SeqCst);

        if let Some(mut old) = previous {
            let _ = old.browser.close().await;
            old.handler.abort();
        }

        info!(launch_id = %launch_id, "Chrome render engine connected");
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn RenderSession>, CaptureError> {
        let state = self.state.lock().await;
        let state = state
            .as_ref()
            .ok_or_else(|| CaptureError::Engine("browser is not running".to_string()))?;

        let page = state
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::Engine(e.to_string()))?;

        Ok(Box::new(ChromeSession { page }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut state) = self.state.lock().await.take() {
            if let Err(e) = state.browser.close().await {
                warn!("Browser close failed: {}", e);
            }
            state.handler.abort();
            info!("Chrome render engine disconnected");
        }
    }
}

struct ChromeSession {
    page: Page,
}

impl ChromeSession {
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, CaptureError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| CaptureError::Engine(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Chrome has no network-idle lifecycle hook over CDP, so wait until the
    /// page stops issuing new resource requests.
    async fn wait_for_quiet_network(&self) -> Result<(), CaptureError> {
        let mut last = None;
        let mut stable = 0;

        for _ in 0..MAX_QUIET_POLLS {
            let count = self.evaluate(RESOURCE_COUNT_SCRIPT).await?.as_u64();
            if count.is_some() && count == last {
                stable += 1;
                if stable >= QUIET_POLLS {
                    return Ok(());
                }
            } else {
                stable = 0;
                last = count;
            }
            sleep(QUIET_POLL_INTERVAL).await;
        }

        debug!("Network never went quiet, continuing");
        Ok(())
    }
}

#[async_trait]
impl RenderSession for ChromeSession {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), CaptureError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(CaptureError::Engine)?;

        self.page
            .execute(params)
            .await
            .map_err(|e| CaptureError::Engine(e.to_string()))?;
        Ok(())
    }

    async fn emulate_reduced_motion(&self) -> Result<(), CaptureError> {
        let params = SetEmulatedMediaParams {
            media: None,
            features: Some(vec![MediaFeature {
                name: "prefers-reduced-motion".to_string(),
                value: "reduce".to_string(),
            }]),
        };

        self.page
            .execute(params)
            .await
            .map_err(|e| CaptureError::Engine(e.to_string()))?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), CaptureError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| CaptureError::Navigation(e.to_string()))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| CaptureError::Navigation(e.to_string()))?;
        self.wait_for_quiet_network().await
    }

    async fn inject_style(&self, css: &str) -> Result<(), CaptureError> {
        let css = serde_json::to_string(css).map_err(|e| CaptureError::Engine(e.to_string()))?;
        let script = format!(
            "(() => {{ const s = document.createElement('style'); \
             s.setAttribute('data-site-capture', ''); s.textContent = {css}; \
             (document.head || document.documentElement).appendChild(s); }})()"
        );
        self.evaluate(&script).await.map(|_| ())
    }

    async fn run_script(&self, script: &str) -> Result<serde_json::Value, CaptureError> {
        self.evaluate(script).await
    }

    async fn scroll_to(&self, y: u64) -> Result<(), CaptureError> {
        self.evaluate(&format!("window.scrollTo(0, {y})"))
            .await
            .map(|_| ())
    }

    async fn snapshot(&self, full_page: bool) -> Result<Vec<u8>, CaptureError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();

        self.page
            .screenshot(params)
            .await
            .map_err(|e| CaptureError::Snapshot(e.to_string()))
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.page.close().await {
            debug!("Page close failed: {}", e);
        }
    }
}
