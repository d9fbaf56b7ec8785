use serde::{Deserialize, Serialize};

/// Descriptive metadata about a device, shared with realm peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub os: String,
    pub device: String,
    pub browser: String,
    /// Whether the app runs as an installed application rather than ad hoc.
    pub installed: bool,
}

impl DeviceMeta {
    /// Metadata for the running process.
    pub fn detect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            device: std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            browser: format!("skypod/{}", env!("CARGO_PKG_VERSION")),
            installed: true,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = browser.into();
        self
    }
}
