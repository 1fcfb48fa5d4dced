//! Persisted proxy state
//!
//! The orchestrator is the only writer. Each transition method updates the
//! in-memory record; [`ProxyState::save`] persists it so the next run (or
//! `certpilot status`) knows which variant is active.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use certpilot_common::ProxyConfigVariant;

use super::ProxyError;

/// File name under the domain directory
pub const STATE_FILE: &str = "proxy-state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyState {
    /// Variant currently active in the proxy's config file
    pub variant: ProxyConfigVariant,
    /// Supervised process id, when the proxy runs in the foreground
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub last_reload: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ProxyState {
    fn default() -> Self {
        Self {
            variant: ProxyConfigVariant::HttpOnly,
            pid: None,
            running: false,
            last_reload: None,
            updated_at: Utc::now(),
        }
    }
}

impl ProxyState {
    /// Load the state persisted in `dir`, or the default when absent or unreadable
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(STATE_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt proxy state");
                Self::default()
            }
        }
    }

    /// Write the state to `dir` through a temporary file
    pub fn save(&self, dir: &Path) -> Result<(), ProxyError> {
        fs::create_dir_all(dir).map_err(|e| ProxyError::io(dir, e))?;

        let path = dir.join(STATE_FILE);
        let tmp = dir.join(format!("{}.tmp", STATE_FILE));
        let content = serde_json::to_string_pretty(self).map_err(|e| ProxyError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        fs::write(&tmp, content).map_err(|e| ProxyError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| ProxyError::io(&path, e))?;

        trace!(path = %path.display(), variant = %self.variant, running = self.running, "Saved proxy state");
        Ok(())
    }

    pub fn mark_started(&mut self, pid: Option<u32>) {
        self.running = true;
        self.pid = pid;
        self.touch();
    }

    pub fn mark_stopped(&mut self) {
        self.running = false;
        self.pid = None;
        self.touch();
    }

    pub fn mark_variant(&mut self, variant: ProxyConfigVariant) {
        self.variant = variant;
        self.touch();
    }

    pub fn mark_reloaded(&mut self) {
        let now = Utc::now();
        self.last_reload = Some(now);
        self.updated_at = now;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
