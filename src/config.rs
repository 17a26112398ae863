use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::sync::notify::DEFAULT_PREVIEW_CHARS;

pub const DEFAULT_CONFIG_PATH: &str = "config/clinic_sync.json";

/// Overrides the file's `notification_url`.
pub const ENV_NOTIFICATION_URL: &str = "CLINIC_SYNC_NOTIFICATION_URL";
/// Comma-separated broker multiaddrs, replacing `bootstrap_nodes`.
pub const ENV_BOOTSTRAP_NODES: &str = "CLINIC_SYNC_BOOTSTRAP_NODES";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Broker peers as `/ip4/.../tcp/.../p2p/<PeerId>`.
    pub bootstrap_nodes: Vec<String>,
    pub listen_addr: String,
    pub key_path: String,
    pub store_path: String,
    /// Push endpoint. Without one, notifications are only logged.
    pub notification_url: Option<String>,
    pub preview_chars: usize,
    pub queue_topics: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            listen_addr: "/ip4/0.0.0.0/tcp/0".to_string(),
            key_path: "data/channel_key.pk".to_string(),
            store_path: "data/rooms.db".to_string(),
            notification_url: None,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            queue_topics: vec!["queue-state".to_string()],
        }
    }
}

impl AppConfig {
    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_NOTIFICATION_URL) {
            let url = url.trim();
            self.notification_url = (!url.is_empty()).then(|| url.to_string());
        }
        if let Some(nodes) = lookup(ENV_BOOTSTRAP_NODES) {
            self.bootstrap_nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Drop blank or repeated topics and reset an unusable preview length.
    fn sanitize(&mut self) {
        if self.preview_chars == 0 {
            log::warn!("preview_chars must be positive; using {DEFAULT_PREVIEW_CHARS}");
            self.preview_chars = DEFAULT_PREVIEW_CHARS;
        }
        let mut kept: Vec<String> = Vec::with_capacity(self.queue_topics.len());
        for topic in self.queue_topics.drain(..) {
            let topic = topic.trim().to_string();
            if topic.is_empty() || kept.contains(&topic) {
                continue;
            }
            kept.push(topic);
        }
        self.queue_topics = kept;
    }
}

/// Read `path`, falling back to defaults when it is missing or malformed,
/// then layer environment overrides on top.
pub fn load_config(path: &str) -> AppConfig {
    let mut config = read_config(Path::new(path)).unwrap_or_default();
    config.apply_overrides(|key| std::env::var(key).ok());
    config.sanitize();
    config
}

fn read_config(path: &Path) -> Option<AppConfig> {
    let content = fs::read_to_string(path)
        .inspect_err(|err| {
            log::info!("Config file {} not found ({err}); using defaults", path.display())
        })
        .ok()?;
    serde_json::from_str(&content)
        .inspect_err(|err| log::warn!("Failed to parse config file {}: {err}", path.display()))
        .ok()
}

pub fn save_config(path: &str, config: &AppConfig) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)
}
