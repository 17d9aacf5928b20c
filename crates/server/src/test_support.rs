use std::collections::HashSet;
use std::sync::Arc;

use catalog::Catalog;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use tempfile::TempDir;

use crate::config::{ServerConfig, UserAccount};
use crate::jobs::JobQueue;
use crate::settings::SettingsStore;
use crate::state::AppState;

pub const FEED_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Test Cast</title>
    <link>https://testcast.example.com</link>
    <description>Weekly tests</description>
    <itunes:author>Tester</itunes:author>
    <item>
      <title>Two</title>
      <guid>tc-2</guid>
      <pubDate>Tue, 02 Jan 2024 10:00:00 +0000</pubDate>
      <itunes:duration>10:00</itunes:duration>
      <enclosure url="https://cdn.example.com/tc-2.mp3" type="audio/mpeg"/>
    </item>
    <item>
      <title>One</title>
      <guid>tc-1</guid>
      <pubDate>Mon, 01 Jan 2024 10:00:00 +0000</pubDate>
      <itunes:duration>10:00</itunes:duration>
      <enclosure url="https://cdn.example.com/tc-1.mp3" type="audio/mpeg"/>
    </item>
    <item>
      <title>Trailer without guid</title>
    </item>
  </channel>
</rss>"#;

/// App state over a scratch directory. The job queue has no worker, so
/// submitted jobs are dropped.
pub fn test_state() -> (TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        users_root: dir.path().join("users").to_string_lossy().into_owned(),
        external_timeout_secs: 5,
        users: vec![UserAccount {
            id: "bob".to_string(),
            token: "bob-token".to_string(),
            gpodder: None,
        }],
        ..ServerConfig::default()
    };
    let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
    let settings = SettingsStore::new(catalog.db());
    settings.init_tables().unwrap();
    let (jobs, _receiver) = JobQueue::new();
    let state = AppState {
        catalog,
        settings,
        config_path: dir.path().join("config.yaml"),
        config: Arc::new(RwLock::new(config)),
        client: Client::new(),
        jobs,
        downloads: Arc::new(Mutex::new(HashSet::new())),
    };
    (dir, state)
}
