//! Town settings: queue limits, patrol cadences, parked rigs, store roster.
//!
//! Settings live in one JSON document under the town root and are re-read at
//! the top of each cycle that needs them, so an operator edit takes effect on
//! the next cadence without restarting the daemon. Durations are stored as
//! humantime strings (`"30s"`, `"15m"`); an unparseable string falls back to
//! the patrol's default rather than wedging the scheduler.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::RigName;

/// Errors loading town settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("town settings {path} not readable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("town settings {path} malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("writing town settings {path}: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Path helpers rooted at the town directory.
pub fn settings_path(town_root: &Path) -> PathBuf {
    town_root.join(".gastown").join("town.json")
}

pub fn queue_state_path(town_root: &Path) -> PathBuf {
    town_root.join(".gastown").join("queue-state.json")
}

pub fn routing_path(town_root: &Path) -> PathBuf {
    town_root.join(".gastown").join("routing.jsonl")
}

pub fn feed_path(town_root: &Path) -> PathBuf {
    town_root.join(".gastown").join("feed.jsonl")
}

/// Work queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    /// Master switch for the queue-dispatch patrol.
    pub enabled: bool,
    /// Town-wide ceiling on simultaneous workers.
    pub max_concurrent: usize,
    /// Maximum dispatches per cycle.
    pub batch_size: usize,
    /// Pause between successive dispatches, to avoid store write contention.
    pub spawn_delay: String,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        WorkQueueConfig {
            enabled: true,
            max_concurrent: 6,
            batch_size: 3,
            spawn_delay: "5s".to_string(),
        }
    }
}

impl WorkQueueConfig {
    /// Zero is a valid spawn delay (no pause between dispatches); only an
    /// unparseable string falls back to the default.
    pub fn spawn_delay(&self) -> Duration {
        match humantime::parse_duration(&self.spawn_delay) {
            Ok(d) => d,
            Err(e) => {
                warn!(value = %self.spawn_delay, error = %e,
                    "unparseable queue.spawn_delay, using default");
                Duration::from_secs(5)
            }
        }
    }
}

/// Configuration for a single patrol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolConfig {
    /// `None` means enabled; patrols are opt-out.
    pub enabled: Option<bool>,
    /// Cadence as a humantime string; `None` means the patrol default.
    pub interval: Option<String>,
}

impl PatrolConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn interval_or(&self, default: Duration, slug: &str) -> Duration {
        match &self.interval {
            Some(s) => parse_duration_or(s, default, slug),
            None => default,
        }
    }
}

/// Per-patrol settings, keyed by slug.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolSettings {
    pub event_poll: PatrolConfig,
    pub stranded_scan: PatrolConfig,
    pub queue_dispatch: PatrolConfig,
    pub wisp_reaper: PatrolConfig,
    pub dolt_backup: PatrolConfig,
    pub janitor_dog: PatrolConfig,
}

/// Wisp reaper tuning, beyond the shared patrol fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Wisps older than this are closed.
    pub max_age: String,
    /// Closed wisps older than this are deleted.
    pub delete_age: String,
    /// Issues untouched for this long are auto-closed.
    pub stale_issue_age: String,
    /// Databases to reap; empty means the configured store roster.
    pub databases: Vec<String>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            max_age: "24h".to_string(),
            delete_age: "7d".to_string(),
            stale_issue_age: "30d".to_string(),
            databases: Vec::new(),
        }
    }
}

impl ReaperConfig {
    pub fn max_age(&self) -> Duration {
        parse_duration_or(&self.max_age, Duration::from_secs(24 * 3600), "reaper.max_age")
    }

    pub fn delete_age(&self) -> Duration {
        parse_duration_or(
            &self.delete_age,
            Duration::from_secs(7 * 24 * 3600),
            "reaper.delete_age",
        )
    }

    pub fn stale_issue_age(&self) -> Duration {
        parse_duration_or(
            &self.stale_issue_age,
            Duration::from_secs(30 * 24 * 3600),
            "reaper.stale_issue_age",
        )
    }
}

/// Dolt backup patrol tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Databases to sync; empty means discover directories with a
    /// `<name>-backup` remote.
    pub databases: Vec<String>,
    /// Store data directory; defaults to `<town>/.dolt-data`.
    pub data_dir: Option<PathBuf>,
    /// Optional offsite mirror directory for rsync replication.
    pub offsite_dir: Option<PathBuf>,
}

/// The whole town settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TownSettings {
    pub queue: WorkQueueConfig,
    pub patrols: PatrolSettings,
    pub reaper: ReaperConfig,
    pub backup: BackupConfig,
    /// Rigs flagged as temporarily not accepting dispatches.
    pub parked_rigs: HashSet<RigName>,
    /// Store roster the daemon observes. The `hq` store is always included.
    pub stores: Vec<String>,
    /// Port of the store's SQL engine (reaper connections).
    pub sql_port: u16,
}

impl TownSettings {
    /// Loads settings, writing defaults if the file does not exist.
    pub fn load_or_create(town_root: &Path) -> Result<Self, ConfigError> {
        let path = settings_path(town_root);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| {
                ConfigError::Malformed {
                    path: path.clone(),
                    source,
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = TownSettings::default();
                settings.save(town_root)?;
                Ok(settings)
            }
            Err(source) => Err(ConfigError::Unreadable { path, source }),
        }
    }

    /// Writes settings atomically (temp file + rename).
    pub fn save(&self, town_root: &Path) -> Result<(), ConfigError> {
        let path = settings_path(town_root);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(self).unwrap_or_default())?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        };
        write().map_err(|source| ConfigError::Unwritable {
            path: path.clone(),
            source,
        })
    }

    /// The store roster, with `hq` guaranteed present and first.
    pub fn store_roster(&self) -> Vec<String> {
        let mut roster = vec!["hq".to_string()];
        for s in &self.stores {
            if s != "hq" {
                roster.push(s.clone());
            }
        }
        roster
    }

    pub fn is_parked(&self, rig: &RigName) -> bool {
        self.parked_rigs.contains(rig)
    }
}

impl Default for TownSettings {
    fn default() -> Self {
        TownSettings {
            queue: WorkQueueConfig::default(),
            patrols: PatrolSettings::default(),
            reaper: ReaperConfig::default(),
            backup: BackupConfig::default(),
            parked_rigs: HashSet::new(),
            stores: Vec::new(),
            sql_port: 3307,
        }
    }
}

fn parse_duration_or(s: &str, default: Duration, what: &str) -> Duration {
    match humantime::parse_duration(s) {
        Ok(d) if !d.is_zero() => d,
        Ok(_) => default,
        Err(e) => {
            warn!(value = s, what, error = %e, "unparseable duration, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = TownSettings::default();
        assert!(settings.queue.enabled);
        assert_eq!(settings.queue.max_concurrent, 6);
        assert_eq!(settings.queue.batch_size, 3);
        assert_eq!(settings.queue.spawn_delay(), Duration::from_secs(5));
        assert!(settings.patrols.event_poll.is_enabled());
    }

    #[test]
    fn store_roster_always_leads_with_hq() {
        let mut settings = TownSettings::default();
        settings.stores = vec!["gastown".to_string(), "hq".to_string(), "beads".to_string()];
        assert_eq!(settings.store_roster(), vec!["hq", "gastown", "beads"]);
        settings.stores.clear();
        assert_eq!(settings.store_roster(), vec!["hq"]);
    }

    #[test]
    fn unparseable_interval_falls_back() {
        let patrol = PatrolConfig {
            enabled: None,
            interval: Some("soonish".to_string()),
        };
        assert_eq!(
            patrol.interval_or(Duration::from_secs(30), "stranded_scan"),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn interval_strings_parse_humantime() {
        let patrol = PatrolConfig {
            enabled: None,
            interval: Some("15m".to_string()),
        };
        assert_eq!(
            patrol.interval_or(Duration::from_secs(5), "dolt_backup"),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn load_or_create_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let created = TownSettings::load_or_create(dir.path()).unwrap();
        assert!(settings_path(dir.path()).exists());
        let loaded = TownSettings::load_or_create(dir.path()).unwrap();
        assert_eq!(created.queue.max_concurrent, loaded.queue.max_concurrent);
    }

    #[test]
    fn malformed_settings_refuse_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = settings_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            TownSettings::load_or_create(dir.path()),
            Err(ConfigError::Malformed { .. })
        ));
    }
}
