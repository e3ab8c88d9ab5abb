//! The dolt backup patrol: sync each store database to its backup remote.
//!
//! Every cycle discovers databases whose directory has a `<name>-backup`
//! remote configured, runs `dolt backup sync` in each, and then best-effort
//! mirrors the local backup directory to an offsite path with rsync. Before
//! touching the server it clears a stale server PID file, which would
//! otherwise hang the next SQL client until its read timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::TownSettings;

use super::molecule::MoleculeClient;
use super::patrol::ticker;
use super::stale_pid::clean_stale_server_pid;

/// Timeout for one `dolt backup sync`.
const SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for remote discovery.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the offsite rsync.
const OFFSITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Totals from one backup cycle.
#[derive(Debug, Default)]
pub struct BackupReport {
    pub synced: usize,
    pub failed: Vec<String>,
}

/// Runs one backup cycle.
#[instrument(skip_all)]
pub async fn backup_cycle(
    town_root: &Path,
    settings: &TownSettings,
    molecules: &MoleculeClient,
) -> BackupReport {
    let mol = molecules.pour("mol-dog-backup", &[]).await;
    let mut report = BackupReport::default();

    let data_dir = settings
        .backup
        .data_dir
        .clone()
        .unwrap_or_else(|| town_root.join(".dolt-data"));
    if !data_dir.exists() {
        warn!(data_dir = %data_dir.display(), "backup: data dir does not exist, skipping");
        mol.fail_step("sync", "data dir does not exist").await;
        mol.close().await;
        return report;
    }

    // A dead server's PID file hangs every client that trusts it.
    clean_stale_server_pid(&data_dir);

    let databases = if settings.backup.databases.is_empty() {
        discover_databases_with_backups(&data_dir).await
    } else {
        settings.backup.databases.clone()
    };
    if databases.is_empty() {
        info!("backup: no databases with backup remotes found");
        mol.fail_step("sync", "no databases with backup remotes").await;
        mol.close().await;
        return report;
    }

    info!(count = databases.len(), "backup: syncing databases");
    for db in &databases {
        let backup_name = format!("{db}-backup");
        match sync_backup(&data_dir, db, &backup_name).await {
            Ok(()) => {
                info!(db, backup = %backup_name, "backup synced");
                report.synced += 1;
            }
            Err(e) => {
                warn!(db, error = %e, "backup sync failed");
                report.failed.push(db.clone());
            }
        }
    }

    if report.failed.is_empty() {
        mol.close_step("sync").await;
    } else {
        mol.fail_step(
            "sync",
            &format!(
                "synced {}/{}, failures: {}",
                report.synced,
                databases.len(),
                report.failed.join("; ")
            ),
        )
        .await;
    }

    // Offsite mirror, only worth attempting when something synced.
    if report.synced > 0 {
        sync_offsite(town_root, settings).await;
    }
    mol.close_step("offsite").await;

    info!(
        synced = report.synced,
        total = databases.len(),
        "backup cycle complete"
    );
    mol.close_step("report").await;
    mol.close().await;
    report
}

/// Runs `dolt backup sync <name>-backup` in the database directory.
async fn sync_backup(data_dir: &Path, db: &str, backup_name: &str) -> Result<(), String> {
    let output = tokio::time::timeout(
        SYNC_TIMEOUT,
        Command::new("dolt")
            .args(["backup", "sync", backup_name])
            .current_dir(data_dir.join(db))
            .output(),
    )
    .await
    .map_err(|_| format!("timed out after {SYNC_TIMEOUT:?}"))?
    .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(())
}

/// Mirrors the local backup directory to the configured offsite path.
/// Non-fatal end to end.
async fn sync_offsite(town_root: &Path, settings: &TownSettings) {
    let Some(offsite_dir) = &settings.backup.offsite_dir else {
        return;
    };
    let backup_dir = town_root.join(".dolt-backup");
    if !backup_dir.exists() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(offsite_dir) {
        warn!(dir = %offsite_dir.display(), error = %e, "backup: cannot create offsite dir");
        return;
    }

    let result = tokio::time::timeout(
        OFFSITE_TIMEOUT,
        Command::new("rsync")
            .arg("-a")
            .arg("--delete")
            .arg(format!("{}/", backup_dir.display()))
            .arg(format!("{}/", offsite_dir.display()))
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            info!(dir = %offsite_dir.display(), "backup: offsite synced");
        }
        Ok(Ok(output)) => {
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "backup: offsite sync failed"
            );
        }
        Ok(Err(e)) => warn!(error = %e, "backup: offsite sync failed"),
        Err(_) => warn!("backup: offsite sync timed out"),
    }
}

/// Lists database directories that have a `<name>-backup` remote configured.
async fn discover_databases_with_backups(data_dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "backup: cannot read data dir");
            return Vec::new();
        }
    };

    let mut databases = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if has_backup_remote(data_dir, &name).await {
            databases.push(name);
        } else {
            debug!(db = %name, "no backup remote, skipping");
        }
    }
    databases.sort();
    databases
}

/// Checks `dolt backup` output for a `<name>-backup` remote.
async fn has_backup_remote(data_dir: &Path, db: &str) -> bool {
    let result = tokio::time::timeout(
        DISCOVER_TIMEOUT,
        Command::new("dolt")
            .arg("backup")
            .current_dir(data_dir.join(db))
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            let expected = format!("{db}-backup");
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| line.trim() == expected)
        }
        _ => false,
    }
}

/// The `dolt_backup` patrol loop.
pub async fn run_loop(
    town_root: PathBuf,
    molecules: MoleculeClient,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let settings = match TownSettings::load_or_create(&town_root) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "backup: could not load settings");
                        continue;
                    }
                };
                if !settings.patrols.dolt_backup.is_enabled() {
                    continue;
                }
                backup_cycle(&town_root, &settings, &molecules).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_data_dir_skips_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TownSettings::default();
        let molecules = MoleculeClient::new(dir.path()).with_bd_path("/nonexistent/bd");

        let report = backup_cycle(dir.path(), &settings, &molecules).await;
        assert_eq!(report.synced, 0);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn discovery_skips_hidden_and_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join("not-a-db"), b"x").unwrap();
        // A bare directory has no backup remote, so discovery returns empty
        // whether or not a dolt binary is installed.
        std::fs::create_dir(dir.path().join("somedb")).unwrap();

        let dbs = discover_databases_with_backups(dir.path()).await;
        assert!(dbs.is_empty());
    }
}
