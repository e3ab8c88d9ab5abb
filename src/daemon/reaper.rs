//! The wisp reaper patrol: lifecycle hygiene for ephemeral records.
//!
//! Wisps are ephemeral observability issues (molecule roots and steps). Left
//! alone they accumulate without bound, so the reaper runs every half hour
//! against each store database over the store's MySQL-compatible SQL engine:
//!
//! 1. close wisps older than the max age (including abandoned hooked or
//!    in-progress ones);
//! 2. auto-close ordinary issues untouched for the stale age, excluding
//!    P0/P1, epics, and anything linked by dependencies to open work;
//! 3. delete closed wisps older than the purge age;
//! 4. delete closed mail-labelled issues older than the mail purge age.
//!
//! Deletions run in bounded batches with auxiliary rows removed first, so a
//! big backlog cannot hold a long-running transaction against the server's
//! writer lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::TownSettings;

use super::molecule::MoleculeClient;
use super::patrol::ticker;

/// Rows deleted per batch.
const DELETE_BATCH_SIZE: usize = 100;

/// Escalation threshold for open wisps per database.
const WISP_ALERT_THRESHOLD: i64 = 500;

/// Closed mail older than this is purged.
const MAIL_DELETE_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

/// The label marking mail beads.
const MAIL_LABEL: &str = "gt:message";

/// Auxiliary tables cleared before deleting wisp rows.
const WISP_AUX_TABLES: [&str; 4] = [
    "wisp_labels",
    "wisp_comments",
    "wisp_events",
    "wisp_dependencies",
];

/// Auxiliary tables cleared before deleting issue rows.
const ISSUE_AUX_TABLES: [&str; 4] = ["labels", "comments", "events", "dependencies"];

/// Errors from reaper SQL operations.
#[derive(Debug, Error)]
pub enum ReaperError {
    #[error("database {db}: {source}")]
    Sql {
        db: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Totals from one reaper cycle, for the log summary.
#[derive(Debug, Default)]
pub struct ReaperReport {
    pub reaped: u64,
    pub auto_closed: u64,
    pub purged_wisps: u64,
    pub purged_mail: u64,
    pub open_wisps: i64,
    pub errors: usize,
}

/// Runs one reaper cycle across the configured databases.
#[instrument(skip_all)]
pub async fn reap_cycle(settings: &TownSettings, molecules: &MoleculeClient) -> ReaperReport {
    let max_age = settings.reaper.max_age();
    let delete_age = settings.reaper.delete_age();
    let stale_age = settings.reaper.stale_issue_age();

    let mol = molecules
        .pour(
            "mol-dog-reaper",
            &[
                ("max_age", humantime::format_duration(max_age).to_string()),
                ("purge_age", humantime::format_duration(delete_age).to_string()),
            ],
        )
        .await;

    let now = Utc::now();
    let close_cutoff = now - chrono::Duration::from_std(max_age).unwrap_or_default();
    let delete_cutoff = now - chrono::Duration::from_std(delete_age).unwrap_or_default();
    let stale_cutoff = now - chrono::Duration::from_std(stale_age).unwrap_or_default();
    let mail_cutoff = now - chrono::Duration::from_std(MAIL_DELETE_AGE).unwrap_or_default();

    let configured = if settings.reaper.databases.is_empty() {
        settings.store_roster()
    } else {
        settings.reaper.databases.clone()
    };
    // Database names end up inside the DSN; a stray `/`, `?`, or `@` would
    // rewrite its connection parameters.
    let databases: Vec<String> = configured
        .into_iter()
        .filter(|db| {
            if is_valid_db_name(db) {
                true
            } else {
                warn!(db, "wisp reaper: skipping invalid database name");
                false
            }
        })
        .collect();
    if databases.is_empty() {
        warn!("wisp reaper: no databases to reap");
        mol.fail_step("scan", "no databases found").await;
        mol.close().await;
        return ReaperReport::default();
    }
    info!(databases = databases.len(), "wisp reaper: scanning");
    mol.close_step("scan").await;

    let mut report = ReaperReport::default();

    // Reap: close stale wisps, then auto-close stale issues.
    for db in &databases {
        let pool = match connect(settings, db).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(db, error = %e, "wisp reaper: cannot connect");
                report.errors += 1;
                continue;
            }
        };

        match reap_wisps(&pool, db, close_cutoff).await {
            Ok((reaped, open)) => {
                if reaped > 0 {
                    info!(db, reaped, open, "closed stale wisps");
                }
                report.reaped += reaped;
                report.open_wisps += open;
            }
            Err(e) => {
                warn!(db, error = %e, "wisp close failed");
                report.errors += 1;
            }
        }

        match auto_close_stale_issues(&pool, db, stale_cutoff).await {
            Ok(closed) => report.auto_closed += closed,
            Err(e) => warn!(db, error = %e, "stale issue auto-close failed"),
        }

        pool.close().await;
    }
    if report.errors > 0 {
        mol.fail_step("reap", &format!("{} database(s) had reap errors", report.errors))
            .await;
    } else {
        mol.close_step("reap").await;
    }

    // Purge: delete old closed wisps and old closed mail.
    let mut purge_errors = 0usize;
    for db in &databases {
        let pool = match connect(settings, db).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(db, error = %e, "wisp reaper: cannot connect for purge");
                purge_errors += 1;
                continue;
            }
        };

        match purge_closed_wisps(&pool, db, delete_cutoff).await {
            Ok(purged) => report.purged_wisps += purged,
            Err(e) => {
                warn!(db, error = %e, "wisp purge failed");
                purge_errors += 1;
            }
        }

        match purge_old_mail(&pool, db, mail_cutoff).await {
            Ok(purged) => report.purged_mail += purged,
            Err(e) => warn!(db, error = %e, "mail purge failed"),
        }

        pool.close().await;
    }
    if purge_errors > 0 {
        mol.fail_step("purge", &format!("{purge_errors} database(s) had purge errors"))
            .await;
    } else {
        mol.close_step("purge").await;
    }

    if report.open_wisps > WISP_ALERT_THRESHOLD {
        warn!(
            open = report.open_wisps,
            threshold = WISP_ALERT_THRESHOLD,
            "open wisps exceed threshold, investigate wisp lifecycle"
        );
    }
    info!(
        reaped = report.reaped,
        auto_closed = report.auto_closed,
        purged = report.purged_wisps,
        mail = report.purged_mail,
        open = report.open_wisps,
        "wisp reaper cycle complete"
    );
    mol.close_step("report").await;
    mol.close().await;

    report
}

/// A safe database name: ASCII alphanumerics, `_`, and `-` only.
fn is_valid_db_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

async fn connect(settings: &TownSettings, db: &str) -> Result<MySqlPool, ReaperError> {
    let dsn = format!("mysql://root@127.0.0.1:{}/{}", settings.sql_port, db);
    MySqlPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&dsn)
        .await
        .map_err(|source| ReaperError::Sql {
            db: db.to_string(),
            source,
        })
}

/// Closes open wisps created before the cutoff. Hooked and in-progress wisps
/// count too: those are abandoned molecule steps. Returns (closed, remaining
/// open).
async fn reap_wisps(
    pool: &MySqlPool,
    db: &str,
    cutoff: DateTime<Utc>,
) -> Result<(u64, i64), ReaperError> {
    let sql_err = |source| ReaperError::Sql {
        db: db.to_string(),
        source,
    };

    let reaped = sqlx::query(
        "UPDATE wisps SET status = 'closed', closed_at = NOW() \
         WHERE status IN ('open', 'hooked', 'in_progress') AND created_at < ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .map_err(sql_err)?
    .rows_affected();

    let open: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM wisps WHERE status IN ('open', 'hooked', 'in_progress')",
    )
    .fetch_one(pool)
    .await
    .map_err(sql_err)?;

    Ok((reaped, open))
}

/// Deletes closed wisps older than the cutoff, in batches, auxiliary rows
/// first. Returns rows deleted.
async fn purge_closed_wisps(
    pool: &MySqlPool,
    db: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, ReaperError> {
    let sql_err = |source| ReaperError::Sql {
        db: db.to_string(),
        source,
    };

    let eligible: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM wisps WHERE status = 'closed' AND closed_at < ?")
            .bind(cutoff)
            .fetch_one(pool)
            .await
            .map_err(sql_err)?;
    if eligible == 0 {
        return Ok(0);
    }
    info!(db, eligible, "deleting closed wisp rows");

    let mut total = 0u64;
    loop {
        let rows = sqlx::query(&format!(
            "SELECT id FROM wisps WHERE status = 'closed' AND closed_at < ? LIMIT {DELETE_BATCH_SIZE}"
        ))
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .map_err(sql_err)?;
        if rows.is_empty() {
            break;
        }
        let ids: Vec<String> = rows.iter().map(|r| r.get::<String, _>("id")).collect();
        let placeholders = vec!["?"; ids.len()].join(",");

        for table in WISP_AUX_TABLES {
            let sql = format!("DELETE FROM `{table}` WHERE issue_id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            if let Err(e) = query.execute(pool).await {
                // Table may not exist in every database.
                warn!(db, table, error = %e, "aux delete failed");
            }
        }

        let sql = format!("DELETE FROM wisps WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(id);
        }
        total += query.execute(pool).await.map_err(sql_err)?.rows_affected();
    }

    if total > 0 {
        info!(db, deleted = total, "purged closed wisp rows");
    }
    Ok(total)
}

/// Auto-closes issues untouched since the cutoff, excluding P0/P1, epics, and
/// issues connected by dependencies to open work. Falls back to a query
/// without the dependency check where the table is absent. Each closure is
/// logged with its age.
async fn auto_close_stale_issues(
    pool: &MySqlPool,
    db: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, ReaperError> {
    let sql_err = |source| ReaperError::Sql {
        db: db.to_string(),
        source,
    };

    // Not every database carries an issues table.
    if sqlx::query("SELECT 1 FROM issues LIMIT 1")
        .fetch_optional(pool)
        .await
        .is_err()
    {
        return Ok(0);
    }

    let with_deps = "SELECT id, title, updated_at FROM issues \
         WHERE status IN ('open', 'in_progress') AND updated_at < ? \
         AND priority > 1 AND issue_type != 'epic' \
         AND id NOT IN (SELECT DISTINCT d.issue_id FROM dependencies d \
             INNER JOIN issues i ON d.depends_on_id = i.id \
             WHERE i.status IN ('open', 'in_progress')) \
         AND id NOT IN (SELECT DISTINCT d.depends_on_id FROM dependencies d \
             INNER JOIN issues i ON d.issue_id = i.id \
             WHERE i.status IN ('open', 'in_progress'))";
    let without_deps = "SELECT id, title, updated_at FROM issues \
         WHERE status IN ('open', 'in_progress') AND updated_at < ? \
         AND priority > 1 AND issue_type != 'epic'";

    let candidates = match sqlx::query(with_deps).bind(cutoff).fetch_all(pool).await {
        Ok(rows) => rows,
        // Dependencies table may be missing; retry without the check.
        Err(_) => sqlx::query(without_deps)
            .bind(cutoff)
            .fetch_all(pool)
            .await
            .map_err(sql_err)?,
    };

    let now = Utc::now();
    let mut closed = 0u64;
    for row in candidates {
        let id: String = row.get("id");
        let title: String = row.get("title");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        let affected = sqlx::query(
            "UPDATE issues SET status = 'closed', closed_at = NOW(), \
             close_reason = 'stale:auto-closed by reaper' \
             WHERE id = ? AND status IN ('open', 'in_progress')",
        )
        .bind(&id)
        .execute(pool)
        .await
        .map_err(sql_err)?
        .rows_affected();

        if affected > 0 {
            let age = now - updated_at;
            info!(db, id, title, age_days = age.num_days(), "auto-closed stale issue");
            closed += 1;
        }
    }
    Ok(closed)
}

/// Deletes closed mail-labelled issues older than the cutoff. Open mail is
/// never touched, so messages to parked rigs don't vanish.
async fn purge_old_mail(
    pool: &MySqlPool,
    db: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, ReaperError> {
    let sql_err = |source| ReaperError::Sql {
        db: db.to_string(),
        source,
    };

    let eligible: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM issues i INNER JOIN labels l ON i.id = l.issue_id \
         WHERE i.status = 'closed' AND i.closed_at < ? AND l.label = ?",
    )
    .bind(cutoff)
    .bind(MAIL_LABEL)
    .fetch_one(pool)
    .await
    .map_err(sql_err)?;
    if eligible == 0 {
        return Ok(0);
    }
    info!(db, eligible, "deleting old mail rows");

    let mut total = 0u64;
    loop {
        let rows = sqlx::query(&format!(
            "SELECT i.id FROM issues i INNER JOIN labels l ON i.id = l.issue_id \
             WHERE i.status = 'closed' AND i.closed_at < ? AND l.label = ? \
             LIMIT {DELETE_BATCH_SIZE}"
        ))
        .bind(cutoff)
        .bind(MAIL_LABEL)
        .fetch_all(pool)
        .await
        .map_err(sql_err)?;
        if rows.is_empty() {
            break;
        }
        let ids: Vec<String> = rows.iter().map(|r| r.get::<String, _>("id")).collect();
        let placeholders = vec!["?"; ids.len()].join(",");

        for table in ISSUE_AUX_TABLES {
            let sql = format!("DELETE FROM `{table}` WHERE issue_id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            if let Err(e) = query.execute(pool).await {
                warn!(db, table, error = %e, "mail aux delete failed");
            }
        }

        let sql = format!("DELETE FROM issues WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(id);
        }
        total += query.execute(pool).await.map_err(sql_err)?.rows_affected();
    }

    if total > 0 {
        info!(db, deleted = total, "purged old mail rows");
    }
    Ok(total)
}

/// The `wisp_reaper` patrol loop.
pub async fn run_loop(
    town_root: std::path::PathBuf,
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
                        warn!(error = %e, "wisp reaper: could not load settings");
                        continue;
                    }
                };
                if !settings.patrols.wisp_reaper.is_enabled() {
                    continue;
                }
                reap_cycle(&settings, &molecules).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_names_are_alphanumeric_underscore_dash() {
        assert!(is_valid_db_name("hq"));
        assert!(is_valid_db_name("gastown"));
        assert!(is_valid_db_name("my_rig-2"));
        assert!(!is_valid_db_name(""));
        assert!(!is_valid_db_name("bad/name"));
        assert!(!is_valid_db_name("bad?timeout=0"));
        assert!(!is_valid_db_name("user@host"));
    }
}
