//! SQLite persistence of observer checkpoints.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use tracing::instrument;

use crate::observer::ObserverState;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/`, make sure the parent
/// directory exists and create the file on first use. Other URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            if !q.split('&').any(|kv| kv.starts_with("mode=")) {
                rebuilt.push_str("&mode=rwc");
            }
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Stored observer state for `folder`, if any.
#[instrument(skip_all, fields(folder = %folder))]
pub async fn load_checkpoint(pool: &Pool, folder: &str) -> Result<Option<ObserverState>> {
    let cursor: Option<i64> =
        sqlx::query_scalar("SELECT cursor_ts FROM observer_cursor WHERE folder = ?")
            .bind(folder)
            .fetch_optional(pool)
            .await?;
    let Some(cursor_ts) = cursor else {
        return Ok(None);
    };

    let rows = sqlx::query("SELECT timestamp_ms, name FROM observer_seen WHERE folder = ?")
        .bind(folder)
        .fetch_all(pool)
        .await?;
    let mut seen: BTreeMap<i64, HashSet<String>> = BTreeMap::new();
    for row in rows {
        let ts: i64 = row.get("timestamp_ms");
        let name: String = row.get("name");
        seen.entry(ts).or_default().insert(name);
    }
    Ok(Some(ObserverState::from_parts(cursor_ts, seen)))
}

/// Replace the stored state for `folder` in one transaction.
#[instrument(skip_all, fields(folder = %folder))]
pub async fn save_checkpoint(pool: &Pool, folder: &str, state: &ObserverState) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO observer_cursor (folder, cursor_ts) VALUES (?, ?) \
         ON CONFLICT(folder) DO UPDATE SET cursor_ts = excluded.cursor_ts, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(folder)
    .bind(state.cursor_ts())
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM observer_seen WHERE folder = ?")
        .bind(folder)
        .execute(&mut *tx)
        .await?;
    for (ts, names) in state.seen() {
        for name in names {
            sqlx::query("INSERT INTO observer_seen (folder, timestamp_ms, name) VALUES (?, ?, ?)")
                .bind(folder)
                .bind(*ts)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}
