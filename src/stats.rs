//! Database statistics.
//!
//! Summarizes what the pipeline has produced so far: record counts per
//! collection, queue state, and the most recent events. Used by
//! `docqa stats`.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::models::{DATASET, DOCUMENTS, EVENTS};
use crate::queue::WorkQueue;
use crate::store::{RecordStore, SqliteStore};

const RECENT_EVENTS: i64 = 5;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let queue = WorkQueue::from_config(&config.queue, pool.clone());

    let events = store.count(EVENTS).await?;
    let documents = store.count(DOCUMENTS).await?;
    let entries = store.count(DATASET).await?;
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM page_vectors")
        .fetch_one(&pool)
        .await?;
    let jobs = queue.counts().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docqa Database Stats");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Events:      {}", events);
    println!("  Documents:   {}", documents);
    println!("  Entries:     {}", entries);
    println!("  Vectors:     {}", vectors);
    println!();
    println!(
        "  Jobs:        {} pending, {} running, {} done, {} failed",
        jobs.pending, jobs.running, jobs.done, jobs.failed
    );

    let recent = sqlx::query(
        r#"
        SELECT key,
               json_extract(value_json, '$.object_name') AS object_name,
               json_extract(value_json, '$.status') AS status,
               updated_at
        FROM records
        WHERE collection = ?
        ORDER BY updated_at DESC, key
        LIMIT ?
        "#,
    )
    .bind(EVENTS)
    .bind(RECENT_EVENTS)
    .fetch_all(&pool)
    .await?;

    if !recent.is_empty() {
        println!();
        println!("  Recent events:");
        println!(
            "  {:<28} {:<12} {:<16} {}",
            "EVENT", "STATUS", "UPDATED", "OBJECT"
        );
        println!("  {}", "-".repeat(76));
        for row in &recent {
            let key: String = row.get("key");
            let object_name: Option<String> = row.get("object_name");
            let status: Option<String> = row.get("status");
            let updated_at: i64 = row.get("updated_at");
            println!(
                "  {:<28} {:<12} {:<16} {}",
                key,
                status.unwrap_or_else(|| "?".to_string()),
                format_ts_relative(updated_at),
                object_name.unwrap_or_default()
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
