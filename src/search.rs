//! Nearest-page lookup over the local vector index.
//!
//! Embeds the query with the configured provider, ranks every stored page
//! vector by cosine similarity and prints the best matches with a snippet
//! of the page text. Only the `sqlite` vector index is searchable locally.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::index::SqliteVectorIndex;
use crate::models::{document_key, DocumentRecord, DOCUMENTS};
use crate::retry::RetryPolicy;
use crate::store::{RecordStoreExt, SqliteStore};

const SNIPPET_CHARS: usize = 160;

pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if config.vector_index.provider != "sqlite" {
        bail!(
            "Search requires the sqlite vector index (configured: '{}').",
            config.vector_index.provider
        );
    }
    let Some(embedder) =
        embedding::from_config(&config.embedding, RetryPolicy::from_config(&config.retry))?
    else {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    };

    let pool = db::connect(config).await?;
    let index = SqliteVectorIndex::new(pool.clone());
    let store = SqliteStore::new(pool.clone());

    let vector = embedding::embed_query(embedder.as_ref(), query).await?;
    let matches = index.query(&vector, limit.unwrap_or(10)).await?;

    if matches.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (rank, m) in matches.iter().enumerate() {
        let (filename, page) = split_page_id(&m.id);
        let text = match page {
            Some(n) => store
                .fetch::<DocumentRecord>(DOCUMENTS, &document_key(filename))
                .await?
                .and_then(|doc| doc.pages.get(n).cloned()),
            None => None,
        };
        println!("{}. [{:.3}] {}", rank + 1, m.score, m.id);
        if let Some(text) = text {
            println!("    {}", snippet(&text));
        }
    }

    pool.close().await;
    Ok(())
}

/// Split a `{filename}:{page}` id. Filenames may themselves contain `:`.
fn split_page_id(id: &str) -> (&str, Option<usize>) {
    match id.rsplit_once(':') {
        Some((filename, page)) => match page.parse() {
            Ok(n) => (filename, Some(n)),
            Err(_) => (id, None),
        },
        None => (id, None),
    }
}

fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
        format!("{}…", cut)
    }
}
