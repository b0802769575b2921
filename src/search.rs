//! Similar-incident search over incident memory.
//!
//! Used by `lko search` and by the daemon when a resource hog is found.

use anyhow::{bail, Result};
use serde_json::Value;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding;
use crate::memory::{IncidentStore, SearchHit};

/// Open the configured incident store.
pub fn open_store(config: &Config) -> Result<IncidentStore> {
    let embedder: Arc<dyn embedding::Embedder> =
        Arc::from(embedding::create_embedder(&config.embedding)?);
    Ok(IncidentStore::open(&config.memory.dir, embedder))
}

/// Core search returning structured hits, most similar first.
pub async fn search_incidents(
    store: &IncidentStore,
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit>> {
    if k == 0 {
        bail!("-k must be at least 1");
    }
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(store.search(query, k).await?)
}

pub async fn run_search(config: &Config, query: &str, k: Option<usize>) -> Result<()> {
    let store = open_store(config)?;
    let k = k.unwrap_or(config.memory.default_k);
    let hits = search_incidents(&store, query, k).await?;

    if hits.is_empty() {
        println!("No similar incidents.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, hit.similarity, hit.text);
        if let Some(outcome) = hit.metadata.get("outcome").and_then(Value::as_str) {
            println!("    outcome: {}", outcome);
        }
        if let Some(tools) = hit.metadata.get("tools").and_then(Value::as_array) {
            let names: Vec<&str> = tools.iter().filter_map(Value::as_str).collect();
            if !names.is_empty() {
                println!("    tools: {}", names.join(", "));
            }
        }
        if let Some(ts) = hit.metadata.get("timestamp").and_then(Value::as_str) {
            println!("    when: {}", ts);
        }
        println!("    id: {}", hit.id);
        println!();
    }
    Ok(())
}
