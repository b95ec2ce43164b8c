//! The `check` and `filter` commands.
//!
//! `check` runs the whole gate end to end: read every configured source
//! with its admin credential, enrich the documents, then filter them through
//! the user processors and report what was suppressed. `filter` prints the
//! OR-combined metadata predicate a vector store would apply instead.

use anyhow::Result;
use multipass_core::enrich::enrich_metadata;
use multipass_core::{DataSource, Document, DocumentAccess, MetadataFilters};
use tracing::info;

use crate::config::Config;
use crate::registry::SourceRegistry;

/// Counts from one `check` run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub read: usize,
    pub authorized: usize,
    pub unauthorized: usize,
}

impl CheckReport {
    /// Whether an answer built from the authorized documents may be missing
    /// context the user cannot see.
    pub fn incomplete(&self) -> bool {
        self.unauthorized > 0
    }
}

/// Read, enrich and filter through `registry`.
pub async fn check_registry(registry: &mut SourceRegistry, page_size: usize) -> Result<CheckReport> {
    let mut documents: Vec<Document> = Vec::new();
    for reader in registry.readers_mut() {
        let source = reader.source();
        let batch = reader.load_all(page_size).await?;
        info!(%source, documents = batch.len(), "read source");
        documents.extend(batch);
    }

    enrich_metadata(&mut documents, registry.enrichers(), &DocumentAccess).await?;

    let mut mixer = registry.take_mixer();
    mixer.filter(&documents).await?;

    Ok(CheckReport {
        read: documents.len(),
        authorized: mixer.authorized_documents().len(),
        unauthorized: mixer.unauthorized_documents().len(),
    })
}

pub async fn run_check(config: &Config, source: Option<DataSource>, page_size: Option<usize>) -> Result<()> {
    let mut registry = SourceRegistry::from_config(config, source)?;
    if registry.is_empty() {
        println!("No sources configured. Add a [sources.<name>] table to the config file.");
        return Ok(());
    }

    let page_size = page_size.unwrap_or(config.filter.page_size).max(1);
    let sources = registry.sources();
    let report = check_registry(&mut registry, page_size).await?;

    let names: Vec<&str> = sources.iter().map(DataSource::as_str).collect();
    println!("check {}", names.join(", "));
    println!("  documents read: {}", report.read);
    println!("  authorized: {}", report.authorized);
    println!("  unauthorized: {}", report.unauthorized);
    if report.incomplete() {
        println!(
            "warning: {} document(s) were withheld; answers may be based on incomplete context",
            report.unauthorized
        );
    }
    println!("ok");
    Ok(())
}

pub async fn run_filter(config: &Config, source: Option<DataSource>) -> Result<()> {
    let mut registry = SourceRegistry::from_config(config, source)?;
    let mixer = registry.take_mixer();
    let filters = MetadataFilters::any(mixer.get_filters().await?);
    println!("{}", serde_json::to_string_pretty(&filters)?);
    Ok(())
}
