//! Source registry: every configured connector, resolved from config.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                SourceRegistry                 │
//! │  readers     (admin credential, paginated)    │
//! │  enrichers   (content hash + per source)      │
//! │  processors  (user credential, cached)        │
//! └──────────────────────┬────────────────────────┘
//!                        ▼
//!        run_check() / run_filter() → ProcessorMixer
//! ```
//!
//! Each access check is wrapped in an [`AccessProcessor`] carrying the
//! configured per-call deadline and fan-out limit.

use std::sync::Arc;

use anyhow::{Context, Result};
use multipass_core::enrich::{ContentHashEnricher, MetadataEnricher};
use multipass_core::reader::PageReader;
use multipass_core::{
    AccessCheck, AccessProcessor, DataSource, Document, DocumentAccess, NodeProcessor, ProcessorMixer,
};

use crate::config::Config;
use crate::{
    connector_confluence, connector_dropbox, connector_gdrive, connector_github, connector_gitlab,
    connector_jira, connector_onedrive, connector_slack,
};

pub struct SourceRegistry {
    readers: Vec<Box<dyn PageReader>>,
    enrichers: Vec<Box<dyn MetadataEnricher>>,
    processors: Vec<Box<dyn NodeProcessor<Document>>>,
    max_concurrency: usize,
}

impl SourceRegistry {
    /// An empty registry that only hashes content.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            readers: Vec::new(),
            enrichers: vec![Box::new(ContentHashEnricher)],
            processors: Vec::new(),
            max_concurrency,
        }
    }

    /// Build readers, enrichers and processors for every configured source,
    /// or only for `only` when given.
    ///
    /// Fails when a selected source is not configured or one of its
    /// credential variables is missing.
    pub fn from_config(config: &Config, only: Option<DataSource>) -> Result<Self> {
        let http = &config.http;
        let sources = &config.sources;
        let mut registry = Self::new(config.filter.max_concurrency);

        if let Some(source) = only {
            if !sources.is_configured(source) {
                anyhow::bail!("source '{}' is not configured (add [sources.{}])", source, source);
            }
        }
        let wanted = |source: DataSource| only.map_or(true, |o| o == source);

        if let Some(cfg) = sources.github.as_ref().filter(|_| wanted(DataSource::GitHub)) {
            registry.push_reader(connector_github::reader(cfg, http).context("github reader")?);
            registry.push_check(config, connector_github::access(cfg, http).context("github access")?);
        }
        if let Some(cfg) = sources.gitlab.as_ref().filter(|_| wanted(DataSource::GitLab)) {
            registry.push_reader(connector_gitlab::reader(cfg, http).context("gitlab reader")?);
            registry.push_check(config, connector_gitlab::access(cfg, http).context("gitlab access")?);
        }
        if let Some(cfg) = sources.slack.as_ref().filter(|_| wanted(DataSource::Slack)) {
            registry.push_reader(connector_slack::reader(cfg, http).context("slack reader")?);
            registry.push_check(config, connector_slack::access(cfg, http).context("slack access")?);
        }
        if let Some(cfg) = sources.dropbox.as_ref().filter(|_| wanted(DataSource::Dropbox)) {
            registry.push_reader(connector_dropbox::reader(cfg, http).context("dropbox reader")?);
            registry.push_enricher(connector_dropbox::enricher(cfg, http).context("dropbox enricher")?);
            registry.push_check(config, connector_dropbox::access(cfg, http).context("dropbox access")?);
        }
        if let Some(cfg) = sources.onedrive.as_ref().filter(|_| wanted(DataSource::OneDrive)) {
            registry.push_reader(connector_onedrive::reader(cfg, http).context("onedrive reader")?);
            registry.push_check(config, connector_onedrive::access(cfg, http).context("onedrive access")?);
        }
        if let Some(cfg) = sources.confluence.as_ref().filter(|_| wanted(DataSource::Confluence)) {
            registry.push_reader(connector_confluence::reader(cfg, http).context("confluence reader")?);
            registry.push_check(config, connector_confluence::access(cfg, http).context("confluence access")?);
        }
        if let Some(cfg) = sources.jira.as_ref().filter(|_| wanted(DataSource::Jira)) {
            registry.push_reader(connector_jira::reader(cfg, http).context("jira reader")?);
            registry.push_enricher(connector_jira::JiraProjectEnricher);
            registry.push_check(config, connector_jira::access(cfg, http).context("jira access")?);
        }
        if let Some(cfg) = sources.gdrive.as_ref().filter(|_| wanted(DataSource::GDrive)) {
            registry.push_reader(connector_gdrive::reader(cfg, http).context("gdrive reader")?);
            registry.push_enricher(connector_gdrive::enricher(cfg, http).context("gdrive enricher")?);
            registry.push_check(config, connector_gdrive::access(cfg, http).context("gdrive access")?);
        }

        Ok(registry)
    }

    pub fn push_reader(&mut self, reader: impl PageReader + 'static) {
        self.readers.push(Box::new(reader));
    }

    pub fn push_enricher(&mut self, enricher: impl MetadataEnricher + 'static) {
        self.enrichers.push(Box::new(enricher));
    }

    /// Wrap `check` in a processor with the configured deadline and
    /// concurrency.
    pub fn push_check(&mut self, config: &Config, check: impl AccessCheck) {
        let processor = AccessProcessor::new(check, Arc::new(DocumentAccess))
            .with_deadline(config.http.timeout())
            .with_max_concurrency(config.filter.max_concurrency);
        self.processors.push(Box::new(processor));
    }

    pub fn readers_mut(&mut self) -> &mut [Box<dyn PageReader>] {
        &mut self.readers
    }

    pub fn enrichers(&self) -> &[Box<dyn MetadataEnricher>] {
        &self.enrichers
    }

    pub fn sources(&self) -> Vec<DataSource> {
        self.readers.iter().map(|r| r.source()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.processors.is_empty()
    }

    /// Hand the processors to a mixer; the registry keeps its readers.
    pub fn take_mixer(&mut self) -> ProcessorMixer<Document> {
        ProcessorMixer::new(std::mem::take(&mut self.processors)).with_max_concurrency(self.max_concurrency)
    }
}
