//! Combining processors across sources.
//!
//! A node is authorized when at least one processor authorizes it. Each
//! processor answers `false` for documents of other sources, so the OR gives
//! every document exactly one effective decision, or more than one where
//! several processors cover the same source (a user check backed by an
//! admin check, for example).

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};

use crate::access::{NodeProcessor, DEFAULT_MAX_CONCURRENCY};
use crate::error::Result;
use crate::filter::MetadataFilter;

pub struct ProcessorMixer<N>
where
    N: Clone + Send + Sync + 'static,
{
    processors: Vec<Box<dyn NodeProcessor<N>>>,
    authorized: Vec<N>,
    unauthorized: Vec<N>,
    max_concurrency: usize,
}

impl<N> ProcessorMixer<N>
where
    N: Clone + Send + Sync + 'static,
{
    pub fn new(processors: Vec<Box<dyn NodeProcessor<N>>>) -> Self {
        Self {
            processors,
            authorized: Vec::new(),
            unauthorized: Vec::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn push(&mut self, processor: Box<dyn NodeProcessor<N>>) {
        self.processors.push(processor);
    }

    pub fn processors(&self) -> &[Box<dyn NodeProcessor<N>>] {
        &self.processors
    }

    /// OR over processors, consulted in order; stops at the first grant.
    pub async fn is_authorized(&self, node: &N) -> Result<bool> {
        for processor in &self.processors {
            if processor.is_authorized(node).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Authorized subsequence of `nodes`, in input order.
    ///
    /// Also records the authorized and unauthorized partitions, replacing
    /// those of any previous call. On error both partitions are left empty.
    pub async fn filter(&mut self, nodes: &[N]) -> Result<Vec<N>> {
        self.authorized.clear();
        self.unauthorized.clear();

        let decisions: Vec<bool> = {
            let this = &*self;
            let checks: Vec<BoxFuture<'_, Result<bool>>> = nodes
                .iter()
                .map(|node| -> BoxFuture<'_, Result<bool>> { Box::pin(this.is_authorized(node)) })
                .collect();
            stream::iter(checks)
                .buffered(this.max_concurrency)
                .try_collect()
                .await?
        };

        for (node, allowed) in nodes.iter().zip(decisions) {
            if allowed {
                self.authorized.push(node.clone());
            } else {
                self.unauthorized.push(node.clone());
            }
        }

        if !self.unauthorized.is_empty() {
            warn!(
                authorized = self.authorized.len(),
                unauthorized = self.unauthorized.len(),
                "documents withheld by access filter"
            );
        }
        Ok(self.authorized.clone())
    }

    /// Nodes authorized by the most recent [`filter`](Self::filter).
    pub fn authorized_documents(&self) -> &[N] {
        &self.authorized
    }

    /// Nodes denied by the most recent [`filter`](Self::filter).
    pub fn unauthorized_documents(&self) -> &[N] {
        &self.unauthorized
    }

    /// One filter per processor, in processor order. Callers OR-combine them
    /// with [`MetadataFilters::any`](crate::filter::MetadataFilters::any).
    pub async fn get_filters(&self) -> Result<Vec<MetadataFilter>> {
        let mut filters = Vec::with_capacity(self.processors.len());
        for processor in &self.processors {
            filters.push(processor.get_filter().await?);
        }
        info!(filters = filters.len(), "collected access filters");
        Ok(filters)
    }
}
