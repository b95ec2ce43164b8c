//! # Multipass Core
//!
//! Source-agnostic authorization engine for documents ingested from
//! third-party systems: data models, metadata filters, paginated readers,
//! metadata enrichment, cached access processors, and the processor mixer.
//!
//! This crate does no HTTP and reads no configuration. Connectors in the
//! `multipass` crate plug into it through [`reader::SourceListing`],
//! [`access::AccessCheck`] and [`enrich::MetadataEnricher`].

pub mod access;
pub mod enrich;
pub mod error;
pub mod filter;
pub mod mixer;
pub mod models;
pub mod reader;

pub use access::{AccessCheck, AccessProcessor, CheckShape, NodeProcessor, ObjectId};
pub use error::{MultipassError, Result};
pub use filter::{FilterCondition, FilterOperator, MetadataFilter, MetadataFilters};
pub use mixer::ProcessorMixer;
pub use models::{keys, Content, DataSource, Document, DocumentAccess, Metadata, MetadataValue};
