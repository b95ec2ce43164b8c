//! # Multipass
//!
//! Per-user authorization filtering for documents ingested from third-party
//! sources, before they are used as retrieval context.
//!
//! An admin credential reads content in bulk; at query time a user-scoped
//! check decides, per document, whether that user may see the source object
//! it came from. Authorized documents pass, the rest are withheld and
//! counted so callers can warn about incomplete context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌──────────────────┐
//! │  Connectors  │──▶│ Enrichers  │──▶│  ProcessorMixer  │──▶ authorized
//! │ (admin read) │   │ hash, ids  │   │ (user checks, OR)│──▶ withheld
//! └──────────────┘   └────────────┘   └────────┬─────────┘
//!                                              ▼
//!                                     MetadataFilters (OR)
//!                                     for vector-store queries
//! ```
//!
//! The engine (models, filters, readers, processors, mixer) lives in
//! `multipass-core`; this crate adds HTTP connectors, configuration and the
//! `mpass` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`http`] | Shared HTTP client and status classification |
//! | [`path_filter`] | Include/exclude globs for file sources |
//! | [`connector_github`] | GitHub repositories |
//! | [`connector_gitlab`] | GitLab projects |
//! | [`connector_slack`] | Slack channels |
//! | [`connector_dropbox`] | Dropbox folders |
//! | [`connector_onedrive`] | OneDrive drives |
//! | [`connector_confluence`] | Confluence spaces |
//! | [`connector_jira`] | Jira issues |
//! | [`connector_gdrive`] | Google Drive folders |
//! | [`registry`] | Connectors resolved from config |
//! | [`check`] | `check` and `filter` commands |
//! | [`sources`] | Source status listing |
//! | [`oauth`] | PKCE token acquisition |

pub mod check;
pub mod config;
pub mod connector_confluence;
pub mod connector_dropbox;
pub mod connector_gdrive;
pub mod connector_github;
pub mod connector_gitlab;
pub mod connector_jira;
pub mod connector_onedrive;
pub mod connector_slack;
pub mod http;
pub mod oauth;
pub mod path_filter;
pub mod registry;
pub mod sources;
