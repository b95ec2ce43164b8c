//! Source configuration status.
//!
//! Reports, for every known source, whether it has a `[sources.<name>]`
//! table and whether the environment variables it reads credentials from
//! are set. Nothing is sent over the network.

use anyhow::Result;
use multipass_core::DataSource;
use serde::Serialize;

use crate::config::Config;

/// Status of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub configured: bool,
    /// Every credential variable the source reads is set and non-empty.
    pub credentials: bool,
    /// Missing variables, when any.
    pub notes: Option<String>,
}

pub fn get_sources(config: &Config) -> Vec<SourceStatus> {
    DataSource::ALL
        .iter()
        .map(|&source| {
            if !config.sources.is_configured(source) {
                return SourceStatus {
                    name: source.to_string(),
                    configured: false,
                    credentials: false,
                    notes: None,
                };
            }
            let missing: Vec<&str> = config
                .sources
                .credential_envs(source)
                .into_iter()
                .filter(|env| std::env::var(env).map_or(true, |v| v.trim().is_empty()))
                .collect();
            SourceStatus {
                name: source.to_string(),
                configured: true,
                credentials: missing.is_empty(),
                notes: (!missing.is_empty()).then(|| format!("missing: {}", missing.join(", "))),
            }
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let sources = get_sources(config);

    println!("{:<12} {:<16} CREDENTIALS", "SOURCE", "STATUS");
    for s in &sources {
        let status = if s.configured { "OK" } else { "NOT CONFIGURED" };
        let credentials = match (&s.notes, s.configured) {
            (Some(notes), _) => notes.clone(),
            (None, true) => "present".to_string(),
            (None, false) => "-".to_string(),
        };
        println!("{:<12} {:<16} {}", s.name, status, credentials);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GDriveSourceConfig, SourcesConfig};

    #[test]
    fn test_unconfigured_sources_listed() {
        let sources = get_sources(&Config::minimal());
        assert_eq!(sources.len(), DataSource::ALL.len());
        assert!(sources.iter().all(|s| !s.configured && !s.credentials));
    }

    #[test]
    fn test_missing_credentials_noted() {
        let mut config = Config::minimal();
        config.sources = SourcesConfig {
            gdrive: Some(GDriveSourceConfig {
                base_url: "http://127.0.0.1:9".into(),
                admin_token_env: "MULTIPASS_TEST_SOURCES_UNSET".into(),
                user_email: "ana@acme.io".into(),
                folder_id: "root".into(),
                include_globs: Vec::new(),
                exclude_globs: Vec::new(),
            }),
            ..Default::default()
        };
        let gdrive = get_sources(&config)
            .into_iter()
            .find(|s| s.name == "gdrive")
            .unwrap();
        assert!(gdrive.configured);
        assert!(!gdrive.credentials);
        assert_eq!(gdrive.notes.as_deref(), Some("missing: MULTIPASS_TEST_SOURCES_UNSET"));
    }
}
