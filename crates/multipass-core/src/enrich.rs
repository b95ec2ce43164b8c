//! Post-ingestion metadata enrichment.
//!
//! Enrichers attach facts that were not available at read time (owning
//! folder, permission snapshot, content hash). They run in order, so a later
//! enricher can rely on keys written by an earlier one.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;
use crate::models::{data_source_tag, keys, DataSource, DocumentReader, Metadata, MetadataValue};

#[async_trait]
pub trait MetadataEnricher: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this enricher owns documents from `source`.
    fn applies_to(&self, source: DataSource) -> bool;

    /// Compute the keys to attach to one document from its metadata and
    /// raw content.
    async fn extract(&self, metadata: &Metadata, content: &[u8]) -> Result<Metadata>;
}

/// Run `enrichers` over `documents`, mutating metadata in place.
///
/// A key is written only when absent or empty, and `data_source` is never
/// touched, so running the same enrichers twice changes nothing. Documents
/// tagged with a source no enricher owns are left alone; a document without
/// a `data_source` key is an error.
pub async fn enrich_metadata<N: Send>(
    documents: &mut [N],
    enrichers: &[Box<dyn MetadataEnricher>],
    reader: &dyn DocumentReader<N>,
) -> Result<()> {
    for document in documents.iter_mut() {
        let source: Option<DataSource> = data_source_tag(reader.metadata(document))?.parse().ok();
        let Some(source) = source else {
            continue;
        };

        for enricher in enrichers {
            if !enricher.applies_to(source) {
                continue;
            }

            let extracted = {
                let content = reader.read(document);
                enricher
                    .extract(reader.metadata(document), &content)
                    .await?
            };

            let metadata = reader.metadata_mut(document);
            let mut written = 0usize;
            for (key, value) in extracted {
                if key == keys::DATA_SOURCE {
                    continue;
                }
                let unset = metadata.get(&key).map_or(true, MetadataValue::is_empty);
                if unset && !value.is_empty() {
                    metadata.insert(key, value);
                    written += 1;
                }
            }
            debug!(enricher = enricher.name(), %source, written, "enriched document");
        }
    }
    Ok(())
}

/// Attaches the SHA-256 of the content under `content_hash`, for every source.
#[derive(Debug, Default)]
pub struct ContentHashEnricher;

#[async_trait]
impl MetadataEnricher for ContentHashEnricher {
    fn name(&self) -> &str {
        "content_hash"
    }

    fn applies_to(&self, _source: DataSource) -> bool {
        true
    }

    async fn extract(&self, _metadata: &Metadata, content: &[u8]) -> Result<Metadata> {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let mut out = Metadata::new();
        out.insert(
            keys::CONTENT_HASH.to_string(),
            MetadataValue::Text(hex::encode(hasher.finalize())),
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MultipassError;
    use crate::models::{Document, DocumentAccess};

    fn doc(source: &str, body: &str) -> Document {
        let mut md = Metadata::new();
        md.insert(keys::DATA_SOURCE.into(), source.into());
        Document::new(body.to_string(), md)
    }

    /// Derives a folder id from the file path; Dropbox only.
    struct FolderFromPath;

    #[async_trait]
    impl MetadataEnricher for FolderFromPath {
        fn name(&self) -> &str {
            "folder_from_path"
        }

        fn applies_to(&self, source: DataSource) -> bool {
            source == DataSource::Dropbox
        }

        async fn extract(&self, metadata: &Metadata, _content: &[u8]) -> Result<Metadata> {
            let mut out = Metadata::new();
            if let Some(path) = metadata.get(keys::FILE_PATH).and_then(|v| v.as_text()) {
                let folder = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
                out.insert(keys::DROPBOX_FOLDER_ID.into(), folder.into());
            }
            out.insert(keys::DATA_SOURCE.into(), "tampered".into());
            Ok(out)
        }
    }

    /// Needs the folder written by [`FolderFromPath`].
    struct FolderEcho;

    #[async_trait]
    impl MetadataEnricher for FolderEcho {
        fn name(&self) -> &str {
            "folder_echo"
        }

        fn applies_to(&self, source: DataSource) -> bool {
            source == DataSource::Dropbox
        }

        async fn extract(&self, metadata: &Metadata, _content: &[u8]) -> Result<Metadata> {
            let mut out = Metadata::new();
            if let Some(folder) = metadata.get(keys::DROPBOX_FOLDER_ID) {
                out.insert("folder_echo".into(), folder.clone());
            }
            Ok(out)
        }
    }

    fn enrichers() -> Vec<Box<dyn MetadataEnricher>> {
        vec![
            Box::new(ContentHashEnricher),
            Box::new(FolderFromPath),
            Box::new(FolderEcho),
        ]
    }

    #[tokio::test]
    async fn test_enrichment_is_idempotent() {
        let mut d = doc("dropbox", "hello");
        d.metadata.insert(keys::FILE_PATH.into(), "/team/notes.txt".into());
        let mut docs = vec![d];

        enrich_metadata(&mut docs, &enrichers(), &DocumentAccess).await.unwrap();
        let once = docs[0].metadata.clone();
        enrich_metadata(&mut docs, &enrichers(), &DocumentAccess).await.unwrap();

        assert_eq!(docs[0].metadata, once);
        assert_eq!(once["folder_echo"], MetadataValue::from("/team"));
        assert_eq!(once[keys::DATA_SOURCE], MetadataValue::from("dropbox"));
        assert_eq!(
            once[keys::CONTENT_HASH],
            MetadataValue::from("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[tokio::test]
    async fn test_binary_content_hashes_raw_bytes() {
        let binary = |bytes: Vec<u8>| {
            let mut md = Metadata::new();
            md.insert(keys::DATA_SOURCE.into(), "dropbox".into());
            Document::new(bytes, md)
        };
        let mut docs = vec![binary(vec![0xff, 0x00]), binary(vec![0xfe, 0x00])];
        let hashers: Vec<Box<dyn MetadataEnricher>> = vec![Box::new(ContentHashEnricher)];
        enrich_metadata(&mut docs, &hashers, &DocumentAccess).await.unwrap();

        assert_eq!(
            docs[0].metadata[keys::CONTENT_HASH],
            MetadataValue::from("ea5dbf9596d187e9500f23e9a680109475341cf4e81f7e043f7d97152c10772f")
        );
        assert_eq!(
            docs[1].metadata[keys::CONTENT_HASH],
            MetadataValue::from("59316c1a765f0c95af8be7f3f75371aa38612e5ceffc4785ef22f5541635413a")
        );
    }

    #[tokio::test]
    async fn test_foreign_documents_untouched_by_source_enrichers() {
        let mut docs = vec![doc("slack", "hi")];
        docs[0].metadata.insert(keys::FILE_PATH.into(), "/x/y".into());
        enrich_metadata(&mut docs, &enrichers(), &DocumentAccess).await.unwrap();
        assert!(!docs[0].metadata.contains_key(keys::DROPBOX_FOLDER_ID));
        assert!(docs[0].metadata.contains_key(keys::CONTENT_HASH));
    }

    #[tokio::test]
    async fn test_existing_values_are_kept() {
        let mut d = doc("dropbox", "hello");
        d.metadata.insert(keys::FILE_PATH.into(), "/a/b.txt".into());
        d.metadata.insert(keys::DROPBOX_FOLDER_ID.into(), "ns:1".into());
        let mut docs = vec![d];
        enrich_metadata(&mut docs, &enrichers(), &DocumentAccess).await.unwrap();
        assert_eq!(docs[0].metadata[keys::DROPBOX_FOLDER_ID], MetadataValue::from("ns:1"));
    }

    #[tokio::test]
    async fn test_missing_data_source_is_an_error() {
        let mut docs = vec![Document::new("x".to_string(), Metadata::new())];
        let err = enrich_metadata(&mut docs, &enrichers(), &DocumentAccess)
            .await
            .unwrap_err();
        assert!(matches!(err, MultipassError::MissingMetadataKey { .. }));
    }
}
