//! Clinical documents and the stores they are borrowed from

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

/// Immutable narrative document; `fingerprint` is the SHA-256 hex digest of `text`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub fingerprint: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            fingerprint: fingerprint(&text),
            text,
        }
    }

    /// Whether the text holds anything but whitespace
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Content fingerprint of a text
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Source of raw documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document; `DocumentNotFound` when the id is unknown
    async fn get(&self, id: &str) -> Result<Document>;

    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// Document store held in memory
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<BTreeMap<String, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) {
        self.documents
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(document.id.clone(), document);
    }

    pub fn with_document(self, id: &str, text: &str) -> Self {
        self.insert(Document::new(id, text));
        self
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, id: &str) -> Result<Document> {
        self.documents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}

/// Documents stored as `<root>/<id>.txt`
pub struct DirectoryDocumentStore {
    root: PathBuf,
}

impl DirectoryDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(AppError::validation("document_id", format!("invalid document id '{}'", id)));
        }
        Ok(self.root.join(format!("{}.txt", id)))
    }
}

#[async_trait]
impl DocumentStore for DirectoryDocumentStore {
    async fn get(&self, id: &str) -> Result<Document> {
        let path = self.path_for(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                debug!(document_id = id, path = %path.display(), "Document loaded");
                Ok(Document::new(id, text))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::DocumentNotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("txt") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
