//! Pluggable secret sources.
//!
//! Remote stores are external collaborators: the crate defines the fetch
//! contract and a registry, and callers install adapters for the remote
//! provider kinds they support. The filesystem source is built in; inline,
//! environment, and config references are handled by the resolver itself
//! because they read resolver state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;

use super::format::ValueFormat;
use super::location::SecretProviderKind;
use crate::error::{Error, Result};

/// Raw bytes fetched from a provider, with an optional content-type hint.
#[derive(Debug, Clone)]
pub struct FetchedData {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedData {
    pub fn from_string(s: impl Into<String>) -> Self {
        Self {
            bytes: s.into().into_bytes(),
            content_type: None,
        }
    }
}

/// A source of secret bytes, addressed by a provider-specific string.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch the raw bytes at `address`.
    async fn fetch(&self, address: &str) -> Result<FetchedData>;

    /// Format assumed when neither the location nor the content type names
    /// one.
    fn default_format(&self) -> Option<ValueFormat> {
        None
    }
}

/// Reads secrets from the local filesystem.
pub struct FileSource {
    /// Base directory for relative addresses; defaults to the process cwd
    base_dir: Option<PathBuf>,
}

impl FileSource {
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }
}

impl Default for FileSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretSource for FileSource {
    async fn fetch(&self, address: &str) -> Result<FetchedData> {
        let path = match &self.base_dir {
            Some(base) if !address.starts_with('/') => base.join(address),
            _ => PathBuf::from(address),
        };

        debug!("Reading secret file {}", path.display());
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Resolution(format!("can't read '{}': {e}", path.display())))?;

        Ok(FetchedData {
            bytes,
            content_type: None,
        })
    }
}

/// An in-memory source, used by embedders and tests.
#[derive(Default)]
pub struct MemorySource {
    entries: Mutex<HashMap<String, FetchedData>>,
    default_format: Option<ValueFormat>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_format(format: ValueFormat) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_format: Some(format),
        }
    }

    pub async fn insert(&self, address: impl Into<String>, data: impl Into<String>) {
        self.entries
            .lock()
            .await
            .insert(address.into(), FetchedData::from_string(data.into()));
    }
}

#[async_trait]
impl SecretSource for MemorySource {
    async fn fetch(&self, address: &str) -> Result<FetchedData> {
        self.entries
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| Error::Resolution(format!("no value stored for '{address}'")))
    }

    fn default_format(&self) -> Option<ValueFormat> {
        self.default_format
    }
}

/// Registry of secret sources, populated at startup.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<SecretProviderKind, Arc<dyn SecretSource>>,
}

impl SourceRegistry {
    /// A registry with the built-in filesystem source installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(SecretProviderKind::File, Arc::new(FileSource::new()));
        registry
    }

    /// Install (or replace) the source for a provider kind.
    pub fn register(&mut self, kind: SecretProviderKind, source: Arc<dyn SecretSource>) {
        self.sources.insert(kind, source);
    }

    /// Look up the source for a provider kind.
    pub fn get(&self, kind: SecretProviderKind) -> Result<Arc<dyn SecretSource>> {
        self.sources.get(&kind).cloned().ok_or_else(|| {
            Error::Resolution(format!("no secret source registered for {}", kind.code()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_source_reads_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("s.txt"), "hunter2").unwrap();

        let source = FileSource::with_base_dir(dir.path());
        let data = source.fetch("s.txt").await.unwrap();
        assert_eq!(data.bytes, b"hunter2");
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let source = FileSource::new();
        assert!(source.fetch("/definitely/not/here").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_source() {
        let source = MemorySource::new();
        source.insert("db", "{\"user\":\"pg\"}").await;
        let data = source.fetch("db").await.unwrap();
        assert_eq!(data.bytes, b"{\"user\":\"pg\"}");
        assert!(source.fetch("other").await.is_err());
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = SourceRegistry::with_defaults();
        assert!(registry.get(SecretProviderKind::File).is_ok());
        assert!(registry.get(SecretProviderKind::RemoteSecretStore).is_err());

        registry.register(
            SecretProviderKind::RemoteSecretStore,
            Arc::new(MemorySource::new()),
        );
        assert!(registry.get(SecretProviderKind::RemoteSecretStore).is_ok());
    }
}
