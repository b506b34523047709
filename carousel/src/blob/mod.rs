//! Blob storage adapter for request and result collections.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{CarouselError, Result};
use crate::job::{BatchRequest, JobId};

pub mod jsonl;

/// Storage for input and output collections, addressed by opaque references.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Read the raw contents behind a reference.
    async fn get(&self, reference: &str) -> Result<Vec<u8>>;

    /// Write raw contents under a reference, replacing anything already there.
    async fn put(&self, reference: &str, contents: Vec<u8>) -> Result<()>;

    /// Read and validate the request collection behind `input_ref`.
    async fn read_requests(&self, input_ref: &str, model: &str) -> Result<Vec<BatchRequest>> {
        let contents = self.get(input_ref).await?;
        jsonl::parse_requests(input_ref, &contents, Some(model))
    }

    /// Persist a job's results and return the output reference.
    async fn write_results(&self, job_id: JobId, requests: &[BatchRequest]) -> Result<String> {
        let output_ref = output_ref_for(job_id);
        let contents = jsonl::render_results(job_id, requests)?;
        self.put(&output_ref, contents).await?;
        Ok(output_ref)
    }
}

/// Reference under which a job's results are written.
pub fn output_ref_for(job_id: JobId) -> String {
    format!("batch_{}_output.jsonl", job_id)
}

/// Blob store backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a reference to a path under the root, refusing anything that escapes it.
    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let relative = Path::new(reference);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if reference.is_empty() || escapes {
            return Err(CarouselError::Blob(format!(
                "Invalid blob reference '{}'",
                reference
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.resolve(reference)?;
        tokio::fs::read(&path).await.map_err(|e| {
            CarouselError::Blob(format!("Failed to read {}: {}", path.display(), e))
        })
    }

    async fn put(&self, reference: &str, contents: Vec<u8>) -> Result<()> {
        let path = self.resolve(reference)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial collection
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Blob store held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob directly, typically an input collection in tests.
    pub fn insert(&self, reference: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.blobs.insert(reference.into(), contents.into());
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.blobs.contains_key(reference)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(reference)
            .map(|blob| blob.value().clone())
            .ok_or_else(|| CarouselError::Blob(format!("Blob '{}' not found", reference)))
    }

    async fn put(&self, reference: &str, contents: Vec<u8>) -> Result<()> {
        self.blobs.insert(reference.to_string(), contents);
        Ok(())
    }
}
