//! Code bundle retrieval and extraction (spec §4.C), grounded on
//! `examples/original_source/src/nanogrid_agent/s3_service.py` for the
//! download/extract/cleanup sequence, and on the pack's `BlobStore` trait
//! shape (`examples/adamtc007-ob-poc/rust/crates/ob-workflow/src/blob_store.rs`)
//! for the storage abstraction.

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use nanogrid_agent_types::Task;
use tracing::{info, warn};

use crate::error::FetchError;

/// Abstract object storage, small enough that tests can fake it entirely
/// in memory instead of standing up a real S3 bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), FetchError>;
}

pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| FetchError::ObjectStore(e.into_service_error().to_string()))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| FetchError::ObjectStore(e.to_string()))?
            .into_bytes();
        Ok(bytes)
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), FetchError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body.into())
            .send()
            .await
            .map_err(|e| FetchError::ObjectStore(e.into_service_error().to_string()))?;
        Ok(())
    }
}

/// Downloads a task's code bundle and expands it into a fresh working
/// directory, the Rust counterpart of `S3CodeStorageService`.
pub struct CodeFetcher<S: ObjectStore> {
    store: S,
    task_base_dir: PathBuf,
    default_code_bucket: String,
}

impl<S: ObjectStore> CodeFetcher<S> {
    pub fn new(store: S, task_base_dir: impl Into<PathBuf>, default_code_bucket: impl Into<String>) -> Self {
        Self {
            store,
            task_base_dir: task_base_dir.into(),
            default_code_bucket: default_code_bucket.into(),
        }
    }

    /// Download `task`'s code bundle and extract it under
    /// `<task_base_dir>/<request_id>`, returning that directory. Any
    /// previous contents at that path are wiped first so retried tasks
    /// never see a stale bundle.
    pub async fn prepare_working_directory(&self, task: &Task) -> Result<PathBuf, FetchError> {
        let bucket = if task.s3_bucket.is_empty() {
            self.default_code_bucket.as_str()
        } else {
            task.s3_bucket.as_str()
        };
        let key = task.s3_key.as_str();

        info!(request_id = %task.request_id, s3_bucket = bucket, s3_key = key, "preparing working directory");

        let work_dir = self.task_base_dir.join(&task.request_id);
        if work_dir.exists() {
            std::fs::remove_dir_all(&work_dir)?;
        }
        std::fs::create_dir_all(&work_dir)?;

        let archive = self.store.get_object(bucket, key).await?;
        let extracted = extract_zip(&archive, &work_dir)?;

        info!(work_dir = %work_dir.display(), extracted, "prepared working directory");
        Ok(work_dir)
    }
}

/// Extracts a zip archive into `target_dir`, skipping any entry whose
/// resolved path would escape it. Returns the number of files written.
fn extract_zip(archive: &[u8], target_dir: &Path) -> Result<usize, FetchError> {
    let reader = std::io::Cursor::new(archive);
    let mut zip = zip::ZipArchive::new(reader)?;
    let mut extracted = 0;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "suspicious zip entry, skipping");
            continue;
        };
        let target_path = target_dir.join(&relative);
        if !target_path.starts_with(target_dir) {
            warn!(entry = entry.name(), "suspicious zip entry, skipping");
            continue;
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target_path)?;
            continue;
        }
        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        std::fs::write(&target_path, buf)?;
        extracted += 1;
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    pub struct InMemoryObjectStore {
        objects: Mutex<std::collections::HashMap<(String, String), Bytes>>,
    }

    impl InMemoryObjectStore {
        pub fn new() -> Self {
            Self { objects: Mutex::new(std::collections::HashMap::new()) }
        }

        pub fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), Bytes::from(bytes));
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryObjectStore {
        async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| FetchError::ObjectStore(format!("NoSuchKey: {bucket}/{key}")))
        }

        async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), FetchError> {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), Bytes::from(body));
            Ok(())
        }
    }

    fn zip_with_entries(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options: zip::write::FileOptions<'_, ()> = zip::write::FileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    fn sample_task(bucket: &str, key: &str) -> Task {
        Task {
            request_id: "r1".into(),
            function_id: "f1".into(),
            runtime: "python".into(),
            s3_bucket: bucket.into(),
            s3_key: key.into(),
            timeout_ms: 10_000,
            memory_mb: None,
            input: None,
        }
    }

    #[tokio::test]
    async fn extracts_all_files_into_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        store.put("bucket", "f1/v1.zip", zip_with_entries(&[
            ("main.py", b"print('hi')"),
            ("lib/util.py", b"x = 1"),
        ]));
        let fetcher = CodeFetcher::new(store, dir.path(), "default-bucket");
        let task = sample_task("bucket", "f1/v1.zip");

        let work_dir = fetcher.prepare_working_directory(&task).await.unwrap();
        assert!(work_dir.join("main.py").exists());
        assert!(work_dir.join("lib/util.py").exists());
    }

    #[tokio::test]
    async fn falls_back_to_default_bucket_when_task_omits_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        store.put("default-bucket", "f1/v1.zip", zip_with_entries(&[("main.py", b"x")]));
        let fetcher = CodeFetcher::new(store, dir.path(), "default-bucket");
        let task = sample_task("", "f1/v1.zip");

        let work_dir = fetcher.prepare_working_directory(&task).await.unwrap();
        assert!(work_dir.join("main.py").exists());
    }

    #[tokio::test]
    async fn wipes_stale_contents_from_a_previous_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        store.put("bucket", "f1/v1.zip", zip_with_entries(&[("main.py", b"new")]));
        let fetcher = CodeFetcher::new(store, dir.path(), "bucket");
        let task = sample_task("bucket", "f1/v1.zip");

        let work_dir = dir.path().join("r1");
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::write(work_dir.join("stale.txt"), b"leftover").unwrap();

        fetcher.prepare_working_directory(&task).await.unwrap();
        assert!(!work_dir.join("stale.txt").exists());
        assert!(work_dir.join("main.py").exists());
    }

    #[tokio::test]
    async fn missing_object_surfaces_as_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        let fetcher = CodeFetcher::new(store, dir.path(), "bucket");
        let task = sample_task("bucket", "missing.zip");

        let err = fetcher.prepare_working_directory(&task).await.unwrap_err();
        assert!(err.to_string().contains("NoSuchKey"));
    }
}
