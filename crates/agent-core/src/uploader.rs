//! Output file upload after a successful run (spec §4.H), grounded on
//! `examples/original_source/src/nanogrid_agent/output_uploader.py`.

use std::io::Read;

use tracing::{debug, info, warn};

use crate::fetcher::ObjectStore;
use crate::pool::ContainerRuntime;

/// Copies a container's `<work_dir>/<request_id>/output` directory out via
/// `get_archive` and pushes every file under it to
/// `<s3_prefix>/<request_id>/<relative>`. Disabled entirely when
/// `config.output.enabled` is false. Every failure is logged and
/// swallowed — an upload problem must never turn a successful task into a
/// failed one.
///
/// Takes the container runtime as a borrowed trait object per call rather
/// than owning one, since the caller (the executor) must run this against
/// the same still-checked-out container it is about to release.
pub struct OutputUploader<S: ObjectStore> {
    store: S,
    enabled: bool,
    user_data_bucket: String,
    s3_prefix: String,
}

impl<S: ObjectStore> OutputUploader<S> {
    pub fn new(
        store: S,
        enabled: bool,
        user_data_bucket: impl Into<String>,
        s3_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            enabled,
            user_data_bucket: user_data_bucket.into(),
            s3_prefix: s3_prefix.into(),
        }
    }

    pub async fn upload_output_files(
        &self,
        runtime: &dyn ContainerRuntime,
        request_id: &str,
        container_id: &str,
        container_work_dir: &str,
    ) -> Vec<String> {
        if !self.enabled {
            debug!("output file upload is disabled");
            return Vec::new();
        }
        if self.user_data_bucket.is_empty() {
            warn!("user_data_bucket not configured, skipping upload");
            return Vec::new();
        }

        let container_output_path = format!("{container_work_dir}/output");
        let archive = match runtime.get_archive(container_id, &container_output_path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                debug!(container_output_path, "no output directory found in container");
                return Vec::new();
            }
            Err(err) => {
                warn!(error = %err, "failed to check/copy container output directory");
                return Vec::new();
            }
        };

        let files = match extract_tar_entries(&archive) {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "failed to read output archive");
                return Vec::new();
            }
        };

        let mut uploaded = Vec::new();
        for (relative_path, contents) in files {
            let s3_key = format!("{}/{}/{}", self.s3_prefix, request_id, relative_path.display());
            match self.store.put_object(&self.user_data_bucket, &s3_key, contents).await {
                Ok(()) => {
                    let url = format!("s3://{}/{}", self.user_data_bucket, s3_key);
                    info!(file = %relative_path.display(), s3_key, "uploaded output file");
                    uploaded.push(url);
                }
                Err(err) => {
                    warn!(error = %err, s3_key, "failed to upload output file");
                }
            }
        }

        if !uploaded.is_empty() {
            info!(count = uploaded.len(), request_id, "uploaded output files");
        }
        uploaded
    }
}

/// Reads every regular file out of a tar archive (as returned by
/// `get_archive`), stripping a leading `output/` path component if
/// present, since Docker's archive API includes the requested directory
/// itself as the tar root.
fn extract_tar_entries(archive: &[u8]) -> std::io::Result<Vec<(std::path::PathBuf, Vec<u8>)>> {
    let mut tar = tar::Archive::new(archive);
    let mut files = Vec::new();
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let relative = path.strip_prefix("output").unwrap_or(&path).to_path_buf();
        if relative.as_os_str().is_empty() {
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.push((relative, contents));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ContainerRuntimeError, FetchError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io::Write;
    use std::sync::Mutex;

    struct FakeRuntime {
        archive: Mutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_and_start(
            &self,
            _image: &str,
            _name: &str,
            _binds: &[(String, String)],
            _cmd: &[&str],
        ) -> Result<String, ContainerRuntimeError> {
            unimplemented!()
        }
        async fn pause(&self, _container_id: &str) -> Result<(), ContainerRuntimeError> {
            unimplemented!()
        }
        async fn unpause(&self, _container_id: &str) -> Result<(), ContainerRuntimeError> {
            unimplemented!()
        }
        async fn stop(&self, _container_id: &str, _timeout_secs: u32) -> Result<(), ContainerRuntimeError> {
            unimplemented!()
        }
        async fn remove(&self, _container_id: &str, _force: bool) -> Result<(), ContainerRuntimeError> {
            unimplemented!()
        }
        async fn is_running(&self, _container_id: &str) -> Result<bool, ContainerRuntimeError> {
            unimplemented!()
        }
        async fn exec(
            &self,
            _container_id: &str,
            _work_dir: &str,
            _cmd: &[&str],
            _stdin: Option<&[u8]>,
        ) -> Result<(i64, Vec<u8>, Vec<u8>), ContainerRuntimeError> {
            unimplemented!()
        }
        async fn memory_usage_bytes(&self, _container_id: &str) -> Result<Option<u64>, ContainerRuntimeError> {
            unimplemented!()
        }
        async fn get_archive(&self, _container_id: &str, _path: &str) -> Result<Bytes, ContainerRuntimeError> {
            Ok(self.archive.lock().unwrap().clone().map(Bytes::from).unwrap_or_default())
        }
        async fn put_archive(&self, _container_id: &str, _path: &str, _archive: Bytes) -> Result<(), ContainerRuntimeError> {
            unimplemented!()
        }
    }

    struct FakeObjectStore {
        uploaded: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        async fn get_object(&self, _bucket: &str, _key: &str) -> Result<Bytes, FetchError> {
            unimplemented!()
        }
        async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), FetchError> {
            self.uploaded.lock().unwrap().push((bucket.to_string(), key.to_string(), body));
            Ok(())
        }
    }

    fn tar_with_entries(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            for (name, content) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, *content).unwrap();
            }
            builder.finish().unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn uploads_every_file_under_the_output_directory() {
        let archive = tar_with_entries(&[("output/a.txt", b"hello"), ("output/nested/b.txt", b"world")]);
        let runtime = FakeRuntime { archive: Mutex::new(Some(archive)) };
        let store = FakeObjectStore { uploaded: Mutex::new(Vec::new()) };
        let uploader = OutputUploader::new(store, true, "bucket", "outputs");

        let urls = uploader.upload_output_files(&runtime, "r1", "c1", "/workspace-root/r1").await;
        assert_eq!(urls.len(), 2);
        assert!(urls.iter().any(|u| u.ends_with("outputs/r1/a.txt")));
    }

    #[tokio::test]
    async fn disabled_returns_empty_without_touching_runtime_or_store() {
        let runtime = FakeRuntime { archive: Mutex::new(None) };
        let store = FakeObjectStore { uploaded: Mutex::new(Vec::new()) };
        let uploader = OutputUploader::new(store, false, "bucket", "outputs");

        let urls = uploader.upload_output_files(&runtime, "r1", "c1", "/workspace-root/r1").await;
        assert!(urls.is_empty());
    }

    #[tokio::test]
    async fn missing_bucket_skips_upload() {
        let runtime = FakeRuntime { archive: Mutex::new(Some(tar_with_entries(&[("output/a.txt", b"x")]))) };
        let store = FakeObjectStore { uploaded: Mutex::new(Vec::new()) };
        let uploader = OutputUploader::new(store, true, "", "outputs");

        let urls = uploader.upload_output_files(&runtime, "r1", "c1", "/workspace-root/r1").await;
        assert!(urls.is_empty());
    }

    #[tokio::test]
    async fn empty_archive_yields_no_uploads() {
        let runtime = FakeRuntime { archive: Mutex::new(None) };
        let store = FakeObjectStore { uploaded: Mutex::new(Vec::new()) };
        let uploader = OutputUploader::new(store, true, "bucket", "outputs");

        let urls = uploader.upload_output_files(&runtime, "r1", "c1", "/workspace-root/r1").await;
        assert!(urls.is_empty());
    }
}
