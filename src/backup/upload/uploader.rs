use crate::backup::cancel::CancellationToken;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::upload::pipe::{pipe, PipeWriter, DEFAULT_CAPACITY, MAX_CHUNK_SIZE};
use crate::backup::upload::progress::{ProgressReader, TransferProgress};
use crate::backup::upload::store::ObjectStore;
use crate::backup::upload::DEFAULT_MAX_CONCURRENCY;
use bon::Builder;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Sender};
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path};
use std::sync::{Arc, Mutex, PoisonError};
use walkdir::WalkDir;

/// Format of the run timestamp that prefixes every object key.
pub static KEY_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

pub fn key_prefix_for(run_time: &DateTime<Utc>) -> String {
    run_time.format(KEY_TIME_FORMAT).to_string()
}

/// Builds `<prefix>/<path relative to root>` with `/` separators.
pub fn object_key(prefix: &str, root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root)?;
    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => Ok(part.to_string_lossy().into_owned()),
            other => Err(Error::invalid_artifact(format!(
                "unexpected path component {other:?} in {path:?}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    if parts.is_empty() {
        return Err(Error::invalid_artifact(format!(
            "{path:?} has no name relative to {root:?}"
        )));
    }
    Ok(std::iter::once(prefix.to_string()).chain(parts).join("/"))
}

/// Streams local files to an [`ObjectStore`].
///
/// Each file is read on its own thread into a bounded [`pipe`] while the
/// store consumes the other end, so a transfer holds at most the pipe buffer
/// plus whatever the store buffers for one part.
#[derive(Debug, Builder, Getters)]
pub struct StreamingUploader {
    #[getset(get = "pub")]
    store: Arc<dyn ObjectStore>,
    #[builder(into)]
    #[getset(get = "pub")]
    key_prefix: String,
    /// Zero means [`DEFAULT_MAX_CONCURRENCY`].
    #[builder(default = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,
}

fn feed_pipe<R: Read>(
    src: &mut R,
    dst: &mut PipeWriter,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        cancel.check()?;
        let n = src.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
}

impl StreamingUploader {
    /// Number of workers used by [`Self::upload_directory`].
    pub fn max_concurrency(&self) -> usize {
        Some(self.max_concurrency)
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }

    /// Same store and limits, keys nested one level deeper under `sub`.
    pub fn scoped(&self, sub: &str) -> StreamingUploader {
        StreamingUploader {
            store: self.store.clone(),
            key_prefix: format!("{}/{}", self.key_prefix, sub),
            max_concurrency: self.max_concurrency,
        }
    }

    /// Uploads one file under `<key_prefix>/<file name>`.
    #[named]
    pub fn upload_file(&self, cancel: &CancellationToken, path: &Path) -> Result<()> {
        let root = path.parent().unwrap_or_else(|| Path::new(""));
        self.upload_relative(cancel, root, path)
            .add_fn_name(function_path!())
    }

    fn upload_relative(&self, cancel: &CancellationToken, root: &Path, path: &Path) -> Result<()> {
        self.transfer(cancel, root, path)
            .map_err(|cause| Error::upload(path.to_path_buf(), cause))
    }

    fn transfer(&self, cancel: &CancellationToken, root: &Path, path: &Path) -> Result<()> {
        cancel.check()?;
        let key = object_key(&self.key_prefix, root, path)?;
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let progress = TransferProgress::new(path, size);
        tracing::debug!("Uploading {:?} ({} bytes) as {:?}", path, size, key);

        let (mut writer, mut reader) = pipe(DEFAULT_CAPACITY);
        let (fed, put) = std::thread::scope(|s| {
            let progress = progress.clone();
            let feeder = s.spawn(move || {
                let mut src = ProgressReader::new(file, progress);
                let res = feed_pipe(&mut src, &mut writer, cancel);
                match &res {
                    Ok(_) => writer.close(),
                    Err(e) => writer.abort(e.to_string()),
                }
                res
            });

            let put = self.store.put_object(&key, &mut reader, Some(size));
            // Unblocks the feeder if the store stopped reading early.
            drop(reader);
            let fed = feeder.join().unwrap_or_else(|_| {
                Err(std::io::Error::other("file reader thread panicked").into())
            });
            (fed, put)
        });

        let sent = match (fed, put) {
            (Err(e), _) if e.is_cancellation() => return Err(e),
            (_, Err(e)) => return Err(e.add_msg(format!("Storing object {key:?}"))),
            (Err(e), Ok(())) => return Err(e),
            (Ok(sent), Ok(())) => sent,
        };
        tracing::info!(
            "Uploaded {:?} to {:?} ({} bytes, {}%)",
            path,
            key,
            sent,
            progress.percent()
        );
        Ok(())
    }

    /// Uploads every regular file below `dir`, keyed relative to `dir`.
    ///
    /// Exactly `max_concurrency` workers pull from a queue of the same
    /// capacity while the walk fills it. The first error stops the walk and
    /// keeps queued files from starting; uploads already running finish.
    #[named]
    pub fn upload_directory(&self, cancel: &CancellationToken, dir: &Path) -> Result<()> {
        let workers = self.max_concurrency();
        let walk_cancel = cancel.child_token();
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let record = |e: Error| {
            tracing::error!("Upload from {:?} failed: {}", dir, e);
            let mut first = first_error.lock().unwrap_or_else(PoisonError::into_inner);
            if first.is_none() {
                *first = Some(e);
            }
            walk_cancel.cancel();
        };

        tracing::info!("Uploading directory {:?} with {} workers", dir, workers);
        let (tx, rx) = channel::bounded::<std::path::PathBuf>(workers);
        std::thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let walk_cancel = &walk_cancel;
                let record = &record;
                s.spawn(move || {
                    for path in rx {
                        if walk_cancel.is_cancelled() {
                            continue;
                        }
                        if let Err(e) = self.upload_relative(cancel, dir, &path) {
                            record(e);
                        }
                    }
                });
            }
            drop(rx);

            let walked = self.enqueue_files(dir, &tx, &walk_cancel);
            drop(tx);
            if let Err(e) = walked {
                record(e);
            }
        });

        match first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(e) => Err(e.add_fn_name(function_path!())),
            None => {
                cancel.check()?;
                Ok(())
            }
        }
    }

    fn enqueue_files(
        &self,
        dir: &Path,
        tx: &Sender<std::path::PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cancelled = cancel.cancelled();
        let deadline = cancel.deadline();
        let mut queued = 0usize;
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            channel::select! {
                send(tx, entry.into_path()) -> res => res?,
                recv(cancelled) -> _ => return cancel.check(),
                recv(deadline) -> _ => return cancel.check(),
            }
            queued += 1;
        }
        tracing::debug!("Queued {} files from {:?}", queued, dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::upload::store::memory::MemoryStore;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn uploader(store: Arc<MemoryStore>, max_concurrency: usize) -> StreamingUploader {
        StreamingUploader::builder()
            .store(store)
            .key_prefix("2024-01-01T00-00-00")
            .max_concurrency(max_concurrency)
            .build()
    }

    #[test]
    fn test_key_prefix_format() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(key_prefix_for(&dt), "2024-01-01T00-00-00");
    }

    #[test]
    fn test_object_key_uses_forward_slashes() {
        let key = object_key(
            "p",
            Path::new("/work/fs"),
            &PathBuf::from("/work/fs").join("a").join("b.txt"),
        )
        .unwrap();
        assert_eq!(key, "p/a/b.txt");
    }

    #[test]
    fn test_object_key_outside_root_fails() {
        assert!(object_key("p", Path::new("/work/fs"), Path::new("/etc/passwd")).is_err());
        assert!(object_key("p", Path::new("/work"), Path::new("/work")).is_err());
    }

    #[test]
    fn test_upload_file_streams_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.tar.xz");
        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let store = Arc::new(MemoryStore::default());

        uploader(store.clone(), 2)
            .upload_file(&CancellationToken::new(), &path)
            .unwrap();

        assert_eq!(
            store.get("2024-01-01T00-00-00/backup.tar.xz").unwrap(),
            data
        );
    }

    #[test]
    fn test_upload_same_file_twice_overwrites_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dump.sql");
        let store = Arc::new(MemoryStore::default());
        let uploader = uploader(store.clone(), 2);

        std::fs::write(&path, "first").unwrap();
        uploader.upload_file(&CancellationToken::new(), &path).unwrap();
        std::fs::write(&path, "second").unwrap();
        uploader.upload_file(&CancellationToken::new(), &path).unwrap();

        assert_eq!(store.keys(), vec!["2024-01-01T00-00-00/dump.sql".to_string()]);
        assert_eq!(store.get("2024-01-01T00-00-00/dump.sql").unwrap(), b"second");
    }

    #[test]
    fn test_scoped_uploader_nests_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dump.sql");
        std::fs::write(&path, "dump").unwrap();
        let store = Arc::new(MemoryStore::default());

        let scoped = uploader(store.clone(), 2).scoped("db");
        assert_eq!(scoped.key_prefix(), "2024-01-01T00-00-00/db");
        scoped.upload_file(&CancellationToken::new(), &path).unwrap();

        assert_eq!(store.keys(), vec!["2024-01-01T00-00-00/db/dump.sql".to_string()]);
    }

    #[test]
    fn test_upload_file_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a");
        std::fs::write(&path, "x").unwrap();
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = uploader(store.clone(), 1)
            .upload_file(&cancel, &path)
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_upload_directory_keys_relative_to_dir() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("fs");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a.txt"), "a").unwrap();
        std::fs::write(dir.join("sub/b.txt"), "b").unwrap();
        let store = Arc::new(MemoryStore::default());

        uploader(store.clone(), 4)
            .upload_directory(&CancellationToken::new(), &dir)
            .unwrap();

        assert_eq!(
            store.keys(),
            vec![
                "2024-01-01T00-00-00/a.txt".to_string(),
                "2024-01-01T00-00-00/sub/b.txt".to_string()
            ]
        );
    }

    #[test]
    fn test_upload_directory_respects_concurrency_limit() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..12 {
            std::fs::write(temp_dir.path().join(format!("f{i:02}")), vec![1u8; 128]).unwrap();
        }
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(30)));

        uploader(store.clone(), 3)
            .upload_directory(&CancellationToken::new(), temp_dir.path())
            .unwrap();

        assert_eq!(store.keys().len(), 12);
        assert!(store.max_in_flight() <= 3);
        assert!(store.max_in_flight() >= 1);
    }

    #[test]
    fn test_zero_concurrency_uses_default() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..12 {
            std::fs::write(temp_dir.path().join(format!("f{i:02}")), vec![1u8; 128]).unwrap();
        }
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(30)));
        let uploader = uploader(store.clone(), 0);
        assert_eq!(uploader.max_concurrency(), DEFAULT_MAX_CONCURRENCY);

        uploader
            .upload_directory(&CancellationToken::new(), temp_dir.path())
            .unwrap();

        assert_eq!(store.keys().len(), 12);
        assert!(store.max_in_flight() > 1);
        assert!(store.max_in_flight() <= DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn test_upload_directory_cancelled_midway() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..40 {
            std::fs::write(temp_dir.path().join(format!("f{i:02}")), "x").unwrap();
        }
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(30)));
        let cancel = CancellationToken::new();

        let res = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(60));
                cancel.cancel();
            });
            uploader(store.clone(), 2).upload_directory(&cancel, temp_dir.path())
        });

        assert!(res.unwrap_err().is_cancellation());
        assert!(store.puts() > 0);
        assert!(store.puts() < 40);
    }

    #[test]
    fn test_upload_directory_returns_first_error_and_stops() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..20 {
            std::fs::write(temp_dir.path().join(format!("f{i:02}")), "x").unwrap();
        }
        let store = Arc::new(MemoryStore::failing_on("f00"));

        let err = uploader(store.clone(), 1)
            .upload_directory(&CancellationToken::new(), temp_dir.path())
            .unwrap_err();

        assert!(err.to_string().contains("rejected"));
        // One worker: the failure on the first file stops everything queued.
        assert!(store.puts() < 20);
    }

    #[test]
    fn test_upload_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());

        uploader(store.clone(), 2)
            .upload_directory(&CancellationToken::new(), temp_dir.path())
            .unwrap();
        assert!(store.keys().is_empty());
    }
}
