use crate::backup::cancel::CancellationToken;
use crate::backup::codec::{Archive, Codec};
use crate::backup::compress::{CompressionConfig, CompressorBuilder};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::function_path;
use crate::backup::producer::Artifact;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use function_name::named;
use itertools::Itertools;
use std::fs::File;
use std::io::{BufWriter, IntoInnerError, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::HeaderMode;
use walkdir::WalkDir;

static TAR_FILE_EXT: &str = "tar";

/// Writes a tar stream through the configured compressor.
///
/// Every artifact lands under `<source name>/`. Headers carry no owner or
/// timestamp data, so the same inputs always give the same bytes.
#[derive(Clone, Debug)]
pub struct TarCodec {
    compression: CompressionConfig,
    archive_name: Arc<str>,
}

impl TarCodec {
    pub fn new<S: Into<Arc<str>>>(compression: CompressionConfig, archive_name: S) -> Result<Self> {
        if !compression.is_enabled() {
            return Err(Error::config("tar codec needs a compression format"));
        }
        Ok(Self {
            compression,
            archive_name: archive_name.into(),
        })
    }

    fn append_artifact<W: Write>(
        builder: &mut tar::Builder<W>,
        cancel: &CancellationToken,
        artifact: &Artifact,
    ) -> Result<()> {
        let prefix = Path::new(artifact.source_name().as_ref());
        if !artifact.is_dir() {
            let file_name = artifact.path().file_name().ok_or_else(|| {
                Error::invalid_artifact(format!("{:?} has no file name", artifact.path()))
            })?;
            builder.append_path_with_name(artifact.path(), prefix.join(file_name))?;
            return Ok(());
        }

        for entry in WalkDir::new(artifact.path()).sort_by_file_name() {
            cancel.check()?;
            let entry = entry?;
            let relative = entry.path().strip_prefix(artifact.path())?;
            let name = prefix.join(relative);
            if entry.file_type().is_dir() {
                builder.append_dir(&name, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), &name)?;
            }
        }
        Ok(())
    }

    fn write_archive(
        &self,
        cancel: &CancellationToken,
        inputs: &[&Artifact],
        path: &Path,
    ) -> Result<()> {
        let writer = File::create_new(path)
            .map(BufWriter::new)
            .map_err(Error::from)
            .and_then(|f| self.compression.build_compressor(f))
            .map(BufWriter::new)?;
        let mut builder = tar::Builder::new(writer);
        builder.mode(HeaderMode::Deterministic);
        builder.follow_symlinks(true);

        for artifact in inputs {
            cancel.check()?;
            tracing::debug!(
                "Adding {:?} from {:?} to archive",
                artifact.path(),
                artifact.source_name()
            );
            Self::append_artifact(&mut builder, cancel, artifact)
                .add_msg(format!("Adding artifact of {:?}", artifact.source_name()))?;
        }

        builder
            .into_inner()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .sync_all()?;
        Ok(())
    }
}

impl FileExtProvider for TarCodec {
    fn file_ext(&self) -> Option<&str> {
        self.compression.file_ext()
    }
}

impl Codec for TarCodec {
    fn file_ext(&self) -> String {
        std::iter::once(TAR_FILE_EXT)
            .chain(FileExtProvider::file_ext(self))
            .join(".")
    }

    #[named]
    fn compress(
        &self,
        cancel: &CancellationToken,
        inputs: &[Artifact],
        out_dir: &Path,
    ) -> Result<Archive> {
        let sorted = inputs
            .iter()
            .sorted_by(|a, b| a.source_name().cmp(b.source_name()))
            .collect_vec();
        let file_name = format!("{}.{}", self.archive_name, Codec::file_ext(self));
        let final_path = out_dir.join(&file_name);
        let tmp_path = PathBuf::from(format!("{}.tmp", final_path.display()));

        tracing::info!(
            "Compressing {} artifacts into {:?} ({}, level {})",
            sorted.len(),
            final_path,
            self.compression.format,
            self.compression.effective_level()
        );
        if let Err(e) = self.write_archive(cancel, &sorted, &tmp_path) {
            if let Err(remove_err) = std::fs::remove_file(&tmp_path) {
                tracing::warn!("Failed to remove partial archive {:?}: {}", tmp_path, remove_err);
            }
            return Err(e.add_fn_name(function_path!()));
        }

        std::fs::rename(&tmp_path, &final_path)
            .map_err(Error::from)
            .add_msg(format!("Renaming {tmp_path:?} to {final_path:?}"))?;
        let size = std::fs::metadata(&final_path)?.len();
        tracing::info!("Archive {:?} written ({} bytes)", final_path, size);
        Ok(Archive::new(final_path, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compress::CompressionFormat;
    use flate2::read::GzDecoder;
    use liblzma::read::XzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn compression(format: CompressionFormat) -> CompressionConfig {
        CompressionConfig {
            format,
            level: Some(1),
            threads: Some(1),
        }
    }

    fn artifacts(dir: &Path) -> Vec<Artifact> {
        let db = dir.join("db");
        let fs = dir.join("fs");
        std::fs::create_dir_all(&db).unwrap();
        std::fs::create_dir_all(fs.join("sub")).unwrap();
        std::fs::write(db.join("dump.sql"), "CREATE TABLE t;").unwrap();
        std::fs::write(fs.join("a.txt"), "a").unwrap();
        std::fs::write(fs.join("sub/b.txt"), "b").unwrap();
        // Deliberately unsorted.
        vec![
            Artifact::inspect("fs", &fs).unwrap(),
            Artifact::inspect("db", db.join("dump.sql")).unwrap(),
        ]
    }

    fn entry_names<R: Read>(reader: R) -> Vec<String> {
        tar::Archive::new(reader)
            .entries()
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_file_ext() {
        let codec = TarCodec::new(compression(CompressionFormat::Gzip), "backup").unwrap();
        assert_eq!(Codec::file_ext(&codec), "tar.gz");
        let codec = TarCodec::new(compression(CompressionFormat::Xz), "backup").unwrap();
        assert_eq!(Codec::file_ext(&codec), "tar.xz");
        let codec = TarCodec::new(compression(CompressionFormat::Zstd), "backup").unwrap();
        assert_eq!(Codec::file_ext(&codec), "tar.zst");
    }

    #[test]
    fn test_zstd_archive_decodes() {
        let input_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let inputs = artifacts(input_dir.path());
        let codec = TarCodec::new(compression(CompressionFormat::Zstd), "backup").unwrap();

        let archive = codec
            .compress(&CancellationToken::new(), &inputs, out_dir.path())
            .unwrap();
        assert_eq!(archive.path(), &out_dir.path().join("backup.tar.zst"));

        let decoder =
            zstd::stream::read::Decoder::new(File::open(archive.path()).unwrap()).unwrap();
        assert_eq!(
            entry_names(decoder),
            vec!["db/dump.sql", "fs", "fs/a.txt", "fs/sub", "fs/sub/b.txt"]
        );
    }

    #[test]
    fn test_none_format_is_rejected() {
        let res = TarCodec::new(compression(CompressionFormat::None), "backup");
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_compress_sorts_by_source_name() {
        let input_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let inputs = artifacts(input_dir.path());
        let codec = TarCodec::new(compression(CompressionFormat::Xz), "backup").unwrap();

        let archive = codec
            .compress(&CancellationToken::new(), &inputs, out_dir.path())
            .unwrap();
        assert_eq!(archive.path(), &out_dir.path().join("backup.tar.xz"));
        assert!(archive.size() > 0);
        assert!(!out_dir.path().join("backup.tar.xz.tmp").exists());

        let names = entry_names(XzDecoder::new(File::open(archive.path()).unwrap()));
        assert_eq!(
            names,
            vec!["db/dump.sql", "fs", "fs/a.txt", "fs/sub", "fs/sub/b.txt"]
        );
    }

    #[test]
    fn test_compress_is_reproducible() {
        let input_dir = TempDir::new().unwrap();
        let inputs = artifacts(input_dir.path());
        let codec = TarCodec::new(compression(CompressionFormat::Gzip), "backup").unwrap();

        let first_dir = TempDir::new().unwrap();
        let second_dir = TempDir::new().unwrap();
        let first = codec
            .compress(&CancellationToken::new(), &inputs, first_dir.path())
            .unwrap();
        let mut reversed = inputs.clone();
        reversed.reverse();
        let second = codec
            .compress(&CancellationToken::new(), &reversed, second_dir.path())
            .unwrap();

        assert_eq!(
            std::fs::read(first.path()).unwrap(),
            std::fs::read(second.path()).unwrap()
        );
        let names = entry_names(GzDecoder::new(File::open(first.path()).unwrap()));
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_cancelled_compress_leaves_no_file() {
        let input_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let inputs = artifacts(input_dir.path());
        let codec = TarCodec::new(compression(CompressionFormat::Zlib), "backup").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = codec.compress(&cancel, &inputs, out_dir.path()).unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(std::fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }
}
