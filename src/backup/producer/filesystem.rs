use crate::backup::function_path;
use crate::backup::producer::{ProduceContext, Producer};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::validate::{validate_dir_exist, validate_valid_file_name};

use bon::Builder;
use derive_more::{Display, From};
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::skip_serializing_none;
use validator::Validate;
use walkdir::{DirEntry, WalkDir};

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::result;
use std::sync::Arc;

static DEFAULT_NAME: &str = "filesystem";

/// Copies the files below `base_path` that match `include_patterns` and none
/// of `exclude_patterns` into the job workspace, keeping their relative
/// layout. The produced artifact is that directory.
///
/// Patterns match paths relative to `base_path`; `*` does not cross `/`.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct FilesystemSource {
    #[validate(custom(function = validate_valid_file_name))]
    #[builder(into)]
    #[getset(skip)]
    name: Option<Arc<str>>,
    #[validate(custom(function = validate_dir_exist))]
    #[builder(into)]
    base_path: PathBuf,
    #[serde(default = "default_globset")]
    #[builder(default = default_globset(), into)]
    include_patterns: Vec<CustomDeserializedGlob>,
    #[serde(default)]
    #[builder(default, into)]
    exclude_patterns: Vec<CustomDeserializedGlob>,
}

fn default_globset() -> Vec<CustomDeserializedGlob> {
    vec![CustomDeserializedGlob::default()]
}

/// A glob pattern wrapper that handles custom deserialization
///
/// Literal separator mode is always on so that `*` stays within one path
/// component.
#[derive(Clone, Debug, From, Display, Serialize, Builder, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct CustomDeserializedGlob {
    #[builder(into)]
    glob: Glob,
}

impl Default for CustomDeserializedGlob {
    fn default() -> Self {
        "**/*".parse().expect("default glob is valid")
    }
}

impl std::str::FromStr for CustomDeserializedGlob {
    type Err = globset::Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        GlobBuilder::new(s)
            .literal_separator(true)
            .build()
            .map(CustomDeserializedGlob::from)
    }
}

struct CustomGlobVisitor;

impl Visitor<'_> for CustomGlobVisitor {
    type Value = CustomDeserializedGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for CustomDeserializedGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(CustomGlobVisitor)
    }
}

/// A file selected for backup, with its path relative to the base directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedFile {
    pub src: PathBuf,
    pub relative: PathBuf,
}

fn build_globset(globs: &[CustomDeserializedGlob]) -> Result<GlobSet> {
    globs
        .iter()
        .fold(GlobSetBuilder::new(), |mut builder, g| {
            builder.add(g.glob.clone());
            builder
        })
        .build()
        .map_err(Error::from)
}

impl FilesystemSource {
    /// Lazily walks `base_path` and yields the files selected by the
    /// include/exclude patterns. Excluded directories are not descended into.
    #[named]
    pub fn matched_files<'a>(&self) -> Result<DynIter<'a, Result<MatchedFile>>> {
        if !self.base_path.is_dir() {
            tracing::error!(
                "Source directory does not exist or is not a directory: {:?}",
                self.base_path
            );
            return Err(Error::from(std::io::Error::other("base_path is not a directory"))
                .add_fn_name(function_path!()));
        }

        tracing::info!(
            "Starting directory scan: {:?} with {} include and {} exclude patterns",
            self.base_path,
            self.include_patterns.len(),
            self.exclude_patterns.len()
        );

        let include = if self.include_patterns.is_empty() {
            build_globset(&default_globset())?
        } else {
            build_globset(&self.include_patterns)?
        };
        let exclude = build_globset(&self.exclude_patterns)?;
        let base = self.base_path.clone();
        let prune_base = self.base_path.clone();
        let prune_exclude = exclude.clone();

        let entries = WalkDir::new(&self.base_path)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |de| {
                !(de.file_type().is_dir()
                    && de
                        .path()
                        .strip_prefix(&prune_base)
                        .is_ok_and(|rel| {
                            !rel.as_os_str().is_empty() && prune_exclude.is_match(rel)
                        }))
            })
            .filter_map(move |res| match res {
                Ok(de) => process_dir_entry(de, &base, &include, &exclude),
                Err(e) => Some(Err(e.into())),
            })
            .map(move |res| res.add_fn_name(function_path!()));

        Ok(entries.into_dyn_iter())
    }
}

fn process_dir_entry<P: AsRef<Path>>(
    de: DirEntry,
    base_dir: P,
    include: &GlobSet,
    exclude: &GlobSet,
) -> Option<Result<MatchedFile>> {
    let p = de.into_path();
    if !p.is_file() {
        tracing::trace!("Skipping {:?} not a file", p);
        return None;
    }

    let relative = match p.strip_prefix(base_dir.as_ref()) {
        Ok(relative) => relative.to_path_buf(),
        Err(e) => {
            return Some(Err(Error::from(e).add_msg(format!(
                "Stripping {:?} from {:?} failed",
                base_dir.as_ref(),
                p
            ))))
        }
    };

    if exclude.is_match(&relative) {
        tracing::trace!("Skipping {:?}, excluded", p);
        return None;
    }
    if !include.is_match(&relative) {
        tracing::trace!("Skipping {:?}, glob not match", p);
        return None;
    }

    tracing::trace!("Including file: {:?}", relative);
    Some(Ok(MatchedFile { src: p, relative }))
}

fn copy_matched_file(file: &MatchedFile, dst_dir: &Path) -> Result<u64> {
    let dst = dst_dir.join(&file.relative);
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&file.src, &dst)
        .map_err(Error::from)
        .add_msg(format!("Copying {:?} to {:?}", file.src, dst))
}

impl Producer for FilesystemSource {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    #[named]
    fn produce(&self, ctx: &ProduceContext) -> Result<PathBuf> {
        let out_dir = ctx.output_dir(self.name())?;
        let cancel = ctx.cancel();

        let mut files = Vec::new();
        for file in self.matched_files()? {
            cancel.check().add_fn_name(function_path!())?;
            files.push(file?);
        }
        tracing::info!(
            "Copying {} files from {:?} into {:?}",
            files.len(),
            self.base_path,
            out_dir
        );

        let results: Vec<Result<u64>> = files
            .par_iter()
            .map(|file| {
                cancel.check()?;
                copy_matched_file(file, &out_dir)
            })
            .collect();

        let mut copied = 0u64;
        let mut errors = Vec::new();
        for res in results {
            match res {
                Ok(bytes) => copied += bytes,
                Err(e) => errors.push(e),
            }
        }
        convert_error_vec(errors).add_fn_name(function_path!())?;

        tracing::info!("Copied {} bytes from {:?}", copied, self.base_path);
        Ok(out_dir)
    }
}
