use crate::backup::job::JobPhase;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;
use thiserror_ext::Construct;

#[derive(Error, Debug, Construct)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    StripPrefix(#[from] std::path::StripPrefixError),
    #[error(transparent)]
    RusotoTls(#[from] rusoto_core::request::TlsError),
    #[error("{0}")]
    ChannelSendError(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("{0}")]
    ProcessExit(String),
    #[error("{0}")]
    InvalidArtifact(String),
    #[error("object store request failed: {0}")]
    ObjectStore(String),
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("producer {:?} failed:\n{}", source_name, indent::indent_all_with("  ", cause.to_string()))]
    Producer {
        source_name: String,
        cause: Box<Error>,
    },
    #[error("codec failed:\n{}", indent::indent_all_with("  ", cause.to_string()))]
    Codec { cause: Box<Error> },
    #[error("upload of {:?} failed:\n{}", local_path, indent::indent_all_with("  ", cause.to_string()))]
    Upload {
        local_path: PathBuf,
        cause: Box<Error>,
    },
    #[error("cleanup failed:\n{}", indent::indent_all_with("  ", cause.to_string()))]
    Cleanup { cause: Box<Error> },
    #[error(
        "backup job failed during {} (failed producers: [{}]):\n{}",
        phase,
        failed_producers.join(", "),
        indent::indent_all_with("  ", cause.to_string())
    )]
    JobFailed {
        phase: JobPhase,
        failed_producers: Vec<String>,
        cause: Box<Error>,
    },
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Error::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<D: Debug> From<crossbeam::channel::SendError<D>> for Error {
    fn from(value: crossbeam::channel::SendError<D>) -> Self {
        Self::ChannelSendError(format!("Failed to send {:?}", value.0))
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// True when the error, or anything it wraps, comes from cancellation.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled | Error::DeadlineExceeded => true,
            Error::Producer { cause, .. }
            | Error::Codec { cause }
            | Error::Upload { cause, .. }
            | Error::Cleanup { cause }
            | Error::JobFailed { cause, .. } => cause.is_cancellation(),
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => {
                error.is_cancellation()
            }
            Error::LotsOfError(v) => v.iter().any(Error::is_cancellation),
            _ => false,
        }
    }
}
