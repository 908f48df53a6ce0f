use crate::backup::function_path;
use crate::backup::producer::{ProduceContext, Producer};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::validate::{validate_sql_file, validate_valid_file_name};
use bon::Builder;
use function_name::named;
use getset::{CopyGetters, Getters};
use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

static DEFAULT_NAME: &str = "sqlite";
static BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(250);

fn default_pages_per_step() -> i32 {
    1024
}

/// Online copy of a SQLite database through the SQLite backup API.
///
/// The copy is taken in steps of `pages_per_step` pages so cancellation is
/// honoured between steps, and writers on the live database are only blocked
/// for the duration of one step.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct SqliteSource {
    #[validate(custom(function = validate_valid_file_name))]
    #[builder(into)]
    name: Option<Arc<str>>,
    #[validate(custom(function = validate_sql_file))]
    #[builder(into)]
    #[getset(get = "pub")]
    src: PathBuf,
    #[serde(default = "default_pages_per_step")]
    #[builder(default = default_pages_per_step())]
    #[validate(range(min = 1))]
    #[getset(get_copy = "pub")]
    pages_per_step: i32,
}

impl Producer for SqliteSource {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    #[named]
    fn produce(&self, ctx: &ProduceContext) -> Result<PathBuf> {
        let cancel = ctx.cancel();
        cancel.check()?;
        let out_dir = ctx.output_dir(self.name())?;
        let dst_path = out_dir.join(format!("{}.sqlite3", self.name()));

        let src = Connection::open_with_flags(
            &self.src,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(Error::from)
        .add_msg(format!("Opening {:?}", self.src))
        .add_fn_name(function_path!())?;
        let mut dst = Connection::open(&dst_path)
            .map_err(Error::from)
            .add_msg(format!("Opening {:?}", dst_path))
            .add_fn_name(function_path!())?;

        tracing::info!("Copying sqlite database {:?} into {:?}", self.src, dst_path);
        {
            let backup = Backup::new(&src, &mut dst)?;
            loop {
                cancel.check().add_fn_name(function_path!())?;
                match backup.step(self.pages_per_step)? {
                    StepResult::Done => break,
                    StepResult::More => {
                        let progress = backup.progress();
                        tracing::debug!(
                            "sqlite backup of {:?}: {} of {} pages remaining",
                            self.src,
                            progress.remaining,
                            progress.pagecount
                        );
                    }
                    StepResult::Busy | StepResult::Locked => {
                        tracing::debug!("{:?} is busy, retrying", self.src);
                        cancel.sleep(BUSY_RETRY_INTERVAL)?;
                    }
                    _ => cancel.sleep(BUSY_RETRY_INTERVAL)?,
                }
            }
        }

        tracing::info!("sqlite database copied to {:?}", dst_path);
        Ok(dst_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::cancel::CancellationToken;
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_db(path: &std::path::Path, rows: usize) {
        let conn = Connection::open(path).unwrap();
        conn.execute("CREATE TABLE item (id INTEGER PRIMARY KEY, body TEXT)", [])
            .unwrap();
        for i in 0..rows {
            conn.execute(
                "INSERT INTO item (body) VALUES (?1)",
                [format!("row-{i}")],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_produce_copies_database() {
        let temp_dir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let db = temp_dir.path().join("app.db");
        create_db(&db, 200);

        let source = SqliteSource::builder()
            .name("app")
            .src(&db)
            .pages_per_step(1)
            .build();
        assert!(source.validate().is_ok());
        let cancel = CancellationToken::new();
        let ctx = ProduceContext::new(workspace.path(), &cancel, Utc::now());

        let out = source.produce(&ctx).unwrap();
        assert_eq!(out, workspace.path().join("app").join("app.sqlite3"));

        let conn = Connection::open(out).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM item", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 200);
    }

    #[test]
    fn test_produce_cancelled_before_start() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("app.db");
        create_db(&db, 1);

        let source = SqliteSource::builder().src(&db).build();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = ProduceContext::new(temp_dir.path(), &cancel, Utc::now());

        assert!(matches!(source.produce(&ctx), Err(Error::Cancelled)));
    }

    #[test]
    fn test_default_name_and_validation() {
        let temp_dir = TempDir::new().unwrap();
        let yaml = format!("src: {:?}\n", temp_dir.path().join("missing.db"));
        let source: SqliteSource = serde_yml::from_str(&yaml).unwrap();

        assert_eq!(source.name(), "sqlite");
        assert_eq!(source.pages_per_step(), 1024);
        assert!(source.validate().is_err());
    }
}
