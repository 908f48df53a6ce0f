use crate::backup::cancel::CancellationToken;
use crate::backup::function_path;
use crate::backup::producer::{ProduceContext, Producer};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::validate::validate_valid_file_name;
use bon::Builder;
use function_name::named;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::ffi::OsString;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

static DEFAULT_NAME: &str = "mysql";
static DEFAULT_DUMP_COMMAND: &str = "mysqldump";
static CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn default_port() -> u16 {
    3306
}

/// Dumps one MySQL/MariaDB database with `mysqldump`.
///
/// When `docker_container` is set the dump runs through `docker exec` inside
/// that container. The password never appears on a command line: it is passed
/// through the `MYSQL_PWD` environment variable.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct MysqlSource {
    #[validate(custom(function = validate_valid_file_name))]
    #[builder(into)]
    #[getset(skip)]
    name: Option<Arc<str>>,
    #[validate(length(min = 1))]
    #[builder(into)]
    host: String,
    #[serde(default = "default_port")]
    #[builder(default = default_port())]
    port: u16,
    #[validate(length(min = 1))]
    #[builder(into)]
    user: String,
    #[validate(nested)]
    #[builder(into)]
    password: Option<RedactedString>,
    #[validate(length(min = 1))]
    #[builder(into)]
    database: String,
    #[builder(into)]
    docker_container: Option<String>,
    #[builder(into)]
    dump_command: Option<PathBuf>,
}

impl MysqlSource {
    fn dump_args(&self) -> Vec<OsString> {
        [
            "--single-transaction",
            "--extended-insert",
            "--create-options",
            "--quick",
            "-h",
            self.host.as_str(),
            "-P",
            &self.port.to_string(),
            "-u",
            self.user.as_str(),
            self.database.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect()
    }

    /// Builds the dump command without any stdio wiring.
    pub fn command(&self) -> Command {
        let dump = self
            .dump_command
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DUMP_COMMAND));

        let mut cmd = match &self.docker_container {
            Some(container) => {
                let mut cmd = Command::new("docker");
                cmd.arg("exec");
                if self.password.is_some() {
                    // Forwarded from this process' environment.
                    cmd.args(["-e", "MYSQL_PWD"]);
                }
                cmd.arg(container).arg(dump);
                cmd
            }
            None => Command::new(dump),
        };
        cmd.args(self.dump_args());
        if let Some(password) = &self.password {
            cmd.env("MYSQL_PWD", password.inner());
        }
        cmd
    }
}

/// Waits for `child`, killing it if `cancel` fires first.
pub(crate) fn wait_or_kill(child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Err(e) = cancel.sleep(CHILD_POLL_INTERVAL) {
            tracing::warn!("Killing child process {} after cancellation", child.id());
            if let Err(kill_err) = child.kill() {
                tracing::warn!("Failed to kill child process {}: {kill_err}", child.id());
            }
            let _ = child.wait();
            return Err(e);
        }
    }
}

impl Producer for MysqlSource {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    #[named]
    fn produce(&self, ctx: &ProduceContext) -> Result<PathBuf> {
        ctx.cancel().check()?;
        let out_dir = ctx.output_dir(self.name())?;
        let file_path = out_dir.join(format!("{}_{}.sql", self.name(), ctx.timestamp()));
        let file = File::create_new(&file_path)
            .map_err(Error::from)
            .add_msg(format!("Creating dump file {file_path:?}"))?;

        let mut cmd = self.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::inherit());

        tracing::info!(
            "Dumping database {:?} from {}:{} into {:?}",
            self.database,
            self.host,
            self.port,
            file_path
        );
        let mut child = cmd
            .spawn()
            .map_err(Error::from)
            .add_msg(format!("Spawning {:?}", cmd.get_program()))
            .add_fn_name(function_path!())?;

        let status = wait_or_kill(&mut child, ctx.cancel()).add_fn_name(function_path!())?;
        if !status.success() {
            return Err(Error::process_exit(format!(
                "{:?} for database {:?} exited with {status}",
                cmd.get_program(),
                self.database
            ))
            .add_fn_name(function_path!()));
        }

        tracing::info!("Database dump written to {:?}", file_path);
        Ok(file_path)
    }
}
