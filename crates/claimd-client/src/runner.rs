use std::path::PathBuf;
use std::process::Stdio;

use claimd_core::error::AppError;
use claimd_core::job::{JobContext, TaskResult};
use claimd_core::proxy_pool::ProxyAddress;
use claimd_core::traits::TaskRunner;
use tokio::process::Command;

/// Most stderr kept in an error message.
const STDERR_TAIL: usize = 400;

/// Runs task logic as an external program, once per job.
///
/// The job is described through environment variables:
///
/// | variable                        | value                                   |
/// |---------------------------------|-----------------------------------------|
/// | `CLAIMD_TARGET`                 | job target                              |
/// | `CLAIMD_ACCOUNT`                | job account                             |
/// | `CLAIMD_KIND`                   | job kind                                |
/// | `CLAIMD_DOMAIN`                 | rate-limit domain                       |
/// | `CLAIMD_CONSECUTIVE_FAILURES`   | failures before this run                |
/// | `CLAIMD_LAST_ERROR`             | last error category, if any             |
/// | `CLAIMD_PROXY`                  | proxy URL with credentials, if any      |
///
/// The program prints a JSON [`TaskResult`] as the last non-empty line of
/// stdout. The child is killed if the run is cancelled or times out.
#[derive(Debug, Clone)]
pub struct CommandTaskRunner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl CommandTaskRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self, job: &JobContext, proxy: Option<&ProxyAddress>) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CLAIMD_TARGET", &job.key.target)
            .env("CLAIMD_ACCOUNT", &job.key.account)
            .env("CLAIMD_KIND", &job.key.kind)
            .env("CLAIMD_DOMAIN", &job.domain)
            .env(
                "CLAIMD_CONSECUTIVE_FAILURES",
                job.consecutive_failures.to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match job.last_error {
            Some(category) => command.env("CLAIMD_LAST_ERROR", category.as_str()),
            None => command.env_remove("CLAIMD_LAST_ERROR"),
        };
        match proxy {
            Some(proxy) => command.env("CLAIMD_PROXY", proxy.to_url()),
            None => command.env_remove("CLAIMD_PROXY"),
        };
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Parse the last non-empty stdout line as a result.
fn parse_result(stdout: &str) -> Option<Result<TaskResult, serde_json::Error>> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(serde_json::from_str::<TaskResult>)
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    match text.char_indices().rev().nth(STDERR_TAIL) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

impl TaskRunner for CommandTaskRunner {
    async fn execute(
        &self,
        job: &JobContext,
        proxy: Option<&ProxyAddress>,
    ) -> Result<TaskResult, AppError> {
        let output = self.command(job, proxy).output().await.map_err(|e| {
            AppError::TaskError(format!(
                "Failed to start {}: {e}",
                self.program.display()
            ))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match parse_result(&stdout) {
            Some(Ok(result)) => {
                tracing::debug!(job = %job.key, success = result.success, "Task result parsed");
                Ok(result)
            }
            Some(Err(e)) if output.status.success() => Err(AppError::TaskError(format!(
                "Task printed an invalid result: {e}"
            ))),
            _ if output.status.success() => {
                Err(AppError::TaskError("Task printed no result".to_string()))
            }
            _ => Err(AppError::TaskError(format!(
                "Task exited with {}: {}",
                output.status,
                tail(&stderr)
            ))),
        }
    }
}
