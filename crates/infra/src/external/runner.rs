//! Agent and setup execution capabilities.
//!
//! Both run the configured agent executable as a child process: the request is
//! written to stdin as JSON, secrets travel in environment variables, and a
//! non-zero exit is a failure carrying the tail of stderr.

use std::process::Stdio;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use issueflow_core::{JobId, PipelineRunId, ProjectId};

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 2_000;

/// Bytes of each output stream held while the child runs.
const OUTPUT_BUFFER: usize = 2 * STDERR_TAIL;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent process I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode job request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("agent exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// AI credentials handed to the agent; at least one is set.
#[derive(Debug, Clone, Default)]
pub struct AiCredentials {
    pub claude_credentials: Option<SecretString>,
    pub anthropic_api_key: Option<SecretString>,
}

/// Repository access for an implement job.
#[derive(Debug, Clone)]
pub struct GitHubAccess {
    pub token: SecretString,
    pub repo: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagedJobRequest {
    pub issue_number: u64,
    pub issue_title: String,
    pub issue_body: String,
    pub project_id: ProjectId,
    pub github_repo: Option<String>,
    pub run_id: PipelineRunId,
    #[serde(skip)]
    pub github_token: SecretString,
    #[serde(skip)]
    pub credentials: AiCredentials,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupJobRequest {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub github_repo: String,
    pub installation_id: i64,
}

/// Runs an implement job to completion.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_managed_job(&self, request: ManagedJobRequest) -> Result<(), ExecutionError>;
}

/// Runs a setup job to completion.
#[async_trait]
pub trait SetupRunner: Send + Sync {
    async fn run_setup_job(&self, request: SetupJobRequest) -> Result<(), ExecutionError>;
}

/// Both capabilities backed by one executable, invoked as
/// `<program> <args…> implement|setup`.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` when it is blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    async fn run(
        &self,
        mode: &'static str,
        payload: Vec<u8>,
        env: Vec<(&'static str, Option<&str>)>,
    ) -> Result<(), ExecutionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(mode)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            match value {
                Some(value) => cmd.env(key, value),
                None => cmd.env_remove(key),
            };
        }

        let mut child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, stdout, stderr, status) = tokio::join!(
            feed,
            read_tail(child.stdout.take(), OUTPUT_BUFFER),
            read_tail(child.stderr.take(), OUTPUT_BUFFER),
            child.wait(),
        );
        let status = status?;
        let (stdout, stderr) = (stdout?, stderr?);

        let stdout = String::from_utf8_lossy(&stdout);
        if !stdout.is_empty() {
            debug!(mode, stdout = %tail(&stdout, STDERR_TAIL), "agent stdout");
        }

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(ExecutionError::Failed {
                status: status.to_string(),
                stderr: tail(stderr.trim(), STDERR_TAIL).to_string(),
            });
        }
        // A child that exits 0 without reading its request still succeeded.
        if let Err(err) = fed {
            debug!(mode, error = %err, "agent closed stdin early");
        }

        info!(mode, "agent finished");
        Ok(())
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn run_managed_job(&self, request: ManagedJobRequest) -> Result<(), ExecutionError> {
        let payload = serde_json::to_vec(&request)?;
        let env = vec![
            ("GITHUB_TOKEN", Some(request.github_token.expose_secret().as_str())),
            (
                "CLAUDE_CREDENTIALS_JSON",
                request
                    .credentials
                    .claude_credentials
                    .as_ref()
                    .map(|s| s.expose_secret().as_str()),
            ),
            (
                "ANTHROPIC_API_KEY",
                request
                    .credentials
                    .anthropic_api_key
                    .as_ref()
                    .map(|s| s.expose_secret().as_str()),
            ),
        ];
        self.run("implement", payload, env).await
    }
}

#[async_trait]
impl SetupRunner for CommandRunner {
    async fn run_setup_job(&self, request: SetupJobRequest) -> Result<(), ExecutionError> {
        let payload = serde_json::to_vec(&request)?;
        self.run("setup", payload, Vec::new()).await
    }
}

/// Last `max` bytes of `s`, moved forward to a char boundary.
/// Drain `reader` to EOF, keeping only its last `limit` bytes.
async fn read_tail<R>(reader: Option<R>, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::with_capacity(limit);
    let Some(mut reader) = reader else {
        return Ok(kept);
    };
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(kept);
        }
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > limit {
            kept.drain(..kept.len() - limit);
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;

    fn sh(script: String) -> CommandRunner {
        CommandRunner::new("sh", vec!["-c".to_string(), script])
    }

    fn managed_request() -> ManagedJobRequest {
        ManagedJobRequest {
            issue_number: 42,
            issue_title: "Add dark mode".to_string(),
            issue_body: "Please".to_string(),
            project_id: ProjectId::new(),
            github_repo: Some("acme/widgets".to_string()),
            run_id: PipelineRunId::new(),
            github_token: SecretString::new("ghs_abc".to_string()),
            credentials: AiCredentials {
                claude_credentials: None,
                anthropic_api_key: Some(SecretString::new("sk-ant-test".to_string())),
            },
        }
    }

    #[tokio::test]
    async fn implement_gets_request_on_stdin_and_secrets_in_env() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().display();
        // With `sh -c`, the trailing mode argument becomes $0.
        let runner = sh(format!(
            r#"cat > {out}/request.json; printf '%s' "$0" > {out}/mode; printf '%s|%s|%s' "$GITHUB_TOKEN" "$ANTHROPIC_API_KEY" "${{CLAUDE_CREDENTIALS_JSON-unset}}" > {out}/env"#
        ));

        let request = managed_request();
        let run_id = request.run_id;
        runner.run_managed_job(request).await.unwrap();

        let mode = std::fs::read_to_string(dir.path().join("mode")).unwrap();
        assert_eq!(mode, "implement");

        let env = std::fs::read_to_string(dir.path().join("env")).unwrap();
        assert_eq!(env, "ghs_abc|sk-ant-test|unset");

        let request: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("request.json")).unwrap())
                .unwrap();
        assert_eq!(request["issue_number"], 42);
        assert_eq!(request["github_repo"], "acme/widgets");
        assert_eq!(request["run_id"], run_id.to_string());
        assert!(request.get("github_token").is_none());
        assert!(request.get("credentials").is_none());
    }

    #[tokio::test]
    async fn setup_passes_installation_and_repo() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().display();
        let runner = sh(format!(r#"cat > {out}/request.json; printf '%s' "$0" > {out}/mode"#));

        runner
            .run_setup_job(SetupJobRequest {
                job_id: JobId::new(),
                project_id: ProjectId::new(),
                github_repo: "acme/widgets".to_string(),
                installation_id: 991,
            })
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("mode")).unwrap(), "setup");
        let request: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("request.json")).unwrap())
                .unwrap();
        assert_eq!(request["installation_id"], 991);
        assert_eq!(request["github_repo"], "acme/widgets");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_status_and_stderr() {
        let runner = sh("cat > /dev/null; echo 'Request failed: 401 Unauthorized' >&2; exit 3".to_string());

        let err = runner.run_managed_job(managed_request()).await.unwrap_err();
        match &err {
            ExecutionError::Failed { status, stderr } => {
                assert!(status.contains('3'));
                assert_eq!(stderr, "Request failed: 401 Unauthorized");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("401 Unauthorized"));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let runner = CommandRunner::new("/nonexistent/issueflow-agent", Vec::new());
        let err = runner.run_managed_job(managed_request()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn { .. }));
    }

    #[test]
    fn command_line_splits_on_whitespace() {
        let runner = CommandRunner::from_command_line("  node  dist/agent.js --verbose ").unwrap();
        assert_eq!(runner.program, "node");
        assert_eq!(runner.args, vec!["dist/agent.js", "--verbose"]);
        assert!(CommandRunner::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn output_buffering_is_bounded() {
        let input: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let kept = read_tail(Some(input.as_slice()), 1_000).await.unwrap();
        assert_eq!(kept, input[input.len() - 1_000..]);

        assert!(read_tail(None::<&[u8]>, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chatty_agent_keeps_only_the_end_of_stderr() {
        let runner = sh(
            "cat > /dev/null; head -c 200000 /dev/zero | tr '\\0' o; \
             head -c 200000 /dev/zero | tr '\\0' e >&2; echo ' fatal: boom' >&2; exit 3"
                .to_string(),
        );
        let err = runner.run_managed_job(managed_request()).await.unwrap_err();
        let stderr = match err {
            ExecutionError::Failed { stderr, .. } => stderr,
            other => panic!("unexpected error: {other}"),
        };
        assert!(stderr.len() <= STDERR_TAIL);
        assert!(stderr.ends_with("eee fatal: boom"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        // 'é' is two bytes; a cut inside it moves forward.
        assert_eq!(tail("aéb", 2), "b");
    }
}
