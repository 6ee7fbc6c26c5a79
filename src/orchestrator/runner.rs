use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::InvocationError;
use crate::hive_config::{HiveToml, OutputFormat, PromptInput};
use crate::stream::{StreamAccumulator, StreamActivity};
use crate::util::tail_chars;

/// Bytes of stderr kept in a `NonZeroExit` error.
const STDERR_TAIL: usize = 2000;

/// One agent invocation: text in, text out.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub agent: String,
    pub prompt: String,
    pub model: Option<String>,
    pub workdir: PathBuf,
    /// Durable transcript file the output is streamed to
    pub artifact: Option<PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub text: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub cost_usd: Option<f64>,
}

/// The capability every LLM backend provides: `invoke(prompt, model) -> text`.
///
/// Implementations must leave no live process behind when the future
/// resolves or is dropped.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutput, InvocationError>;
}

enum Waited {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runs the CLI configured for each agent in `[backends]`/`[agents]`.
pub struct CliBackend {
    toml: HiveToml,
    cancel: CancellationToken,
}

impl CliBackend {
    pub fn new(toml: HiveToml, cancel: CancellationToken) -> Self {
        Self { toml, cancel }
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutput, InvocationError> {
        let settings = self
            .toml
            .agent_settings(&request.agent)
            .map_err(|e| InvocationError::Backend(e.to_string()))?;
        let backend = settings.backend;
        let model = request.model.clone().or(settings.model);

        let mut cmd = Command::new(&backend.cmd);
        cmd.args(&backend.args);
        if let (Some(flag), Some(model)) = (&backend.model_flag, &model) {
            cmd.arg(flag).arg(model);
        }
        let via_stdin = backend.prompt_input == PromptInput::Stdin;
        if !via_stdin {
            cmd.arg(&request.prompt);
        }
        cmd.current_dir(&request.workdir)
            .stdin(if via_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            agent = %request.agent,
            cmd = %backend.cmd,
            model = model.as_deref().unwrap_or("default"),
            "spawning agent"
        );
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| InvocationError::Spawn {
            cmd: backend.cmd.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if stdin.write_all(prompt.as_bytes()).await.is_ok() {
                    let _ = stdin.shutdown().await;
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InvocationError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut artifact = match request.artifact {
            Some(ref path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Some(tokio::fs::File::create(path).await?)
            }
            None => None,
        };

        let stream_json = backend.output == OutputFormat::StreamJson;
        let mut acc = StreamAccumulator::new();
        let mut plain = String::new();

        let waited = {
            let run = async {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    if let Some(ref mut file) = artifact {
                        file.write_all(line.as_bytes()).await?;
                        file.write_all(b"\n").await?;
                    }
                    if stream_json {
                        if let StreamActivity::Tool(desc) = acc.push_line(&line) {
                            tracing::debug!(agent = %request.agent, "{}", desc);
                        }
                    } else {
                        plain.push_str(&line);
                        plain.push('\n');
                    }
                }
                Ok::<_, InvocationError>(child.wait().await?)
            };
            tokio::select! {
                result = tokio::time::timeout(request.timeout, run) => match result {
                    Ok(status) => Waited::Exited(status?),
                    Err(_) => Waited::TimedOut,
                },
                _ = self.cancel.cancelled() => Waited::Cancelled,
            }
        };

        if let Some(ref mut file) = artifact {
            file.flush().await?;
        }

        let status = match waited {
            Waited::Exited(status) => status,
            Waited::TimedOut => {
                let _ = child.kill().await;
                tracing::warn!(agent = %request.agent, secs = request.timeout.as_secs(), "agent timed out");
                return Err(InvocationError::Timeout {
                    elapsed: request.timeout,
                });
            }
            Waited::Cancelled => {
                let _ = child.kill().await;
                return Err(InvocationError::Cancelled);
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(InvocationError::NonZeroExit {
                code: exit_code,
                stderr: tail_chars(stderr.trim(), STDERR_TAIL).to_string(),
            });
        }

        let (text, cost_usd) = if stream_json {
            let cost = acc.cost_usd();
            (acc.finish(), cost)
        } else {
            (plain, None)
        };
        Ok(InvocationOutput {
            text,
            exit_code,
            duration: start.elapsed(),
            cost_usd,
        })
    }
}
