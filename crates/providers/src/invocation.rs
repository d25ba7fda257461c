//! Invocation engine: Drives a remote model backend as a subprocess.
//!
//! One call runs the backend with the prompt, asks for JSON output and
//! optionally resumes a session. The process is killed if it outlives the
//! configured timeout. Output is evaluated by [`crate::response::evaluate`];
//! some verdicts repeat the run once more without the session token, bounded
//! by a retry ceiling. Result text is always sanitized before it is returned.

use crate::response::{self, ProcessOutput, Verdict};
use crate::sanitize::Sanitizer;
use async_trait::async_trait;
use senseloop_config::BackendConfig;
use senseloop_core::error::InvocationError;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Returned when an errored session produced nothing usable.
pub const SESSION_PRODUCED_NO_OUTPUT: &str = "[session produced no output]";

/// Sanitized text plus the session token to resume with next time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub text: String,
    pub session_token: Option<String>,
}

/// A remote tier of the fallback chain.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
    ) -> Result<InvocationResult, InvocationError>;
}

#[derive(Debug, Clone)]
pub struct InvocationConfig {
    pub command: String,
    pub extra_args: Vec<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    /// An invocation whose retry count has reached this value fails
    /// without launching the backend.
    pub max_retry_count: u32,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for InvocationConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            command: config.command.clone(),
            extra_args: config.extra_args.clone(),
            model: config.model.clone(),
            timeout: config.timeout(),
            working_dir: config.working_dir.clone(),
            max_retry_count: config.max_retry_count,
        }
    }
}

pub struct InvocationEngine {
    name: String,
    config: InvocationConfig,
    sanitizer: Arc<Sanitizer>,
}

impl InvocationEngine {
    pub fn new(name: impl Into<String>, config: InvocationConfig, sanitizer: Arc<Sanitizer>) -> Self {
        Self {
            name: name.into(),
            config,
            sanitizer,
        }
    }

    pub fn config(&self) -> &InvocationConfig {
        &self.config
    }

    /// Arguments for one run, in order:
    /// `extra_args…, [--model M], -p <prompt>, --output-format json, [--resume <token>]`.
    pub fn build_args(&self, prompt: &str, resume_token: Option<&str>) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        if let Some(model) = &self.config.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        args.push("-p".into());
        args.push(prompt.into());
        args.push("--output-format".into());
        args.push("json".into());
        if let Some(token) = resume_token {
            args.push("--resume".into());
            args.push(token.into());
        }
        args
    }

    /// Invoke starting from an explicit retry count.
    ///
    /// When the backend rejects the resume token and the run without it fails
    /// too, the error is wrapped in [`InvocationError::SessionRejected`] so the
    /// caller knows to drop the token.
    pub async fn invoke_with_retry(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
        retry_count: u32,
    ) -> Result<InvocationResult, InvocationError> {
        let mut rejected = false;
        self.run_with_retries(prompt, resume_token, retry_count, &mut rejected)
            .await
            .map_err(|cause| {
                if rejected {
                    InvocationError::SessionRejected {
                        cause: Box::new(cause),
                    }
                } else {
                    cause
                }
            })
    }

    async fn run_with_retries(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
        retry_count: u32,
        rejected: &mut bool,
    ) -> Result<InvocationResult, InvocationError> {
        let ceiling = self.config.max_retry_count;
        let mut token = resume_token.map(str::to_owned);
        let mut retry_count = retry_count;

        loop {
            if retry_count >= ceiling {
                warn!(backend = %self.name, retry_count, ceiling, "Retry ceiling reached");
                return Err(InvocationError::RetryCeilingExceeded {
                    retry_count,
                    ceiling,
                });
            }

            let output = self.run_once(prompt, token.as_deref()).await?;
            match response::evaluate(&output, token.is_some()) {
                Verdict::Success { text, session_id } => {
                    let sanitized = self.sanitizer.sanitize(&text);
                    if sanitized.text.is_empty() {
                        warn!(
                            backend = %self.name,
                            removed = sanitized.removed.len(),
                            "Result was empty after sanitizing; discarding its token"
                        );
                        return Ok(InvocationResult {
                            text: SESSION_PRODUCED_NO_OUTPUT.into(),
                            session_token: None,
                        });
                    }
                    debug!(
                        backend = %self.name,
                        chars = sanitized.text.len(),
                        removed = sanitized.removed.len(),
                        resumed = token.is_some(),
                        "Invocation succeeded"
                    );
                    return Ok(InvocationResult {
                        text: sanitized.text,
                        session_token: session_id,
                    });
                }
                Verdict::NoOutput => {
                    warn!(backend = %self.name, "Session errored without output; discarding its token");
                    return Ok(InvocationResult {
                        text: SESSION_PRODUCED_NO_OUTPUT.into(),
                        session_token: None,
                    });
                }
                Verdict::RetryWithoutSession(reason) => {
                    info!(backend = %self.name, ?reason, retry_count, "Retrying without session token");
                    *rejected |= token.is_some();
                    token = None;
                    retry_count += 1;
                }
                Verdict::Fail(err) => {
                    if let Some(raw) = err.diagnostic() {
                        debug!(target: "senseloop::diagnostics", backend = %self.name, raw = %raw, "Backend output");
                    }
                    warn!(backend = %self.name, error = %err, "Invocation failed");
                    return Err(err);
                }
            }
        }
    }

    async fn run_once(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
    ) -> Result<ProcessOutput, InvocationError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(self.build_args(prompt, resume_token))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => InvocationError::BackendNotFound {
                command: self.config.command.clone(),
            },
            kind => InvocationError::LaunchFailed {
                reason: e.to_string(),
                kind,
            },
        })?;

        // Drain both pipes from the start so a chatty backend cannot block on a full pipe.
        let stdout_task = tokio::spawn(read_all(child.stdout.take()));
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));

        let status = match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(InvocationError::LaunchFailed {
                    reason: format!("Failed to wait for backend: {e}"),
                    kind: e.kind(),
                });
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(backend = %self.name, error = %e, "Failed to kill timed-out backend");
                }
                stdout_task.abort();
                stderr_task.abort();
                warn!(backend = %self.name, timeout_secs = self.config.timeout.as_secs(), "Backend timed out");
                return Err(InvocationError::Timeout {
                    timeout_secs: self.config.timeout.as_secs(),
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let stdout = String::from_utf8(stdout).map_err(|_| InvocationError::InvalidUtf8)?;
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code: status.code(),
        })
    }
}

#[async_trait]
impl RemoteBackend for InvocationEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
    ) -> Result<InvocationResult, InvocationError> {
        self.invoke_with_retry(prompt, resume_token, 0).await
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "Backend pipe read failed");
        }
    }
    buf
}
