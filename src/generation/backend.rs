//! Backend invocation boundary.
//!
//! A backend turns `(model, prompt, timeout)` into `(content, metadata)` or a
//! tagged [`BackendError`]. The orchestrator never looks at process or HTTP
//! mechanics; it only sees this contract.
//!
//! Two implementations are provided:
//!
//! - [`SubprocessBackend`]: spawns a command, writes the prompt to stdin and
//!   reads the document from stdout. The child is killed when the timeout
//!   fires. A clean exit with empty stdout is returned as-is; deciding that it
//!   is a failure is the validator's job, not the backend's.
//! - [`LlmBackend`]: wraps any [`LlmProvider`] (OpenRouter by default).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::BackendError;
use crate::llm::{GenerationRequest, LlmProvider, Message, PricingTable};
use crate::retry::{retry_transient, RetryPolicy};

use super::ValidationCode;

/// One backend call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub timeout: Duration,
}

impl InvokeRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            timeout,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Token and cost metadata. Every field is optional: a backend that cannot
/// report usage leaves it `None` and the gap is surfaced in the run summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    /// Structural verdict reported by the backend itself.
    pub validation: Option<ValidationCode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    /// `None` when the backend returned no content field at all.
    pub content: Option<String>,
    pub metadata: ResponseMetadata,
}

impl BackendResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            metadata: ResponseMetadata::default(),
        }
    }

    pub fn empty() -> Self {
        Self {
            content: None,
            metadata: ResponseMetadata::default(),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs and timeline details.
    fn name(&self) -> &str;

    async fn invoke(&self, request: &InvokeRequest) -> Result<BackendResponse, BackendError>;
}

// ============================================================================
// Subprocess backend
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessConfig {
    /// Executable to run.
    pub program: String,
    /// Fixed arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag used to pass the model, e.g. `--model`. When unset the model is
    /// exported as `DOCFORGE_MODEL` only.
    #[serde(default)]
    pub model_flag: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl SubprocessConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            model_flag: None,
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model_flag(mut self, flag: impl Into<String>) -> Self {
        self.model_flag = Some(flag.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Optional structured stdout. Plain text stdout is taken as the content.
#[derive(Debug, Deserialize)]
struct SubprocessEnvelope {
    content: Option<String>,
    #[serde(default)]
    validation: Option<ValidationCode>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cost_usd: Option<f64>,
}

pub struct SubprocessBackend {
    name: String,
    config: SubprocessConfig,
    retry: RetryPolicy,
}

impl SubprocessBackend {
    pub fn new(name: impl Into<String>, config: SubprocessConfig, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            config,
            retry,
        }
    }

    async fn run_once(&self, request: &InvokeRequest) -> Result<BackendResponse, BackendError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);
        if let Some(flag) = &self.config.model_flag {
            cmd.arg(flag).arg(&request.model);
        }
        cmd.envs(&self.config.env)
            .env("DOCFORGE_MODEL", &request.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Fatal(format!("failed to spawn {}: {}", self.config.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut payload = String::new();
            if let Some(system) = &request.system {
                payload.push_str(system);
                payload.push_str("\n\n");
            }
            payload.push_str(&request.prompt);
            // A child that exits without reading stdin is not an error here;
            // its exit status is judged below.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                tracing::debug!(backend = %self.name, error = %e, "Child closed stdin early");
            }
            drop(stdin);
        }

        let started = Instant::now();
        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| BackendError::Connection(e.to_string()))?,
            Err(_) => {
                tracing::warn!(
                    backend = %self.name,
                    model = %request.model,
                    timeout_secs = request.timeout.as_secs(),
                    "Subprocess timed out, child killed"
                );
                return Err(BackendError::Timeout(request.timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(BackendError::ProcessFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        tracing::debug!(
            backend = %self.name,
            model = %request.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            stdout_bytes = stdout.len(),
            "Subprocess exited cleanly"
        );

        Ok(parse_stdout(stdout))
    }
}

fn parse_stdout(stdout: String) -> BackendResponse {
    let trimmed = stdout.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<SubprocessEnvelope>(trimmed) {
            return BackendResponse {
                content: envelope.content,
                metadata: ResponseMetadata {
                    input_tokens: envelope.input_tokens,
                    output_tokens: envelope.output_tokens,
                    cost_usd: envelope.cost_usd,
                    validation: envelope.validation,
                },
            };
        }
    }
    BackendResponse::text(stdout)
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<BackendResponse, BackendError> {
        let label = format!("{}:{}", self.name, request.model);
        retry_transient(&self.retry, &label, move |_| self.run_once(request)).await
    }
}

// ============================================================================
// LLM backend
// ============================================================================

/// Generation through an [`LlmProvider`]. Transport retry lives in the
/// provider.
pub struct LlmBackend {
    name: String,
    provider: Arc<dyn LlmProvider>,
    pricing: PricingTable,
    max_tokens: Option<u32>,
}

impl LlmBackend {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            name: name.into(),
            provider,
            pricing: PricingTable::new(),
            max_tokens: None,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
impl Backend for LlmBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<BackendResponse, BackendError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(request.prompt.clone()));

        let mut llm_request = GenerationRequest::new(request.model.clone(), messages);
        if let Some(max_tokens) = self.max_tokens {
            llm_request = llm_request.with_max_tokens(max_tokens);
        }

        let response = match tokio::time::timeout(request.timeout, self.provider.generate(llm_request)).await {
            Ok(result) => result?,
            Err(_) => return Err(BackendError::Timeout(request.timeout)),
        };

        let input_tokens = response.usage.map(|u| u64::from(u.prompt_tokens));
        let output_tokens = response.usage.map(|u| u64::from(u.completion_tokens));
        let cost_usd = self
            .pricing
            .resolve(&request.model, None, input_tokens, output_tokens);

        Ok(BackendResponse {
            content: response.first_content().map(str::to_string),
            metadata: ResponseMetadata {
                input_tokens,
                output_tokens,
                cost_usd,
                validation: None,
            },
        })
    }
}
