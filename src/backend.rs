use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::Instrument;

use crate::chunks::{normalize_cli_line, normalize_openai_line, ResponseChunk, SseLine};
use crate::constants::{MAX_LINE_BYTES, STDERR_TAIL_CHARS};
use crate::types::{RelayError, Result};

/// Prompts longer than this go through stdin instead of argv.
pub const STDIN_PROMPT_THRESHOLD: usize = 100_000;

pub type ChunkStream = BoxStream<'static, Result<ResponseChunk>>;

/// How to reach one provider. Built by the resolver, never mutated afterwards.
#[derive(Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionParams {
    Cli {
        program: String,
        args: Vec<String>,
        /// Applied to the child process only.
        #[serde(skip)]
        env: BTreeMap<String, String>,
        working_dir: Option<PathBuf>,
    },
    OpenAiCompatible {
        base_url: String,
        #[serde(skip)]
        api_key: Option<String>,
        #[serde(skip)]
        headers: BTreeMap<String, String>,
    },
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionParams::Cli {
                program,
                args,
                env,
                working_dir,
            } => f
                .debug_struct("Cli")
                .field("program", program)
                .field("args", args)
                .field("env_keys", &env.keys().collect::<Vec<_>>())
                .field("working_dir", working_dir)
                .finish(),
            ConnectionParams::OpenAiCompatible {
                base_url,
                api_key,
                headers,
            } => f
                .debug_struct("OpenAiCompatible")
                .field("base_url", base_url)
                .field("api_key", &api_key.as_ref().map(|_| "[REDACTED]"))
                .field("header_keys", &headers.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendConfig {
    pub provider_id: String,
    pub connection: ConnectionParams,
    pub resolved_model_id: String,
    pub privacy_enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub max_turns: Option<u32>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

/// Starts one backend call. Dropping the returned stream cancels the call.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn start(
        &self,
        prompt: &str,
        config: &BackendConfig,
        options: &ExecuteOptions,
    ) -> Result<ChunkStream>;
}

/// Drives the model CLI as a child process reading `stream-json` from stdout.
#[derive(Debug, Clone)]
pub struct CliBackend {
    default_max_turns: u32,
}

impl CliBackend {
    pub fn new(default_max_turns: u32) -> Self {
        Self { default_max_turns }
    }

    pub fn build_args(&self, config: &BackendConfig, options: &ExecuteOptions) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            options.max_turns.unwrap_or(self.default_max_turns).to_string(),
        ];
        if !config.resolved_model_id.is_empty() {
            args.push("--model".to_string());
            args.push(config.resolved_model_id.clone());
        }
        if let Some(system) = &options.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(system.clone());
        }
        if !options.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(options.allowed_tools.join(","));
        }
        if !options.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(options.disallowed_tools.join(","));
        }
        args
    }
}

impl Default for CliBackend {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl Backend for CliBackend {
    async fn start(
        &self,
        prompt: &str,
        config: &BackendConfig,
        options: &ExecuteOptions,
    ) -> Result<ChunkStream> {
        let (program, base_args, env, working_dir) = match &config.connection {
            ConnectionParams::Cli {
                program,
                args,
                env,
                working_dir,
            } => (program, args, env, working_dir),
            other => {
                return Err(RelayError::Configuration(format!(
                    "provider {} is not a CLI provider: {:?}",
                    config.provider_id, other
                ))
                .into())
            }
        };

        let use_stdin = prompt.len() > STDIN_PROMPT_THRESHOLD;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(base_args)
            .args(self.build_args(config, options))
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if use_stdin { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);
        if !use_stdin {
            cmd.arg(prompt);
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RelayError::Backend(format!("failed to spawn backend process '{}': {}", program, e))
        })?;
        tracing::debug!(
            provider = %config.provider_id,
            pid = child.id().unwrap_or_default(),
            stdin_prompt = use_stdin,
            "Backend process started"
        );

        if use_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let prompt = prompt.to_string();
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                        tracing::debug!("Writing prompt to backend stdin failed: {}", e);
                    }
                });
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Backend("backend stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RelayError::Backend("backend stderr unavailable".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut tail = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tail.push_str(&line);
                tail.push('\n');
                if tail.len() > STDERR_TAIL_CHARS * 2 {
                    tail = crate::str_utils::suffix_chars(&tail, STDERR_TAIL_CHARS).to_string();
                }
            }
            crate::str_utils::suffix_chars(tail.trim(), STDERR_TAIL_CHARS).to_string()
        });

        let (tx, rx) = mpsc::channel::<Result<ResponseChunk>>(64);
        tokio::spawn(
            async move {
                let mut lines =
                    FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
                loop {
                    let next = tokio::select! {
                        _ = tx.closed() => {
                            tracing::trace!("Chunk consumer dropped, stopping backend process");
                            let _ = child.start_kill();
                            return;
                        }
                        line = lines.next() => line,
                    };
                    match next {
                        Some(Ok(line)) => {
                            for chunk in normalize_cli_line(&line) {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    let _ = child.start_kill();
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = child.start_kill();
                            let _ = tx
                                .send(Err(RelayError::Backend(format!(
                                    "failed reading backend output: {}",
                                    e
                                ))
                                .into()))
                                .await;
                            return;
                        }
                        None => break,
                    }
                }

                let status = child.wait().await;
                let stderr_tail = stderr_task.await.unwrap_or_default();
                let failure = match status {
                    Ok(s) if s.success() => None,
                    Ok(s) => Some(match s.code() {
                        Some(code) => format!(
                            "backend process failed with exit code {}: {}",
                            code, stderr_tail
                        ),
                        None => format!("backend process terminated by signal: {}", stderr_tail),
                    }),
                    Err(e) => Some(format!("failed waiting for backend process: {}", e)),
                };
                if let Some(msg) = failure {
                    tracing::warn!("{}", msg);
                    let _ = tx.send(Err(RelayError::Backend(msg).into())).await;
                }
            }
            .instrument(tracing::Span::current()),
        );

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Streams chat completions from any OpenAI-compatible HTTP endpoint.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn start(
        &self,
        prompt: &str,
        config: &BackendConfig,
        options: &ExecuteOptions,
    ) -> Result<ChunkStream> {
        let (base_url, api_key, headers) = match &config.connection {
            ConnectionParams::OpenAiCompatible {
                base_url,
                api_key,
                headers,
            } => (base_url, api_key, headers),
            other => {
                return Err(RelayError::Configuration(format!(
                    "provider {} is not an HTTP provider: {:?}",
                    config.provider_id, other
                ))
                .into())
            }
        };

        let mut messages = Vec::new();
        if let Some(system) = &options.system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));
        let body = serde_json::json!({
            "model": config.resolved_model_id,
            "messages": messages,
            "stream": true,
        });

        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] {} Status: {}", config.provider_id, status);
        if !status.is_success() {
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(e) => format!("(body unreadable: {})", e),
            };
            return Err(RelayError::Upstream(
                status,
                crate::str_utils::prefix_chars(&error_body, 1000).to_string(),
            )
            .into());
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );

        let chunks = lines
            .map(|line| match line {
                Ok(l) => normalize_openai_line(&l),
                Err(e) => SseLine::Error(format!("failed reading provider stream: {}", e)),
            })
            .take_while(|l| std::future::ready(!matches!(l, SseLine::Done)))
            .flat_map(|l| {
                let items: Vec<Result<ResponseChunk>> = match l {
                    SseLine::Chunks(c) => c.into_iter().map(Ok).collect(),
                    SseLine::Error(msg) => vec![Err(RelayError::Backend(msg).into())],
                    SseLine::Done | SseLine::Skip => Vec::new(),
                };
                stream::iter(items)
            });

        Ok(chunks.boxed())
    }
}

/// Dispatches to the implementation matching the config's connection kind.
#[derive(Clone)]
pub struct BackendRouter {
    cli: CliBackend,
    http: OpenAiBackend,
}

impl BackendRouter {
    pub fn new(cli: CliBackend, http: OpenAiBackend) -> Self {
        Self { cli, http }
    }
}

#[async_trait]
impl Backend for BackendRouter {
    async fn start(
        &self,
        prompt: &str,
        config: &BackendConfig,
        options: &ExecuteOptions,
    ) -> Result<ChunkStream> {
        match &config.connection {
            ConnectionParams::Cli { .. } => self.cli.start(prompt, config, options).await,
            ConnectionParams::OpenAiCompatible { .. } => {
                self.http.start(prompt, config, options).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_config(program: &str, args: &[&str]) -> BackendConfig {
        BackendConfig {
            provider_id: "cli-test".into(),
            connection: ConnectionParams::Cli {
                program: program.into(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: BTreeMap::new(),
                working_dir: None,
            },
            resolved_model_id: "sonnet".into(),
            privacy_enabled: true,
        }
    }

    #[test]
    fn test_build_args_includes_options() {
        let backend = CliBackend::new(5);
        let options = ExecuteOptions {
            max_turns: None,
            system_prompt: Some("be brief".into()),
            allowed_tools: vec!["Read".into(), "Grep".into()],
            disallowed_tools: vec![],
        };
        let args = backend.build_args(&cli_config("claude", &[]), &options);
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--max-turns 5"));
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--system-prompt be brief"));
        assert!(joined.contains("--allowedTools Read,Grep"));
        assert!(!joined.contains("--disallowedTools"));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let params = ConnectionParams::OpenAiCompatible {
            base_url: "https://example.invalid/v1".into(),
            api_key: Some("sk-secret".into()),
            headers: BTreeMap::new(),
        };
        let rendered = format!("{:?}", params);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_backend_streams_normalized_chunks() {
        // `sh -c <script> <prompt...>` echoes a canned stream-json transcript.
        let script = r#"echo '{"type":"system","subtype":"init"}'; echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'; echo '{"type":"result","subtype":"success"}'"#;
        let config = cli_config("sh", &["-c", script]);
        let backend = CliBackend::default();
        let stream = backend
            .start("prompt", &config, &ExecuteOptions::default())
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        let kinds: Vec<_> = chunks
            .iter()
            .map(|c| c.as_ref().unwrap().kind())
            .collect();
        assert_eq!(kinds, vec!["system", "content", "completion"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_backend_reports_exit_code() {
        let config = cli_config("sh", &["-c", "echo 'not allowed' >&2; exit 1"]);
        let backend = CliBackend::default();
        let stream = backend
            .start("prompt", &config, &ExecuteOptions::default())
            .await
            .unwrap();
        let results: Vec<_> = stream.collect().await;
        let err = results
            .into_iter()
            .find_map(|r| r.err())
            .expect("expected an error item");
        let msg = err.inner.to_string();
        assert!(msg.contains("exit code 1"), "{}", msg);
        assert!(msg.contains("not allowed"), "{}", msg);
    }
}
