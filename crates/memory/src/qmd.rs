//! qmd retrieval backend: drives the external `qmd` binary per namespace.
//!
//! | Operation | Command |
//! |-----------|---------|
//! | primary   | `qmd query --json -n <k> <text>` (hybrid + rerank) |
//! | fallback  | `qmd search --json -n <k> <text>` (lexical) |
//! | reindex   | `qmd update`, then `qmd embed` |
//!
//! Every invocation points `XDG_CONFIG_HOME` / `XDG_CACHE_HOME` at the
//! namespace's own `qmd/` directory, which is what keeps indexes isolated.
//! Child processes are killed when their timeout fires or when the caller
//! drops the future.

use async_trait::async_trait;
use homunculus_core::error::MemoryError;
use homunculus_core::memory::{MemoryRecord, RetrievalBackend, RetrievalMode};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::layout::NamespaceLayout;

/// Captured output of a finished child process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a program to completion under a timeout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, MemoryError>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, MemoryError> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(MemoryError::QueryFailed(format!("failed to spawn {program}: {e}"))),
            Err(_) => Err(MemoryError::QueryFailed(format!(
                "{program} timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

pub struct QmdBackend {
    binary: String,
    layout: NamespaceLayout,
    runner: Arc<dyn CommandRunner>,
    query_timeout: Duration,
    fallback_timeout: Duration,
    update_timeout: Duration,
}

impl QmdBackend {
    pub fn new(binary: impl Into<String>, layout: NamespaceLayout) -> Self {
        Self {
            binary: binary.into(),
            layout,
            runner: Arc::new(TokioCommandRunner),
            query_timeout: Duration::from_secs(8),
            fallback_timeout: Duration::from_secs(2),
            update_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_timeouts(mut self, query: Duration, fallback: Duration, update: Duration) -> Self {
        self.query_timeout = query;
        self.fallback_timeout = fallback;
        self.update_timeout = update;
        self
    }

    fn env(&self, namespace: &str) -> Vec<(String, String)> {
        vec![
            (
                "XDG_CONFIG_HOME".into(),
                self.layout.qmd_config_home(namespace).display().to_string(),
            ),
            (
                "XDG_CACHE_HOME".into(),
                self.layout.qmd_cache_home(namespace).display().to_string(),
            ),
        ]
    }
}

#[async_trait]
impl RetrievalBackend for QmdBackend {
    fn name(&self) -> &str {
        "qmd"
    }

    async fn query(
        &self,
        namespace: &str,
        text: &str,
        top_k: usize,
        mode: RetrievalMode,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let (subcommand, timeout) = match mode {
            RetrievalMode::Primary => ("query", self.query_timeout),
            RetrievalMode::Fallback => ("search", self.fallback_timeout),
        };
        let args = vec![
            subcommand.to_string(),
            "--json".into(),
            "-n".into(),
            top_k.to_string(),
            text.to_string(),
        ];

        let started = Instant::now();
        let output = self
            .runner
            .run(&self.binary, &args, &self.env(namespace), timeout)
            .await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !output.success() {
            warn!(namespace, mode = %mode, latency_ms, status = ?output.status, "qmd exited with failure");
            return Err(MemoryError::QueryFailed(format!(
                "qmd {subcommand} exited with {:?}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        let records = parse_records(&output.stdout, namespace)?;
        debug!(namespace, mode = %mode, latency_ms, records = records.len(), "qmd query finished");
        Ok(records)
    }

    async fn reindex(&self, namespace: &str) -> Result<(), MemoryError> {
        let env = self.env(namespace);
        for step in ["update", "embed"] {
            let output = self
                .runner
                .run(&self.binary, &[step.to_string()], &env, self.update_timeout)
                .await
                .map_err(|e| MemoryError::IndexFailed(format!("qmd {step}: {e}")))?;
            if !output.success() {
                return Err(MemoryError::IndexFailed(format!(
                    "qmd {step} exited with {:?}: {}",
                    output.status,
                    output.stderr.trim()
                )));
            }
        }
        Ok(())
    }
}

/// Parse qmd's JSON output. Accepts a bare list or an object carrying the
/// list under `results`, `items`, `hits` or `data`.
pub fn parse_records(raw: &str, namespace: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
    let payload: Value = serde_json::from_str(raw)
        .map_err(|e| MemoryError::QueryFailed(format!("qmd output is not valid JSON: {e}")))?;

    let items = match &payload {
        Value::Array(items) => items,
        Value::Object(obj) => ["results", "items", "hits", "data"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_array))
            .ok_or_else(|| MemoryError::QueryFailed("qmd output has unsupported object shape".into()))?,
        _ => {
            return Err(MemoryError::QueryFailed("qmd output has unsupported JSON shape".into()));
        }
    };

    Ok(items
        .iter()
        .filter_map(|item| {
            let item = item.as_object()?;
            let text = pick_text(item)?;
            Some(MemoryRecord {
                text,
                source: pick_source(item),
                timestamp: None,
                namespace: namespace.to_string(),
                score: item.get("score").map(to_score).unwrap_or(0.0),
            })
        })
        .collect())
}

fn pick_text(item: &serde_json::Map<String, Value>) -> Option<String> {
    let direct = ["text", "content", "snippet", "body"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str));
    let nested = || {
        let doc = item.get("document")?.as_object()?;
        ["text", "content"]
            .iter()
            .find_map(|k| doc.get(*k).and_then(Value::as_str))
    };
    direct
        .or_else(nested)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn pick_source(item: &serde_json::Map<String, Value>) -> String {
    ["source", "path", "file", "file_path", "uri"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn to_score(value: &Value) -> f32 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0) as f32,
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned outputs and records every invocation.
    struct ScriptedRunner {
        outputs: Mutex<Vec<Result<CommandOutput, MemoryError>>>,
        calls: Mutex<Vec<(Vec<String>, Vec<(String, String)>, Duration)>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<Result<CommandOutput, MemoryError>>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _program: &str,
            args: &[String],
            envs: &[(String, String)],
            timeout: Duration,
        ) -> Result<CommandOutput, MemoryError> {
            self.calls
                .lock()
                .unwrap()
                .push((args.to_vec(), envs.to_vec(), timeout));
            self.outputs.lock().unwrap().remove(0)
        }
    }

    fn ok(stdout: &str) -> Result<CommandOutput, MemoryError> {
        Ok(CommandOutput {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        })
    }

    #[test]
    fn parses_list_and_object_shapes() {
        let list = r#"[{"text": " fact one ", "path": "a.md", "score": 0.9},
                       {"snippet": "", "score": 0.5},
                       "junk"]"#;
        let records = parse_records(list, "kovach").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "fact one");
        assert_eq!(records[0].source, "a.md");
        assert!((records[0].score - 0.9).abs() < 1e-6);

        let object = r#"{"hits": [{"document": {"content": "nested"}, "score": "0.25"}]}"#;
        let records = parse_records(object, "kovach").unwrap();
        assert_eq!(records[0].text, "nested");
        assert_eq!(records[0].source, "unknown");
        assert!((records[0].score - 0.25).abs() < 1e-6);
    }

    #[test]
    fn rejects_unsupported_shapes() {
        assert!(parse_records("not json", "kovach").is_err());
        assert!(parse_records(r#"{"rows": []}"#, "kovach").is_err());
        assert!(parse_records("42", "kovach").is_err());
    }

    #[tokio::test]
    async fn modes_map_to_subcommands_with_isolated_env() {
        let runner = ScriptedRunner::new(vec![ok("[]"), ok(r#"[{"text": "lexical hit"}]"#)]);
        let backend = QmdBackend::new("qmd", NamespaceLayout::new("/data"))
            .with_runner(runner.clone())
            .with_timeouts(Duration::from_secs(8), Duration::from_secs(2), Duration::from_secs(60));

        backend.query("kovach", "lantern", 5, RetrievalMode::Primary).await.unwrap();
        let hits = backend
            .query("kovach", "lantern", 5, RetrievalMode::Fallback)
            .await
            .unwrap();
        assert_eq!(hits[0].namespace, "kovach");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, vec!["query", "--json", "-n", "5", "lantern"]);
        assert_eq!(calls[0].2, Duration::from_secs(8));
        assert_eq!(calls[1].0[0], "search");
        assert_eq!(calls[1].2, Duration::from_secs(2));
        assert!(calls[0].1.contains(&(
            "XDG_CACHE_HOME".to_string(),
            "/data/agents/kovach/qmd/xdg-cache".to_string()
        )));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let runner = ScriptedRunner::new(vec![Ok(CommandOutput {
            status: Some(2),
            stdout: String::new(),
            stderr: "index locked".into(),
        })]);
        let backend = QmdBackend::new("qmd", NamespaceLayout::new("/data")).with_runner(runner);
        let err = backend
            .query("kovach", "lantern", 5, RetrievalMode::Primary)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("index locked"));
    }

    #[tokio::test]
    async fn reindex_runs_update_then_embed_and_stops_on_failure() {
        let runner = ScriptedRunner::new(vec![
            ok(""),
            Ok(CommandOutput {
                status: Some(1),
                ..CommandOutput::default()
            }),
        ]);
        let backend = QmdBackend::new("qmd", NamespaceLayout::new("/data")).with_runner(runner.clone());
        let err = backend.reindex("kovach").await.unwrap_err();
        assert!(matches!(err, MemoryError::IndexFailed(_)));

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, vec!["update"]);
        assert_eq!(calls[1].0, vec!["embed"]);
    }
}
