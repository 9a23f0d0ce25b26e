use codeexec::{
    create_engine_with_options, AbortToken, EngineConfig, EngineError, EngineOptions,
    ExecutionEngine, ExecutionRequest, InMemoryTemplateStore, JsonLinesTracker, Language,
    PolicySet, TranslationRequest,
};
use serde_json::{json, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
struct WorkerConfig {
    config_path: Option<PathBuf>,
    policy_file: Option<PathBuf>,
    python_path: Option<String>,
    tracker_log: Option<PathBuf>,
    templates_path: Option<PathBuf>,
}

impl WorkerConfig {
    fn from_env_and_args() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let mut cfg = Self {
            tracker_log: std::env::var("CODEEXEC_TRACKER_LOG").ok().map(PathBuf::from),
            templates_path: std::env::var("CODEEXEC_TEMPLATES").ok().map(PathBuf::from),
            ..Self::default()
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--config" => {
                    cfg.config_path = value.map(PathBuf::from);
                    i += 2;
                }
                "--policy-file" => {
                    cfg.policy_file = value.map(PathBuf::from);
                    i += 2;
                }
                "--python" => {
                    cfg.python_path = value;
                    i += 2;
                }
                "--tracker-log" => {
                    cfg.tracker_log = value.map(PathBuf::from);
                    i += 2;
                }
                "--templates" => {
                    cfg.templates_path = value.map(PathBuf::from);
                    i += 2;
                }
                _ => i += 1,
            }
        }
        cfg
    }

    fn build_engine(&self) -> anyhow::Result<ExecutionEngine> {
        let mut config = match &self.config_path {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        if let Some(path) = &self.policy_file {
            config.policy_file = Some(path.clone());
        }
        if let Some(python) = &self.python_path {
            config.apply_overrides(|key| (key == "CODEEXEC_PYTHON").then(|| python.clone()))?;
        }

        let mut options = EngineOptions::default().with_config(config);
        if let Some(path) = &self.tracker_log {
            options = options.with_tracker(Arc::new(JsonLinesTracker::new(path.clone())));
        }
        if let Some(path) = &self.templates_path {
            options = options.with_templates(Arc::new(InMemoryTemplateStore::from_file(path)?));
        }
        Ok(create_engine_with_options(options)?)
    }
}

/// Abort tokens of running `execute` calls, by JSON-RPC id
#[derive(Default)]
struct Inflight {
    tokens: Mutex<HashMap<String, AbortToken>>,
}

impl Inflight {
    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, AbortToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A fresh token for `key`, or `None` while another call holds that id
    fn register(&self, key: &str) -> Option<AbortToken> {
        match self.tokens().entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(AbortToken::new()).clone()),
        }
    }

    fn finish(&self, key: &str) {
        self.tokens().remove(key);
    }

    fn abort(&self, key: &str) -> bool {
        match self.tokens().get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn abort_all(&self) {
        for (_, token) in self.tokens().drain() {
            token.cancel();
        }
    }
}

struct Worker {
    engine: ExecutionEngine,
    inflight: Inflight,
    out: mpsc::UnboundedSender<Value>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "codeexec_worker=info,codeexec=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = WorkerConfig::from_env_and_args();
    let engine = cfg.build_engine()?;
    tracing::info!(
        "codeexec-worker starting (backend={}, policy v{})",
        engine.backend_capabilities().name,
        engine.policy_snapshot().version()
    );

    let (out, mut responses) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(resp) = responses.recv().await {
            let s = serde_json::to_string(&resp)?;
            stdout.write_all(s.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let worker = Arc::new(Worker {
        engine,
        inflight: Inflight::default(),
        out,
    });

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid json-rpc line: {} | err={}", line, e);
                continue;
            }
        };

        let method = parsed.get("method").and_then(|m| m.as_str()).unwrap_or("");
        if method == "shutdown" || method == "exit" {
            worker.inflight.abort_all();
            if let Some(id) = parsed.get("id").cloned() {
                let _ = worker
                    .out
                    .send(json!({ "jsonrpc": "2.0", "result": null, "id": id }));
            }
            break;
        }

        // Each request on its own task so `abort` can reach a running `execute`
        let worker = worker.clone();
        tokio::spawn(async move {
            if let Some(resp) = handle_message(&worker, parsed).await {
                let _ = worker.out.send(resp);
            }
        });
    }

    drop(worker);
    writer.await??;
    Ok(())
}

async fn handle_message(worker: &Worker, msg: Value) -> Option<Value> {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    // Notifications have no id and get no response
    let id = msg.get("id").cloned()?;
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method {
        "initialize" => Ok(initialize(&worker.engine)),
        "execute" => execute(worker, &id, params).await,
        "translate" => translate(&worker.engine, params),
        "get_security_policy" => get_security_policy(&worker.engine, &params),
        "reload_policies" => reload_policies(&worker.engine, &params),
        "abort" => abort(worker, &params),
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    Some(match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    })
}

fn initialize(engine: &ExecutionEngine) -> Value {
    let snapshot = engine.policy_snapshot();
    json!({
        "serverInfo": {
            "name": "codeexec-worker",
            "version": env!("CARGO_PKG_VERSION")
        },
        "languages": Language::ALL,
        "backend": engine.backend_capabilities(),
        "policyVersion": snapshot.version(),
        "policyLoadedAt": snapshot.loaded_at(),
        "pool": engine.pool_stats(),
        "methods": [
            "initialize", "execute", "translate", "get_security_policy",
            "reload_policies", "abort", "shutdown"
        ]
    })
}

fn invalid_params(message: impl std::fmt::Display) -> Value {
    json!({ "code": -32602, "message": format!("Invalid params: {}", message) })
}

fn engine_error(e: &EngineError) -> Value {
    let code = match e {
        EngineError::Validation(_) => -32602,
        EngineError::Backpressure { .. } => -32001,
        EngineError::RateLimited { .. } => -32002,
        EngineError::TemplateNotFound(_) => -32003,
        _ => -32000,
    };
    json!({ "code": code, "message": e.to_string() })
}

fn parse_language(params: &Value, key: &str) -> Result<Language, Value> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid_params(format!("missing {}", key)))?
        .parse::<Language>()
        .map_err(invalid_params)
}

async fn execute(worker: &Worker, id: &Value, params: Value) -> Result<Value, Value> {
    let request = match params.get("template_id").and_then(|v| v.as_str()) {
        Some(template_id) if params.get("source").is_none() => {
            let language = parse_language(&params, "language")?;
            let mut request = worker
                .engine
                .request_from_template(template_id, language)
                .await
                .map_err(|e| engine_error(&e))?;
            if let Some(ms) = params.get("timeout_ms").and_then(|v| v.as_u64()) {
                request = request.with_timeout(Duration::from_millis(ms));
            }
            if let Some(bytes) = params.get("memory_limit_bytes").and_then(|v| v.as_u64()) {
                request = request.with_memory_limit(bytes);
            }
            if let Some(bytes) = params.get("max_output_bytes").and_then(|v| v.as_u64()) {
                request = request.with_max_output(bytes as usize);
            }
            if let Some(requester) = params.get("requester").and_then(|v| v.as_str()) {
                request = request.with_requester(requester);
            }
            request
        }
        _ => serde_json::from_value::<ExecutionRequest>(params).map_err(invalid_params)?,
    };

    let key = id.to_string();
    let token = worker.inflight.register(&key).ok_or_else(|| {
        json!({
            "code": -32600,
            "message": format!("Invalid request: id {} is already in flight", key)
        })
    })?;
    let outcome = worker.engine.execute_with_abort(request, token).await;
    worker.inflight.finish(&key);

    let result = outcome.map_err(|e| engine_error(&e))?;
    let message = result.user_message();
    let mut value = serde_json::to_value(&result).map_err(|e| json!({
        "code": -32603,
        "message": e.to_string()
    }))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("message".to_string(), Value::String(message));
        obj.insert(
            "isSystemFault".to_string(),
            Value::Bool(result.status().is_system_fault()),
        );
    }
    Ok(value)
}

fn translate(engine: &ExecutionEngine, params: Value) -> Result<Value, Value> {
    let request: TranslationRequest = serde_json::from_value(params).map_err(invalid_params)?;
    let result = engine.translate(&request);
    let valid = result.is_valid();
    let mut value = serde_json::to_value(&result).map_err(|e| json!({
        "code": -32603,
        "message": e.to_string()
    }))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("valid".to_string(), Value::Bool(valid));
    }
    Ok(value)
}

fn get_security_policy(engine: &ExecutionEngine, params: &Value) -> Result<Value, Value> {
    let language = parse_language(params, "language")?;
    let policy = engine
        .get_security_policy(language)
        .map_err(|e| engine_error(&e))?;
    serde_json::to_value(policy).map_err(|e| json!({ "code": -32603, "message": e.to_string() }))
}

fn reload_policies(engine: &ExecutionEngine, params: &Value) -> Result<Value, Value> {
    let version = if let Some(path) = params.get("path").and_then(|v| v.as_str()) {
        engine.reload_policies_from_file(std::path::Path::new(path))
    } else if let Some(policies) = params.get("policies") {
        PolicySet::from_json(&policies.to_string()).and_then(|set| engine.reload_policies(set))
    } else {
        return Err(invalid_params("expected `path` or `policies`"));
    }
    .map_err(|e| engine_error(&e))?;
    Ok(json!({ "version": version }))
}

fn abort(worker: &Worker, params: &Value) -> Result<Value, Value> {
    let target = params
        .get("request_id")
        .ok_or_else(|| invalid_params("missing request_id"))?
        .to_string();
    Ok(json!({ "aborted": worker.inflight.abort(&target) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_inflight_id_is_refused() {
        let inflight = Inflight::default();
        let first = inflight.register("7").unwrap();
        assert!(inflight.register("7").is_none());

        // The refused call must not disturb the running one
        assert!(inflight.abort("7"));
        assert!(first.is_cancelled());

        inflight.finish("7");
        assert!(!inflight.abort("7"));
        let again = inflight.register("7").unwrap();
        assert!(!again.is_cancelled());
    }

    #[test]
    fn test_abort_all_cancels_every_call() {
        let inflight = Inflight::default();
        let a = inflight.register("1").unwrap();
        let b = inflight.register("\"b\"").unwrap();
        inflight.abort_all();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(inflight.register("1").is_some());
    }
}
