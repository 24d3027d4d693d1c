//! Administrative command channel: line-delimited JSON over a local Unix
//! socket. The dispatcher is transport-independent so it can be tested on
//! plain strings.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::config::ConfigHandle;
use crate::engine::{EngineHandle, EnginePrefs};
use crate::error::{GateError, Result};
use crate::manifest::OrchestratorHandle;
use crate::rules::{Rule, RuleAction, RuleCache, RuleSource, RuleStore};
use crate::stats::GateStats;

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "commandId", default)]
    pub command_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    #[serde(rename = "commandId")]
    pub command_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: String,
}

impl CommandResponse {
    fn ok(command_id: String, data: Option<Value>) -> Self {
        Self {
            command_id,
            success: true,
            error: None,
            data,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn err(command_id: String, error: String) -> Self {
        Self {
            command_id,
            success: false,
            error: Some(error),
            data: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdateRulesPayload {
    #[serde(default)]
    add: Vec<AddRuleEntry>,
    #[serde(default)]
    remove: Vec<RemoveRuleEntry>,
}

#[derive(Debug, Deserialize)]
struct AddRuleEntry {
    domain: String,
    action: RuleAction,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveRuleEntry {
    domain: String,
    action: RuleAction,
}

/// Everything a command needs to touch.
pub struct CommandContext {
    pub store: Arc<RuleStore>,
    pub rule_cache: Arc<RuleCache>,
    pub response_cache: Arc<ResponseCache>,
    pub stats: Arc<GateStats>,
    pub engine: EngineHandle,
    pub orchestrator: Option<OrchestratorHandle>,
    pub config: Arc<ConfigHandle>,
    pub config_path: Option<PathBuf>,
}

pub struct CommandHandler {
    ctx: CommandContext,
}

impl CommandHandler {
    pub fn new(ctx: CommandContext) -> Self {
        Self { ctx }
    }

    /// Handle one request line; always produces a response line.
    pub async fn handle_line(&self, line: &str) -> String {
        let request: CommandRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                let response = CommandResponse::err(
                    Uuid::new_v4().to_string(),
                    format!("malformed command: {}", err),
                );
                return serde_json::to_string(&response).expect("response serializes");
            }
        };

        let command_id = request
            .command_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(command = %request.kind, id = %command_id, "admin command");

        let response = match self.dispatch(&request).await {
            Ok(data) => CommandResponse::ok(command_id, data),
            Err(err) => CommandResponse::err(command_id, err.to_string()),
        };
        serde_json::to_string(&response).expect("response serializes")
    }

    async fn dispatch(&self, request: &CommandRequest) -> Result<Option<Value>> {
        match request.kind.as_str() {
            "syncRules" => self.sync_rules().await,
            "clearCache" => self.clear_caches(),
            "getStatus" => self.status().await,
            "updateRules" => self.update_rules(request.payload.as_ref()),
            "reloadConfiguration" => self.reload_configuration().await,
            other => Err(GateError::CommandInvalid(format!(
                "unsupported command type: {}",
                other
            ))),
        }
    }

    async fn sync_rules(&self) -> Result<Option<Value>> {
        let orchestrator = self.ctx.orchestrator.as_ref().ok_or_else(|| {
            GateError::CommandInvalid("no rule sources configured".to_string())
        })?;
        let summary = orchestrator.sync_now().await?;
        Ok(Some(serde_json::to_value(summary)?))
    }

    fn clear_caches(&self) -> Result<Option<Value>> {
        let responses = self.ctx.response_cache.len();
        self.ctx.response_cache.clear();
        self.ctx.rule_cache.clear();
        info!(responses, "caches cleared by admin command");
        Ok(Some(json!({ "clearedResponses": responses })))
    }

    async fn status(&self) -> Result<Option<Value>> {
        let engine = self.ctx.engine.status().await;
        let manifest_identifier = self
            .ctx
            .orchestrator
            .as_ref()
            .map(|o| o.current_manifest_identifier().to_string());
        Ok(Some(json!({
            "engine": engine,
            "stats": self.ctx.stats.snapshot(),
            "ruleCount": self.ctx.store.rule_count(),
            "responseCacheEntries": self.ctx.response_cache.len(),
            "currentManifestIdentifier": manifest_identifier,
        })))
    }

    fn update_rules(&self, payload: Option<&Value>) -> Result<Option<Value>> {
        let payload = payload.ok_or_else(|| {
            GateError::CommandInvalid("updateRules requires a payload".to_string())
        })?;
        let payload: UpdateRulesPayload = serde_json::from_value(payload.clone())
            .map_err(|e| GateError::CommandInvalid(format!("bad updateRules payload: {}", e)))?;

        let mut added = 0usize;
        let mut invalid = 0usize;
        let mut removed = 0usize;

        let mut tx = self.ctx.store.begin_tx();
        for entry in payload.add {
            match Rule::from_pattern(&entry.domain, entry.action, entry.priority, RuleSource::Remote)
            {
                Some(mut rule) => {
                    rule.comment = entry.comment;
                    tx.add([rule]);
                    added += 1;
                }
                None => invalid += 1,
            }
        }
        for entry in payload.remove {
            if tx.remove(&entry.domain, entry.action) {
                removed += 1;
            }
        }
        tx.commit()?;
        self.ctx.rule_cache.clear();

        Ok(Some(json!({
            "added": added,
            "removed": removed,
            "invalid": invalid,
        })))
    }

    async fn reload_configuration(&self) -> Result<Option<Value>> {
        let path = self.ctx.config_path.as_deref();
        let config = crate::config::Config::load(path)?;
        let prefs = EnginePrefs {
            upstreams: config
                .dns_servers
                .iter()
                .map(|ip| std::net::SocketAddr::new(*ip, 53))
                .collect(),
            vpn_cidrs: config.vpn_resolvers.clone(),
            cache_policy: config.cache_policy(),
            chain_preservation: config.enable_chain_preservation,
        };
        self.ctx.config.update(config)?;
        self.ctx.engine.preferences_changed(prefs).await;
        Ok(Some(json!({ "reloaded": true })))
    }
}

/// Serve the command channel on a Unix socket. Each connection is a stream
/// of JSON lines, one response line per request line.
pub fn spawn_command_server(
    path: PathBuf,
    handler: Arc<CommandHandler>,
) -> Result<JoinHandle<()>> {
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "command channel listening");

    let join = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "command channel accept failed");
                    continue;
                }
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let mut response = handler.handle_line(&line).await;
                    response.push('\n');
                    if write_half.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(join)
}
