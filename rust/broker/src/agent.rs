/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! The agent boundary. Agents are external collaborators: the broker hands
//! them a merged turn and a per-turn context, and consumes a stream of typed
//! events back. Conversation memory is owned by the agent side, keyed by
//! `thread_id` — the broker never caches it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use waspline_config::Config;

use crate::types::{ChatbotId, ContactId, TenantId};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events an agent emits while processing a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TextChunk {
        text: String,
    },
    ToolCall {
        name: String,
        arguments: serde_json::Value,
        correlation_id: String,
    },
    Final {
        text: String,
    },
    Error {
        kind: String,
        detail: String,
    },
}

/// A tool result echoed back to the agent after the worker executed the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub correlation_id: String,
    pub result: serde_json::Value,
}

/// Per-turn context handed to the agent. Tenant identity travels with every
/// turn; tool execution takes it from here, never from agent output.
#[derive(Debug, Clone, Serialize)]
pub struct TurnContext {
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub contact_id: ContactId,
    pub from_number: String,
    pub language_hint: Option<String>,
}

/// A running agent invocation: the worker drains `events` and pushes results
/// of executed tool calls into `tool_results`.
pub struct AgentRun {
    pub events: mpsc::Receiver<AgentEvent>,
    pub tool_results: mpsc::Sender<ToolResult>,
}

#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum AgentError {
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("agent protocol error: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// Trait and registry
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Start processing a turn. Returns immediately with the event stream;
    /// the invocation runs until it emits `Final` or `Error`, or the caller
    /// drops the run (cancellation).
    async fn run(
        &self,
        thread_id: &str,
        ctx: &TurnContext,
        merged_input: &str,
    ) -> Result<AgentRun, AgentError>;
}

/// `agent_id → Agent`, built once at startup from config.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Build an [`HttpAgent`] per configured agent endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Unavailable` when a client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, AgentError> {
        let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        for (agent_id, endpoint) in &config.agents {
            let agent = HttpAgent::new(
                agent_id.clone(),
                endpoint.endpoint_url.clone(),
                Duration::from_secs(endpoint.timeout_seconds),
            )?;
            agents.insert(agent_id.clone(), Arc::new(agent));
        }
        Ok(Self { agents })
    }

    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).map(Arc::clone)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// For tests and embedded agents.
    pub fn insert(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.id().to_string(), agent);
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP agent
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AgentInvokeRequest<'a> {
    thread_id: &'a str,
    input: &'a str,
    context: &'a TurnContext,
    tool_results: &'a [ToolResult],
}

#[derive(Deserialize)]
struct AgentInvokeResponse {
    #[serde(default)]
    events: Vec<AgentEvent>,
}

/// Agent service spoken to over HTTP. Each round POSTs the turn (plus any
/// tool results collected so far) to the service's `/run`-style endpoint and
/// forwards the returned events; rounds repeat until the service emits a
/// `final` or `error` event.
pub struct HttpAgent {
    agent_id: String,
    endpoint_url: String,
    client: reqwest::Client,
}

impl HttpAgent {
    /// # Errors
    ///
    /// Returns `AgentError::Unavailable` when the HTTP client cannot be built.
    pub fn new(
        agent_id: String,
        endpoint_url: String,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Unavailable(format!("http client build failed: {e}")))?;
        Ok(Self {
            agent_id,
            endpoint_url,
            client,
        })
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    async fn run(
        &self,
        thread_id: &str,
        ctx: &TurnContext,
        merged_input: &str,
    ) -> Result<AgentRun, AgentError> {
        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(32);
        let (result_tx, mut result_rx) = mpsc::channel::<ToolResult>(32);

        let client = self.client.clone();
        let endpoint = self.endpoint_url.clone();
        let agent_id = self.agent_id.clone();
        let thread_id = thread_id.to_string();
        let input = merged_input.to_string();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let mut collected_results: Vec<ToolResult> = Vec::new();
            // Each loop iteration is one model round; tool calls pause the
            // round until the worker feeds results back.
            loop {
                let request = AgentInvokeRequest {
                    thread_id: &thread_id,
                    input: &input,
                    context: &ctx,
                    tool_results: &collected_results,
                };

                let response = match client.post(&endpoint).json(&request).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = event_tx
                            .send(AgentEvent::Error {
                                kind: "unavailable".to_string(),
                                detail: format!("agent request failed: {e}"),
                            })
                            .await;
                        return;
                    }
                };
                if !response.status().is_success() {
                    let status = response.status();
                    let _ = event_tx
                        .send(AgentEvent::Error {
                            kind: "unavailable".to_string(),
                            detail: format!("agent returned {status}"),
                        })
                        .await;
                    return;
                }
                let body: AgentInvokeResponse = match response.json().await {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = event_tx
                            .send(AgentEvent::Error {
                                kind: "protocol".to_string(),
                                detail: format!("bad agent response: {e}"),
                            })
                            .await;
                        return;
                    }
                };

                let mut pending_tools = 0usize;
                for event in body.events {
                    let is_terminal =
                        matches!(event, AgentEvent::Final { .. } | AgentEvent::Error { .. });
                    if matches!(event, AgentEvent::ToolCall { .. }) {
                        pending_tools += 1;
                    }
                    if event_tx.send(event).await.is_err() {
                        debug!(agent = %agent_id, "agent run dropped by worker");
                        return;
                    }
                    if is_terminal {
                        return;
                    }
                }

                if pending_tools == 0 {
                    // No final, no tools: the service misbehaved.
                    let _ = event_tx
                        .send(AgentEvent::Error {
                            kind: "protocol".to_string(),
                            detail: "agent round produced neither final nor tool calls"
                                .to_string(),
                        })
                        .await;
                    return;
                }

                for _ in 0..pending_tools {
                    match result_rx.recv().await {
                        Some(result) => collected_results.push(result),
                        None => {
                            warn!(agent = %agent_id, "tool result channel closed mid-round");
                            return;
                        }
                    }
                }
            }
        });

        Ok(AgentRun {
            events: event_rx,
            tool_results: result_tx,
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted agent for pipeline tests
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::testing::ScriptedAgent;
    use super::*;

    fn ctx() -> TurnContext {
        TurnContext {
            tenant_id: TenantId(1),
            chatbot_id: ChatbotId(2),
            contact_id: ContactId(3),
            from_number: "9613451652".to_string(),
            language_hint: None,
        }
    }

    #[test]
    fn test_agent_event_wire_shape() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"tool_call","name":"send_image","arguments":{"image_url":"https://x"},"correlation_id":"c1"}"#,
        )
        .unwrap();
        match event {
            AgentEvent::ToolCall {
                name,
                correlation_id,
                ..
            } => {
                assert_eq!(name, "send_image");
                assert_eq!(correlation_id, "c1");
            }
            other => panic!("expected tool_call, got {other:?}"),
        }

        let final_event = serde_json::to_value(AgentEvent::Final {
            text: "done".to_string(),
        })
        .unwrap();
        assert_eq!(final_event["type"], "final");
    }

    #[tokio::test]
    async fn test_scripted_agent_streams_final() {
        let agent = ScriptedAgent::replying("ecla", "hello there");
        let mut run = agent.run("t-1", &ctx(), "hi").await.unwrap();
        match run.events.recv().await.unwrap() {
            AgentEvent::Final { text } => assert_eq!(text, "hello there"),
            other => panic!("expected final, got {other:?}"),
        }
        assert_eq!(agent.inputs(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_agent_waits_for_tool_result() {
        let agent = ScriptedAgent::with_script(
            "ecla",
            vec![
                AgentEvent::ToolCall {
                    name: "send_image".to_string(),
                    arguments: serde_json::json!({}),
                    correlation_id: "c1".to_string(),
                },
                AgentEvent::Final {
                    text: "sent!".to_string(),
                },
            ],
        );
        let mut run = agent.run("t-1", &ctx(), "show me").await.unwrap();

        match run.events.recv().await.unwrap() {
            AgentEvent::ToolCall { correlation_id, .. } => {
                run.tool_results
                    .send(ToolResult {
                        correlation_id,
                        result: serde_json::json!({ "ok": true }),
                    })
                    .await
                    .unwrap();
            }
            other => panic!("expected tool_call, got {other:?}"),
        }

        match run.events.recv().await.unwrap() {
            AgentEvent::Final { text } => assert_eq!(text, "sent!"),
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = AgentRegistry::empty();
        assert!(registry.is_empty());
        registry.insert(Arc::new(ScriptedAgent::replying("astro", "hi")));
        assert!(registry.get("astro").is_some());
        assert!(registry.get("ecla").is_none());
        assert_eq!(registry.len(), 1);
    }
}
