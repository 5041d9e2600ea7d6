//! Client surface of a simulation instance.
//!
//! Each instance exposes a readiness probe, a state query and a push
//! channel. The [`SimulationClient`] trait is the seam the provisioner and
//! aggregator depend on; [`HttpSimulationClient`] talks to a real instance
//! over HTTP and WebSocket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::config::SimulationConfig;
use crate::domain::{Endpoint, ProgressEvent, RaceError, Result, ScoreRecord, SignalSource};

/// Instance state as returned by the state query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimState {
    #[serde(alias = "day")]
    pub progress: u32,
    #[serde(alias = "balance")]
    pub metric: f64,
    #[serde(default, alias = "complete")]
    pub terminal: bool,
    #[serde(default)]
    pub score: Option<Value>,
    /// Actions the instance has seen, when it reports a count.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "actions_taken")]
    pub steps: Option<u64>,
}

impl SimState {
    /// Convert to a progress event, resolving the score payload.
    ///
    /// An unrecognised score is logged and dropped; the run then ranks as
    /// unscored rather than failing ingestion.
    pub fn into_event(self, agent: &str, action: Option<String>, source: SignalSource) -> ProgressEvent {
        let score = match self.score.as_ref().filter(|v| !v.is_null()) {
            None => None,
            Some(payload) => match ScoreRecord::from_payload(payload) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(agent = %agent, error = %e, "discarding unparseable score payload");
                    None
                }
            },
        };
        ProgressEvent {
            agent: agent.to_string(),
            progress: self.progress,
            metric: self.metric,
            action,
            terminal: self.terminal,
            score,
            source,
        }
    }
}

/// Push message from an instance's event channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimMessage {
    StateChanged {
        #[serde(flatten)]
        state: SimState,
        #[serde(default)]
        action: Option<String>,
    },
    AgentAction {
        description: String,
        #[serde(default)]
        progress: Option<u32>,
    },
    #[serde(other)]
    Other,
}

#[async_trait]
pub trait SimulationClient: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Readiness probe. `true` once the instance accepts requests.
    async fn ready(&self) -> bool;

    async fn state(&self) -> Result<SimState>;

    /// Open the push channel. The stream ends when the channel closes.
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<SimMessage>>>;
}

/// Builds a client for an endpoint.
pub trait ClientFactory: Send + Sync {
    fn client(&self, endpoint: &Endpoint) -> Arc<dyn SimulationClient>;
}

#[derive(Debug, Clone)]
struct Paths {
    health: String,
    state: String,
    ws: String,
}

pub struct HttpSimulationClient {
    endpoint: Endpoint,
    http: reqwest::Client,
    paths: Paths,
}

impl HttpSimulationClient {
    fn channel_error(&self, reason: impl ToString) -> RaceError {
        RaceError::Channel {
            endpoint: self.endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    fn request_error(&self, reason: impl ToString) -> RaceError {
        RaceError::Simulation {
            endpoint: self.endpoint.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl SimulationClient for HttpSimulationClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn ready(&self) -> bool {
        let url = format!("{}{}", self.endpoint.base_url(), self.paths.health);
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn state(&self) -> Result<SimState> {
        let url = format!("{}{}", self.endpoint.base_url(), self.paths.state);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        if !resp.status().is_success() {
            return Err(self.request_error(format!("GET {} returned {}", self.paths.state, resp.status())));
        }
        resp.json::<SimState>()
            .await
            .map_err(|e| self.request_error(format!("malformed state: {e}")))
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Result<SimMessage>>> {
        let url = self.endpoint.ws_url(&self.paths.ws);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| self.channel_error(e))?;

        let endpoint = self.endpoint.to_string();
        let stream = ws.filter_map(move |msg| {
            let endpoint = endpoint.clone();
            async move {
                match msg {
                    Ok(Message::Text(text)) => {
                        Some(serde_json::from_str::<SimMessage>(&text).map_err(RaceError::from))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(RaceError::Channel {
                        endpoint,
                        reason: e.to_string(),
                    })),
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Factory for [`HttpSimulationClient`]s sharing one connection pool.
pub struct HttpClientFactory {
    http: reqwest::Client,
    paths: Paths,
}

impl HttpClientFactory {
    pub fn new(config: &SimulationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| RaceError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            http,
            paths: Paths {
                health: config.health_path.clone(),
                state: config.state_path.clone(),
                ws: config.ws_path.clone(),
            },
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn client(&self, endpoint: &Endpoint) -> Arc<dyn SimulationClient> {
        Arc::new(HttpSimulationClient {
            endpoint: endpoint.clone(),
            http: self.http.clone(),
            paths: self.paths.clone(),
        })
    }
}
