//! Remote decision hook: a strategy whose `predict` asks an external service.
//!
//! The request carries the step timestamp, every entity's snapshot and a
//! bounded window of past observations. The reply is a list of
//! `ActionToTake`s, validated against the registry before the engine sees it:
//! every entity must be registered and every action kind supported by it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use defilab_core::domain::{
    Action, ActionToTake, EntityKind, GlobalState, InternalState, Observation,
};
use defilab_core::entity::{EntityRegistry, SpotEntity};
use defilab_core::storage::Window;
use defilab_core::strategies::threshold::EXCHANGE;
use defilab_core::strategy::params::{ensure, ensure_fee, ensure_positive, get_or};
use defilab_core::strategy::{
    ParamPoint, SetUpContext, StepContext, Strategy, StrategyParams,
};
use defilab_core::EngineError;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("decision request failed: {0}")]
    Http(String),
    #[error("decision service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decision service unavailable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("invalid decision: {0}")]
    Invalid(String),
}

// ─── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub kind: EntityKind,
    pub global_state: Option<GlobalState>,
    pub internal_state: InternalState,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub timestamp: DateTime<Utc>,
    pub step_index: usize,
    pub entities: BTreeMap<String, EntitySnapshot>,
    pub history: Vec<Observation>,
}

impl DecisionRequest {
    pub fn from_context(ctx: &StepContext<'_>, history: Vec<Observation>) -> Self {
        let entities = ctx
            .entities()
            .iter()
            .map(|(name, e)| {
                (
                    name.to_string(),
                    EntitySnapshot {
                        kind: e.kind(),
                        global_state: e.global_state(),
                        internal_state: e.internal_state(),
                        balance: e.balance(),
                    },
                )
            })
            .collect();
        Self {
            timestamp: ctx.timestamp(),
            step_index: ctx.step_index(),
            entities,
            history,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    #[serde(default)]
    pub actions: Vec<ActionToTake>,
}

/// Rejects actions the engine would refuse at routing time.
pub fn validate_actions(
    registry: &EntityRegistry,
    actions: &[ActionToTake],
) -> Result<(), RemoteError> {
    for (i, to_take) in actions.iter().enumerate() {
        let entity = registry.get(&to_take.entity_name).ok_or_else(|| {
            RemoteError::Invalid(format!(
                "action {i} targets unregistered entity '{}'",
                to_take.entity_name
            ))
        })?;
        let kind = to_take.action.kind();
        if !entity.kind().supports(kind) {
            return Err(RemoteError::Invalid(format!(
                "action {i}: {} entity '{}' does not support {kind}",
                entity.kind(),
                to_take.entity_name
            )));
        }
    }
    Ok(())
}

// ─── Sources ────────────────────────────────────────────────────────

/// Anything that can turn a snapshot into actions.
pub trait DecisionSource: Send {
    fn decide(&self, request: &DecisionRequest) -> Result<Vec<ActionToTake>, RemoteError>;
}

impl<F> DecisionSource for F
where
    F: Fn(&DecisionRequest) -> Result<Vec<ActionToTake>, RemoteError> + Send,
{
    fn decide(&self, request: &DecisionRequest) -> Result<Vec<ActionToTake>, RemoteError> {
        self(request)
    }
}

/// JSON-over-HTTP decision service with a per-request timeout and bounded
/// retries on transient failures (connect, timeout, 429, 5xx).
#[derive(Debug, Clone)]
pub struct RemoteDecisionClient {
    client: Client,
    url: String,
    max_attempts: u32,
    base_delay: Duration,
}

impl RemoteDecisionClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        })
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }
}

impl DecisionSource for RemoteDecisionClient {
    fn decide(&self, request: &DecisionRequest) -> Result<Vec<ActionToTake>, RemoteError> {
        let mut last = String::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                std::thread::sleep(self.base_delay * 2u32.pow(attempt - 1));
            }

            match self.client.post(&self.url).json(request).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let decoded: DecisionResponse = resp.json().map_err(|e| {
                            RemoteError::Invalid(format!("undecodable response: {e}"))
                        })?;
                        debug!(
                            step = request.step_index,
                            actions = decoded.actions.len(),
                            "decision received"
                        );
                        return Ok(decoded.actions);
                    }
                    let body = resp.text().unwrap_or_default();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
                    {
                        warn!(attempt, status = status.as_u16(), "decision service retry");
                        last = format!("HTTP {status}: {body}");
                        continue;
                    }
                    return Err(RemoteError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!(attempt, error = %e, "decision service retry");
                    last = e.to_string();
                }
                Err(e) => return Err(RemoteError::Http(e.to_string())),
            }
        }

        Err(RemoteError::Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}

// ─── Agent strategy ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentParams {
    pub initial_balance: f64,
    pub trading_fee: f64,
    /// Ask the source every this many steps.
    pub decision_interval: usize,
    /// Past observations sent with each request.
    pub history_window: usize,
}

impl StrategyParams for AgentParams {
    fn from_point(point: &ParamPoint) -> Result<Self, defilab_core::ConfigError> {
        let initial_balance = get_or(point, "INITIAL_BALANCE", 100_000.0);
        let trading_fee = get_or(point, "TRADING_FEE", 0.005);
        let interval = get_or(point, "DECISION_INTERVAL", 1.0);
        let window = get_or(point, "HISTORY_WINDOW", 30.0);

        ensure_positive("INITIAL_BALANCE", initial_balance)?;
        ensure_fee("TRADING_FEE", trading_fee)?;
        ensure(
            interval >= 1.0 && interval.fract() == 0.0,
            "DECISION_INTERVAL",
            interval,
            "must be a whole number >= 1",
        )?;
        ensure(
            window >= 0.0 && window.fract() == 0.0,
            "HISTORY_WINDOW",
            window,
            "must be a whole number >= 0",
        )?;

        Ok(Self {
            initial_balance,
            trading_fee,
            decision_interval: interval as usize,
            history_window: window as usize,
        })
    }

    fn to_point(&self) -> ParamPoint {
        ParamPoint::from([
            ("INITIAL_BALANCE".to_string(), self.initial_balance),
            ("TRADING_FEE".to_string(), self.trading_fee),
            ("DECISION_INTERVAL".to_string(), self.decision_interval as f64),
            ("HISTORY_WINDOW".to_string(), self.history_window as f64),
        ])
    }
}

/// Single spot exchange driven by a `DecisionSource`.
pub struct AgentStrategy<D: DecisionSource> {
    params: AgentParams,
    source: D,
}

impl<D: DecisionSource> AgentStrategy<D> {
    pub fn new(params: AgentParams, source: D) -> Self {
        Self { params, source }
    }
}

impl<D: DecisionSource> Strategy for AgentStrategy<D> {
    type Params = AgentParams;

    fn params(&self) -> &AgentParams {
        &self.params
    }

    fn set_up(&mut self, ctx: &mut SetUpContext<'_>) -> Result<(), EngineError> {
        ctx.register(EXCHANGE, SpotEntity::new(self.params.trading_fee))?;
        ctx.execute(ActionToTake::new(
            EXCHANGE,
            Action::deposit(self.params.initial_balance),
        ))
        .map_err(EngineError::SetUp)?;
        Ok(())
    }

    fn predict(&mut self, ctx: &StepContext<'_>) -> Result<Vec<ActionToTake>, EngineError> {
        if (ctx.step_index() + 1) % self.params.decision_interval != 0 {
            return Ok(Vec::new());
        }

        let history = if self.params.history_window == 0 {
            Vec::new()
        } else {
            ctx.history(&Window::Last(self.params.history_window))?
        };
        let request = DecisionRequest::from_context(ctx, history);
        let actions = self
            .source
            .decide(&request)
            .map_err(|e| EngineError::Decision(e.to_string()))?;
        validate_actions(ctx.entities(), &actions)
            .map_err(|e| EngineError::Decision(e.to_string()))?;
        Ok(actions)
    }
}
