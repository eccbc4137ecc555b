use crate::error::{EngineError, EngineResult};
use crate::types::{RunId, StepId, WorkspaceId};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Context handed to every action handler
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workspace_id: WorkspaceId,
    pub run_id: RunId,
    pub step_id: StepId,
    /// Structured logger bound to the run and step
    pub span: tracing::Span,
    pub credential: Option<String>,
}

/// A strongly-typed connector action.
///
/// Payloads are validated at the boundary by deserializing into `Input`;
/// a payload that does not fit is a validation error and never retried.
#[async_trait::async_trait]
pub trait Action: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    /// JSON schema advertised for the action input
    fn schema(&self) -> serde_json::Value;

    async fn run(&self, ctx: &ExecutionContext, input: Self::Input) -> anyhow::Result<Self::Output>;
}

/// Type-erased action stored in a connector definition
#[async_trait::async_trait]
pub(crate) trait ErasedAction: Send + Sync {
    fn schema(&self) -> serde_json::Value;

    fn validate(&self, payload: &serde_json::Value) -> Result<(), String>;

    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        payload: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

struct Typed<A>(A);

#[async_trait::async_trait]
impl<A: Action> ErasedAction for Typed<A> {
    fn schema(&self) -> serde_json::Value {
        self.0.schema()
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<(), String> {
        <A::Input as Deserialize>::deserialize(payload)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        payload: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let input: A::Input =
            serde_json::from_value(payload).context("Action input does not match schema")?;
        let output = self.0.run(ctx, input).await?;
        serde_json::to_value(output).context("Failed to serialize action output")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    ApiKey,
    Bearer,
    OAuth2,
}

/// Connector-level rate limit; its presence enables bounded retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub max: u32,
    pub window_ms: u64,
}

impl RateLimitPolicy {
    pub fn new(max: u32, window_ms: u64) -> Self {
        Self { max, window_ms }
    }

    /// Back-off before the retry following `attempt` (1-based): the pace the
    /// policy allows, doubled per failed attempt.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let pace = (self.window_ms / u64::from(self.max.max(1))).max(1);
        Duration::from_millis(pace.saturating_mul(1 << attempt.saturating_sub(1).min(16)))
    }
}

/// A named integration and its callable actions
pub struct ConnectorDefinition {
    pub key: String,
    pub name: String,
    pub auth: AuthKind,
    pub rate_limit: Option<RateLimitPolicy>,
    actions: BTreeMap<String, Arc<dyn ErasedAction>>,
}

impl ConnectorDefinition {
    pub fn new(key: impl Into<String>, name: impl Into<String>, auth: AuthKind) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            auth,
            rate_limit: None,
            actions: BTreeMap::new(),
        }
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    pub fn with_action<A: Action>(mut self, key: impl Into<String>, action: A) -> Self {
        self.actions.insert(key.into(), Arc::new(Typed(action)));
        self
    }

    pub(crate) fn action(&self, key: &str) -> Option<Arc<dyn ErasedAction>> {
        self.actions.get(key).cloned()
    }

    pub fn describe(&self) -> ConnectorInfo {
        ConnectorInfo {
            key: self.key.clone(),
            name: self.name.clone(),
            auth: self.auth,
            rate_limit: self.rate_limit,
            actions: self
                .actions
                .iter()
                .map(|(key, action)| ActionInfo {
                    key: key.clone(),
                    schema: action.schema(),
                })
                .collect(),
        }
    }
}

/// Serializable description of a registered connector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorInfo {
    pub key: String,
    pub name: String,
    pub auth: AuthKind,
    pub rate_limit: Option<RateLimitPolicy>,
    pub actions: Vec<ActionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInfo {
    pub key: String,
    pub schema: serde_json::Value,
}

/// Registry of connectors, built once at startup and shared by reference
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<ConnectorDefinition>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector; a key can only be registered once
    pub fn register(&mut self, definition: ConnectorDefinition) -> EngineResult<()> {
        if self.connectors.contains_key(&definition.key) {
            return Err(EngineError::DuplicateConnector(definition.key));
        }
        tracing::debug!(connector = %definition.key, "Registered connector");
        self.connectors
            .insert(definition.key.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<ConnectorDefinition>> {
        self.connectors.get(key).cloned()
    }

    pub fn list(&self) -> Vec<ConnectorInfo> {
        let mut infos: Vec<_> = self.connectors.values().map(|c| c.describe()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }
}

// Helper functions for action schemas

pub fn json_schema_object(properties: serde_json::Value, required: Vec<&str>) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait::async_trait]
    impl Action for Noop {
        type Input = serde_json::Value;
        type Output = ();

        fn schema(&self) -> serde_json::Value {
            json_schema_object(serde_json::json!({}), vec![])
        }

        async fn run(&self, _ctx: &ExecutionContext, _input: Self::Input) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ConnectorRegistry::new();
        registry
            .register(ConnectorDefinition::new("slack", "Slack", AuthKind::Bearer))
            .unwrap();

        let err = registry
            .register(ConnectorDefinition::new("slack", "Slack again", AuthKind::None))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateConnector(key) if key == "slack"));
        assert_eq!(registry.get("slack").unwrap().name, "Slack");
    }

    #[test]
    fn test_list_describes_actions() {
        let mut registry = ConnectorRegistry::new();
        registry
            .register(
                ConnectorDefinition::new("b", "B", AuthKind::None)
                    .with_rate_limit(RateLimitPolicy::new(10, 1000))
                    .with_action("noop", Noop),
            )
            .unwrap();
        registry
            .register(ConnectorDefinition::new("a", "A", AuthKind::ApiKey))
            .unwrap();

        let infos = registry.list();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].key, "a");
        assert_eq!(infos[1].actions[0].key, "noop");
        assert_eq!(infos[1].rate_limit, Some(RateLimitPolicy::new(10, 1000)));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RateLimitPolicy::new(10, 1000);
        assert_eq!(policy.retry_delay(1), Duration::from_millis(100));
        assert_eq!(policy.retry_delay(2), Duration::from_millis(200));
        assert_eq!(policy.retry_delay(3), Duration::from_millis(400));

        let zero = RateLimitPolicy::new(0, 0);
        assert_eq!(zero.retry_delay(1), Duration::from_millis(1));
    }
}
