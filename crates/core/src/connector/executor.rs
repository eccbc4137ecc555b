use super::registry::{ConnectorRegistry, ExecutionContext};
use crate::error::{EngineError, EngineResult};
use std::sync::Arc;

/// Attempts granted to a connector that declares a rate-limit policy
pub const RATE_LIMITED_ATTEMPTS: u32 = 3;

/// Resolves, validates and runs connector actions
#[derive(Clone)]
pub struct ConnectorExecutor {
    registry: Arc<ConnectorRegistry>,
    max_attempts: u32,
}

impl ConnectorExecutor {
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        Self {
            registry,
            max_attempts: RATE_LIMITED_ATTEMPTS,
        }
    }

    /// Execute `connector.action` with `payload`.
    ///
    /// Unknown connectors/actions and invalid payloads fail before the handler
    /// runs. Rate-limited connectors get bounded retry with back-off; all
    /// others run exactly once.
    pub async fn execute(
        &self,
        connector_key: &str,
        action_key: &str,
        ctx: &ExecutionContext,
        payload: serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        let connector = self
            .registry
            .get(connector_key)
            .ok_or_else(|| EngineError::not_found(format!("connector {}", connector_key)))?;
        let action = connector.action(action_key).ok_or_else(|| {
            EngineError::not_found(format!("action {}.{}", connector_key, action_key))
        })?;

        action
            .validate(&payload)
            .map_err(|message| EngineError::Validation {
                connector: connector_key.to_string(),
                action: action_key.to_string(),
                message,
            })?;

        let attempts = match connector.rate_limit {
            Some(_) => self.max_attempts,
            None => 1,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match action.invoke(ctx, payload.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            let retries_left = attempts - attempt;
            if let Some(policy) = connector.rate_limit {
                tracing::warn!(
                    parent: &ctx.span,
                    connector = connector_key,
                    action = action_key,
                    attempt_number = attempt,
                    retries_left,
                    error = %format!("{:#}", err),
                    "Connector action attempt failed"
                );

                if retries_left > 0 {
                    tokio::time::sleep(policy.retry_delay(attempt)).await;
                    continue;
                }
            }

            return Err(EngineError::ConnectorExecution {
                connector: connector_key.to_string(),
                action: action_key.to_string(),
                attempts: attempt,
                message: format!("{:#}", err),
            });
        }
    }
}
