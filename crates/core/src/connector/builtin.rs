// Connectors registered by every engine instance

use super::redact::redact_secrets;
use super::registry::{
    json_schema_object, json_schema_string, Action, AuthKind, ConnectorDefinition,
    ConnectorRegistry, ExecutionContext, RateLimitPolicy,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Register `http`, `webhook` and `core`.
pub fn register_builtin_connectors(registry: &mut ConnectorRegistry) -> Result<()> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("runloom/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    registry.register(
        ConnectorDefinition::new("http", "HTTP", AuthKind::Bearer)
            .with_rate_limit(RateLimitPolicy::new(60, 60_000))
            .with_action(
                "request",
                HttpRequestAction {
                    client: client.clone(),
                },
            ),
    )?;
    registry.register(
        ConnectorDefinition::new("webhook", "Webhook", AuthKind::None)
            .with_action("post", WebhookPostAction { client }),
    )?;
    registry.register(
        ConnectorDefinition::new("core", "Core", AuthKind::None).with_action("echo", EchoAction),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestInput {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: Url,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HttpResponseOutput {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

pub struct HttpRequestAction {
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl Action for HttpRequestAction {
    type Input = HttpRequestInput;
    type Output = HttpResponseOutput;

    fn schema(&self) -> serde_json::Value {
        json_schema_object(
            serde_json::json!({
                "method": {"type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"]},
                "url": json_schema_string("Absolute URL to call"),
                "headers": {"type": "object", "additionalProperties": {"type": "string"}},
                "body": {"description": "JSON body"},
                "timeoutMs": {"type": "integer", "minimum": 1}
            }),
            vec!["url"],
        )
    }

    async fn run(&self, ctx: &ExecutionContext, input: HttpRequestInput) -> Result<HttpResponseOutput> {
        let mut request = self
            .client
            .request(input.method.into(), input.url.clone())
            .timeout(Duration::from_millis(input.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)));

        for (name, value) in &input.headers {
            request = request.header(name, value);
        }
        if let Some(token) = &ctx.credential {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &input.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", input.url))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = read_body(response).await?;

        if !status.is_success() {
            anyhow::bail!("HTTP {} from {}: {}", status.as_u16(), input.url, redact_secrets(&body));
        }

        Ok(HttpResponseOutput {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookPostInput {
    pub url: Url,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct WebhookPostOutput {
    pub status: u16,
}

pub struct WebhookPostAction {
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl Action for WebhookPostAction {
    type Input = WebhookPostInput;
    type Output = WebhookPostOutput;

    fn schema(&self) -> serde_json::Value {
        json_schema_object(
            serde_json::json!({
                "url": json_schema_string("Webhook endpoint"),
                "payload": {"description": "JSON document to post"}
            }),
            vec!["url"],
        )
    }

    async fn run(&self, _ctx: &ExecutionContext, input: WebhookPostInput) -> Result<WebhookPostOutput> {
        let response = self
            .client
            .post(input.url.clone())
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .json(&input.payload)
            .send()
            .await
            .with_context(|| format!("Webhook post to {} failed", input.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_body(response).await?;
            anyhow::bail!("Webhook {} answered {}: {}", input.url, status.as_u16(), redact_secrets(&body));
        }

        Ok(WebhookPostOutput {
            status: status.as_u16(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct EchoInput {
    pub value: serde_json::Value,
}

/// Returns its `value` unchanged
pub struct EchoAction;

#[async_trait::async_trait]
impl Action for EchoAction {
    type Input = EchoInput;
    type Output = serde_json::Value;

    fn schema(&self) -> serde_json::Value {
        json_schema_object(serde_json::json!({"value": {}}), vec!["value"])
    }

    async fn run(&self, _ctx: &ExecutionContext, input: EchoInput) -> Result<serde_json::Value> {
        Ok(input.value)
    }
}

/// JSON body when it parses, raw text otherwise
async fn read_body(response: reqwest::Response) -> Result<serde_json::Value> {
    let text = response.text().await.context("Failed to read response body")?;
    Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorExecutor;
    use crate::error::EngineError;
    use crate::types::{RunId, StepId, WorkspaceId};
    use std::sync::Arc;

    fn executor() -> ConnectorExecutor {
        let mut registry = ConnectorRegistry::new();
        register_builtin_connectors(&mut registry).unwrap();
        ConnectorExecutor::new(Arc::new(registry))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workspace_id: WorkspaceId::new(),
            run_id: RunId::new(),
            step_id: StepId::new(),
            span: tracing::Span::none(),
            credential: None,
        }
    }

    #[test]
    fn test_builtins_registered_once() {
        let mut registry = ConnectorRegistry::new();
        register_builtin_connectors(&mut registry).unwrap();

        let keys: Vec<_> = registry.list().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["core", "http", "webhook"]);
        assert!(registry.get("http").unwrap().rate_limit.is_some());
        assert!(registry.get("webhook").unwrap().rate_limit.is_none());

        let err = register_builtin_connectors(&mut registry).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::DuplicateConnector(key)) if key == "http"
        ));
    }

    #[tokio::test]
    async fn test_echo_returns_value() {
        let output = executor()
            .execute("core", "echo", &ctx(), serde_json::json!({"value": {"n": 1}}))
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_http_rejects_bad_url_before_sending() {
        let err = executor()
            .execute("http", "request", &ctx(), serde_json::json!({"url": "not a url"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let err = executor()
            .execute(
                "http",
                "request",
                &ctx(),
                serde_json::json!({"url": "https://example.com", "method": "TRACE"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn test_http_input_defaults() {
        let input: HttpRequestInput =
            serde_json::from_value(serde_json::json!({"url": "https://example.com/a", "method": "post"}))
                .unwrap();
        assert!(matches!(input.method, HttpMethod::Post));
        assert!(input.headers.is_empty());
        assert!(input.body.is_none());
    }
}
