//! REST control-plane client

use crate::config::RestConfig;
use crate::errors::{ServiceError, ServiceResult};
use crate::service::ControlPlane;
use crate::types::{ConnectOutcome, CreateOptions, SandboxInfo, SandboxRef, SandboxState};
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Control-plane client for the sandbox REST API
#[derive(Debug, Clone)]
pub struct RestControlPlane {
    client: Client,
    config: RestConfig,
    base: Url,
}

impl RestControlPlane {
    pub fn new(config: RestConfig) -> ServiceResult<Self> {
        debug!(
            base_url = %config.base_url,
            "Creating RestControlPlane with timeout: {}s",
            config.timeout.as_secs()
        );

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        let base = Url::parse(&config.base_url).map_err(|e| {
            ServiceError::InvalidArgument(format!("invalid base url {}: {}", config.base_url, e))
        })?;
        if base.cannot_be_a_base() {
            return Err(ServiceError::InvalidArgument(format!(
                "base url {} cannot carry a path",
                config.base_url
            )));
        }

        Ok(Self {
            client,
            config,
            base,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Endpoint url with each segment percent-encoded under the base path
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.endpoint(segments);
        let mut request = self
            .client
            .request(method, url)
            .header("Content-Type", "application/json");

        if let Some(ref key) = self.config.api_key {
            request = request.header("X-API-Key", key);
        }
        request
    }

    /// Send a request, mapping non-success statuses onto tagged errors
    async fn send(&self, request: RequestBuilder) -> ServiceResult<(StatusCode, JsonValue)> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            debug!(status = status.as_u16(), "Request failed: {}", text);
            return Err(ServiceError::from_status(status.as_u16(), &text));
        }

        let body = if text.trim().is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_str(&text)?
        };
        Ok((status, body))
    }
}

#[async_trait::async_trait]
impl ControlPlane for RestControlPlane {
    async fn create(&self, template: &str, options: &CreateOptions) -> ServiceResult<SandboxRef> {
        let payload = json!({
            "templateID": template,
            "timeout": options.timeout.as_secs(),
            "allow_internet_access": options.allow_internet_access,
            "metadata": options.metadata,
            "envVars": options.env_vars,
        });

        let (_, body) = self
            .send(self.request(Method::POST, &["sandboxes"]).json(&payload))
            .await?;
        let sandbox = parse_sandbox_ref(&body)?;

        info!(sandbox_id = %sandbox.sandbox_id, template, "Created sandbox");
        Ok(sandbox)
    }

    async fn connect(&self, sandbox_id: &str, timeout: Duration) -> ServiceResult<ConnectOutcome> {
        let payload = json!({ "timeout": timeout.as_secs() });
        let request = self.request(Method::POST, &["sandboxes", sandbox_id, "connect"]);

        let (status, body) = self
            .send(request.json(&payload))
            .await?;

        // 201 means the sandbox was paused and has been resumed
        let resumed = status == StatusCode::CREATED;
        let sandbox = if body.is_null() {
            SandboxRef {
                sandbox_id: sandbox_id.to_string(),
                domain: None,
                template_id: None,
            }
        } else {
            parse_sandbox_ref(&body)?
        };

        debug!(sandbox_id, resumed, "Connected to sandbox");
        Ok(ConnectOutcome { sandbox, resumed })
    }

    async fn pause(&self, sandbox_id: &str) -> ServiceResult<()> {
        self.send(self.request(Method::POST, &["sandboxes", sandbox_id, "pause"]))
            .await?;
        Ok(())
    }

    async fn kill(&self, sandbox_id: &str) -> ServiceResult<()> {
        self.send(self.request(Method::DELETE, &["sandboxes", sandbox_id]))
            .await?;
        Ok(())
    }

    async fn get_info(&self, sandbox_id: &str) -> ServiceResult<SandboxInfo> {
        let (_, body) = self
            .send(self.request(Method::GET, &["sandboxes", sandbox_id]))
            .await?;
        parse_sandbox_info(unwrap_data(&body))
    }

    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> ServiceResult<()> {
        let payload = json!({ "timeout": timeout.as_secs() });
        let request = self.request(Method::POST, &["sandboxes", sandbox_id, "timeout"]);
        self.send(request.json(&payload)).await?;
        Ok(())
    }

    async fn list(&self) -> ServiceResult<Vec<SandboxInfo>> {
        let (_, body) = self.send(self.request(Method::GET, &["sandboxes"])).await?;

        let items = unwrap_data(&body)
            .as_array()
            .ok_or_else(|| ServiceError::Decode("sandbox list is not an array".to_string()))?;

        items.iter().map(parse_sandbox_info).collect()
    }
}

/// Responses may wrap the payload in a `data` field
fn unwrap_data(body: &JsonValue) -> &JsonValue {
    match body.get("data") {
        Some(data) if !data.is_null() => data,
        _ => body,
    }
}

fn str_field<'a>(body: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
}

fn time_field(body: &JsonValue, keys: &[&str]) -> Option<DateTime<Utc>> {
    str_field(body, keys)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_sandbox_ref(body: &JsonValue) -> ServiceResult<SandboxRef> {
    let body = unwrap_data(body);
    let sandbox_id = str_field(body, &["sandboxID", "sandboxId", "id"])
        .ok_or_else(|| ServiceError::Decode(format!("response has no sandbox id: {}", body)))?;

    Ok(SandboxRef {
        sandbox_id: sandbox_id.to_string(),
        domain: str_field(body, &["domain", "sandboxDomain"]).map(str::to_string),
        template_id: str_field(body, &["templateID", "templateId"]).map(str::to_string),
    })
}

fn parse_sandbox_info(body: &JsonValue) -> ServiceResult<SandboxInfo> {
    let sandbox_id = str_field(body, &["sandboxID", "sandboxId", "id"])
        .ok_or_else(|| ServiceError::Decode(format!("sandbox entry has no id: {}", body)))?;

    let state = str_field(body, &["state", "status", "State", "Status"])
        .map(|s| s.parse().unwrap_or(SandboxState::Unknown))
        .unwrap_or(SandboxState::Unknown);

    Ok(SandboxInfo {
        sandbox_id: sandbox_id.to_string(),
        template_id: str_field(body, &["templateID", "templateId"]).map(str::to_string),
        state,
        started_at: time_field(body, &["startedAt", "started_at"]),
        end_at: time_field(body, &["endAt", "end_at"]),
    })
}
