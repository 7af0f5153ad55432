//! IronMQ driver using the v3 REST API.
//!
//! Queues are addressed by name and created on first post. Counts come from
//! the queue info document: `size` is the current count and `total_messages`
//! the lifetime total. Clearing uses the service's own clear call, since
//! IronMQ queues have no delayed or buried sub-states to drain separately.
//!
//! A `404` from the service is reported as `QueueNotFound` for counts and
//! clears.

use crate::config::DriverOptions;
use crate::driver::{not_connected, QueueDriver};
use crate::error::{ConfigurationError, QueueError};
use crate::message::QueueName;
use crate::provider::BackendType;
use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "iron_tests.rs"]
mod tests;

/// Queues requested per page when listing
const LIST_PAGE_SIZE: usize = 100;

const DEFAULT_PROTOCOL: &str = "https";
const DEFAULT_PORT: u64 = 443;
const DEFAULT_API_VERSION: u64 = 3;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct PostMessagesRequest<'a> {
    messages: Vec<PostMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueueListResponse {
    #[serde(default)]
    queues: Vec<QueueSummary>,
}

#[derive(Debug, Deserialize)]
struct QueueSummary {
    name: String,
}

#[derive(Debug, Deserialize)]
struct QueueInfoResponse {
    queue: QueueInfo,
}

/// Queue statistics as reported by the service
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub total_messages: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    msg: String,
}

// ============================================================================
// HTTP Client
// ============================================================================

struct IronClient {
    http_client: HttpClient,
    base_url: String,
    token: String,
}

impl IronClient {
    fn new(options: &DriverOptions) -> Result<Self, QueueError> {
        let host = options.require_string("host")?;
        let token = options.require_string("token")?;
        let project = options.require_string("project")?;
        let protocol = options
            .get_string("protocol")
            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string());
        if protocol != "http" && protocol != "https" {
            return Err(ConfigurationError::Invalid {
                key: "protocol".to_string(),
                message: format!("'{}' is neither http nor https", protocol),
            }
            .into());
        }
        let port = options.get_u64("port")?.unwrap_or(DEFAULT_PORT);
        let api_version = options
            .get_u64("api_version")?
            .unwrap_or(DEFAULT_API_VERSION);
        let timeout = options.get_u64("timeout")?.unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(timeout))
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            base_url: format!(
                "{}://{}:{}/{}/projects/{}",
                protocol,
                host,
                port,
                api_version,
                urlencoding::encode(&project)
            ),
            token,
        })
    }

    fn queue_path(queue: &QueueName) -> String {
        format!("/queues/{}", urlencoding::encode(queue.as_str()))
    }

    /// Send a request and return the body of a successful response.
    ///
    /// `queue` names the queue a `404` refers to.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        queue: Option<&QueueName>,
    ) -> Result<String, QueueError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .header("Authorization", format!("OAuth {}", self.token))
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("IronMQ request to {} failed: {}", url, e),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to read IronMQ response: {}", e),
            })?;

        debug!(%method, path, status = status.as_u16(), "IronMQ call finished");

        if status.is_success() {
            return Ok(text);
        }

        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.msg)
            .unwrap_or_default();
        let message = if message.is_empty() { text } else { message };

        Err(match (status.as_u16(), queue) {
            (404, Some(queue)) => QueueError::QueueNotFound {
                queue_name: queue.to_string(),
            },
            (401 | 403, _) => {
                QueueError::AuthenticationFailed { message }
            }
            _ => QueueError::ProviderError {
                provider: BackendType::IronMq.to_string(),
                code: status.as_u16().to_string(),
                message,
            },
        })
    }

    async fn list_page(
        &self,
        per_page: usize,
        previous: Option<&str>,
    ) -> Result<Vec<String>, QueueError> {
        let mut path = format!("/queues?per_page={}", per_page);
        if let Some(previous) = previous {
            path.push_str(&format!("&previous={}", urlencoding::encode(previous)));
        }

        let body = self.send::<()>(Method::GET, &path, None, None).await?;
        let page: QueueListResponse = parse_json(&body)?;
        Ok(page.queues.into_iter().map(|q| q.name).collect())
    }

    async fn queue_info(&self, queue: &QueueName) -> Result<QueueInfo, QueueError> {
        let body = self
            .send::<()>(Method::GET, &Self::queue_path(queue), None, Some(queue))
            .await?;
        let info: QueueInfoResponse = parse_json(&body)?;
        Ok(info.queue)
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, QueueError> {
    serde_json::from_str(body).map_err(|e| QueueError::Protocol {
        message: format!("Unexpected IronMQ response: {}", e),
    })
}

// ============================================================================
// Driver
// ============================================================================

/// Queue driver for IronMQ
#[derive(Default)]
pub struct IronMqDriver {
    client: Option<IronClient>,
}

impl IronMqDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&IronClient, QueueError> {
        self.client
            .as_ref()
            .ok_or_else(|| not_connected(BackendType::IronMq))
    }

    /// Full statistics for a queue
    pub async fn queue_info(&self, queue: &QueueName) -> Result<QueueInfo, QueueError> {
        self.client()?.queue_info(queue).await
    }
}

impl fmt::Debug for IronMqDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IronMqDriver")
            .field("base_url", &self.client.as_ref().map(|c| c.base_url.as_str()))
            .finish()
    }
}

#[async_trait]
impl QueueDriver for IronMqDriver {
    async fn open_connection(&mut self, options: &DriverOptions) -> Result<(), QueueError> {
        let options = self.resolve_options(options)?;
        let client = IronClient::new(&options)?;

        // A cheap authenticated call so bad hosts or tokens fail here, not mid-test
        client.list_page(1, None).await.map_err(|e| match e {
            QueueError::ProviderError { code, message, .. } => QueueError::ConnectionFailed {
                message: format!("IronMQ rejected the connection ({}): {}", code, message),
            },
            other => other,
        })?;

        info!(base_url = %client.base_url, "Connected to IronMQ");
        self.client = Some(client);
        Ok(())
    }

    async fn add_message_to_queue(
        &mut self,
        message: &str,
        queue: &QueueName,
    ) -> Result<(), QueueError> {
        let request = PostMessagesRequest {
            messages: vec![PostMessage { body: message }],
        };
        let path = format!("{}/messages", IronClient::queue_path(queue));

        self.client()?
            .send(Method::POST, &path, Some(&request), Some(queue))
            .await?;
        debug!(queue = %queue, "Posted message");
        Ok(())
    }

    async fn queues(&mut self) -> Result<Vec<String>, QueueError> {
        let client = self.client()?;
        let mut names: Vec<String> = Vec::new();

        loop {
            let cursor = names.last().map(String::as_str);
            let page = client.list_page(LIST_PAGE_SIZE, cursor).await?;
            // A server that ignores `previous` repeats the page we already hold
            if cursor.is_some() && page.last().map(String::as_str) == cursor {
                warn!(cursor = ?cursor, "IronMQ ignored the list cursor; stopping pagination");
                return Ok(names);
            }
            let full_page = page.len() == LIST_PAGE_SIZE;
            names.extend(page);
            if !full_page {
                return Ok(names);
            }
        }
    }

    async fn current_count(&mut self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.queue_info(queue).await?.size)
    }

    async fn total_count(&mut self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.queue_info(queue).await?.total_messages)
    }

    async fn clear_queue(&mut self, queue: &QueueName) -> Result<(), QueueError> {
        let path = format!("{}/messages", IronClient::queue_path(queue));
        self.client()?
            .send(Method::DELETE, &path, Some(&serde_json::json!({})), Some(queue))
            .await?;
        debug!(queue = %queue, "Cleared IronMQ queue");
        Ok(())
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["host", "token", "project"]
    }

    fn default_config(&self) -> DriverOptions {
        DriverOptions::new()
            .with("protocol", DEFAULT_PROTOCOL)
            .with("port", DEFAULT_PORT)
            .with("api_version", DEFAULT_API_VERSION)
            .with("timeout", DEFAULT_TIMEOUT_SECS)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::IronMq
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn close_connection(&mut self) {
        self.client = None;
    }
}
