//! AWS SQS driver using the HTTP query API.
//!
//! Requests are plain HTTP calls signed with AWS Signature Version 4, which
//! keeps the driver usable against any SQS-compatible endpoint (LocalStack,
//! ElasticMQ) and lets unit tests mock the service with `wiremock`.
//!
//! ## Addressing
//!
//! SQS addresses queues by server-assigned URL. The driver resolves a name by
//! listing every queue and matching the last path segment of each URL,
//! ignoring case. A name with no match raises `QueueNotFound`; SQS never
//! creates queues implicitly on send.
//!
//! ## Counts
//!
//! SQS exposes one approximate counter, `ApproximateNumberOfMessages`, and the
//! driver reports it for both the current and the total count. The two values
//! are therefore never independent on this backend.
//!
//! ## Authentication
//!
//! Credentials are taken from, in order: the `key`/`secret`/`token` options,
//! the shared credentials file profile named by the `profile` option, the
//! `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`/`AWS_SESSION_TOKEN` variables,
//! and finally the `AWS_PROFILE` (or `default`) profile.
//! Connecting sends a single `ListQueues` call, so an unreachable endpoint or
//! rejected credentials fail at connect rather than on the first operation.

use crate::config::DriverOptions;
use crate::driver::{not_connected, QueueDriver};
use crate::error::{ConfigurationError, QueueError};
use crate::message::QueueName;
use crate::provider::BackendType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

/// SQS query API version sent with every request unless overridden
pub const DEFAULT_API_VERSION: &str = "2012-11-05";

/// Largest message body SQS accepts
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Messages requested per drain batch (the SQS maximum)
const RECEIVE_BATCH_SIZE: u32 = 10;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Error Types
// ============================================================================

/// SQS specific errors
#[derive(Debug, thiserror::Error)]
enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("SQS service error: {code} - {message}")]
    Service { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Malformed response: {0}")]
    Serialization(String),
}

impl From<SqsError> for QueueError {
    fn from(err: SqsError) -> Self {
        match err {
            SqsError::Authentication(message) => QueueError::AuthenticationFailed { message },
            SqsError::Network(message) => QueueError::ConnectionFailed { message },
            SqsError::Service { code, message } => QueueError::ProviderError {
                provider: BackendType::AwsSqs.to_string(),
                code,
                message,
            },
            SqsError::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            SqsError::Serialization(message) => QueueError::Protocol { message },
        }
    }
}

impl SqsError {
    /// Attribute a NonExistentQueue reply to the queue the call addressed
    fn for_queue(self, queue: &QueueName) -> Self {
        match self {
            SqsError::QueueNotFound(_) => SqsError::QueueNotFound(queue.to_string()),
            other => other,
        }
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Access key pair, with a session token for temporary credentials
#[derive(Clone, PartialEq, Eq)]
struct AwsCredentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AwsCredentials {
    fn resolve(options: &DriverOptions) -> Result<Self, QueueError> {
        if let (Some(access_key), Some(secret_key)) =
            (options.get_string("key"), options.get_string("secret"))
        {
            return Ok(Self {
                access_key,
                secret_key,
                session_token: options.get_string("token"),
            });
        }

        if let Some(profile) = options.get_string("profile") {
            return Self::from_profile(&profile)?.ok_or_else(|| {
                QueueError::Configuration(ConfigurationError::Invalid {
                    key: "profile".to_string(),
                    message: format!("profile '{}' has no credentials", profile),
                })
            });
        }

        if let Some(credentials) = Self::from_environment() {
            return Ok(credentials);
        }

        let profile = std::env::var("AWS_PROFILE").unwrap_or_else(|_| "default".to_string());
        Self::from_profile(&profile)?.ok_or_else(|| QueueError::ConnectionFailed {
            message: "no AWS credentials found in options, environment or shared credentials file"
                .to_string(),
        })
    }

    fn from_environment() -> Option<Self> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        if access_key.is_empty() || secret_key.is_empty() {
            return None;
        }

        Some(Self {
            access_key,
            secret_key,
            session_token: std::env::var("AWS_SESSION_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
        })
    }

    /// Read a profile from the shared credentials file, `None` if absent
    fn from_profile(profile: &str) -> Result<Option<Self>, QueueError> {
        let Some(path) = shared_credentials_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        let file = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .build()
            .map_err(ConfigurationError::from)?;

        let access_key = file.get_string(&format!("{}.aws_access_key_id", profile));
        let secret_key = file.get_string(&format!("{}.aws_secret_access_key", profile));

        Ok(match (access_key, secret_key) {
            (Ok(access_key), Ok(secret_key)) => Some(Self {
                access_key,
                secret_key,
                session_token: file
                    .get_string(&format!("{}.aws_session_token", profile))
                    .ok(),
            }),
            _ => None,
        })
    }
}

fn shared_credentials_path() -> Option<PathBuf> {
    match std::env::var("AWS_SHARED_CREDENTIALS_FILE") {
        Ok(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => dirs::home_dir().map(|home| home.join(".aws").join("credentials")),
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
#[derive(Clone)]
struct AwsV4Signer {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(credentials: AwsCredentials, region: String) -> Self {
        Self {
            credentials,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Headers that authenticate a request, keyed by lowercase-insensitive name
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_query_string = canonical_query(query_params);

        // Canonical headers (must be sorted)
        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(token) = &self.credentials.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query_string, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.credentials.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization_header),
            ("x-amz-date".to_string(), amz_date),
            ("host".to_string(), host.to_string()),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        headers
    }

    /// kSecret → kDate → kRegion → kService → kSigning, then sign
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.credentials.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes());

        hex::encode(signature)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this never fails
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sorted, RFC 3986 encoded query string
fn canonical_query(query_params: &HashMap<String, String>) -> String {
    let mut pairs = query_params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// HTTP Client
// ============================================================================

/// Connected state: HTTP client, signer and endpoint
struct SqsClient {
    http_client: HttpClient,
    signer: AwsV4Signer,
    endpoint: String,
    host: String,
    api_version: String,
}

impl SqsClient {
    fn new(options: &DriverOptions) -> Result<Self, QueueError> {
        let region = options.require_string("region")?;
        let endpoint = options
            .get_string("endpoint")
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", region));
        let endpoint = endpoint.trim_end_matches('/').to_string();

        let url = url::Url::parse(&endpoint).map_err(|e| ConfigurationError::Invalid {
            key: "endpoint".to_string(),
            message: e.to_string(),
        })?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConfigurationError::Invalid {
                    key: "endpoint".to_string(),
                    message: format!("'{}' has no host", endpoint),
                }
                .into())
            }
        };

        let credentials = AwsCredentials::resolve(options)?;
        let timeout = options.get_u64("timeout")?.unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(timeout))
            .build()
            .map_err(|e| SqsError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer: AwsV4Signer::new(credentials, region),
            endpoint,
            host,
            api_version: options
                .get_string("version")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        })
    }

    /// Send a signed query API action and return the XML body
    async fn call(
        &self,
        action: &str,
        mut params: HashMap<String, String>,
    ) -> Result<String, SqsError> {
        params.insert("Action".to_string(), action.to_string());
        params.insert("Version".to_string(), self.api_version.clone());

        let path = "/";
        let auth_headers =
            self.signer
                .sign_request("POST", &self.host, path, &params, "", &Utc::now());

        let url = format!("{}{}?{}", self.endpoint, path, canonical_query(&params));
        let mut request = self.http_client.post(&url);
        for (key, value) in auth_headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::Network(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::Network(format!("Connection failed: {}", e))
            } else {
                SqsError::Network(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| SqsError::Network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&response_body, status.as_u16()));
        }

        debug!(action, status = status.as_u16(), "SQS call succeeded");
        Ok(response_body)
    }

    /// Every queue URL, following `NextToken` pages
    async fn list_queue_urls(&self) -> Result<Vec<String>, SqsError> {
        let mut urls = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut params = HashMap::new();
            params.insert("MaxResults".to_string(), "1000".to_string());
            if let Some(token) = next_token.take() {
                params.insert("NextToken".to_string(), token);
            }

            let response = self.call("ListQueues", params).await?;
            for (name, text) in collect_elements(&response, &["QueueUrl", "NextToken"])? {
                match name.as_str() {
                    "QueueUrl" => urls.push(text),
                    _ => next_token = Some(text),
                }
            }

            if next_token.is_none() {
                return Ok(urls);
            }
        }
    }

    /// Find a queue URL by name with a case-insensitive scan
    async fn queue_url(&self, queue: &QueueName) -> Result<String, SqsError> {
        self.list_queue_urls()
            .await?
            .into_iter()
            .find(|url| queue.matches(queue_name_from_url(url)))
            .ok_or_else(|| SqsError::QueueNotFound(queue.to_string()))
    }

    async fn approximate_count(&self, queue: &QueueName) -> Result<u64, SqsError> {
        let mut params = HashMap::new();
        params.insert("QueueUrl".to_string(), self.queue_url(queue).await?);
        params.insert(
            "AttributeName.1".to_string(),
            "ApproximateNumberOfMessages".to_string(),
        );

        let response = self
            .call("GetQueueAttributes", params)
            .await
            .map_err(|e| e.for_queue(queue))?;
        parse_attribute(&response, "ApproximateNumberOfMessages")?
            .ok_or_else(|| {
                SqsError::Serialization(
                    "ApproximateNumberOfMessages missing from response".to_string(),
                )
            })?
            .parse::<u64>()
            .map_err(|e| SqsError::Serialization(format!("Invalid message count: {}", e)))
    }
}

// ============================================================================
// XML Parsing
// ============================================================================

/// Text content of every element named in `wanted`, in document order
fn collect_elements(xml: &str, wanted: &[&str]) -> Result<Vec<(String, String)>, SqsError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut found = Vec::new();
    let mut current: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                current = wanted.contains(&name.as_str()).then_some(name);
            }
            Ok(Event::Text(e)) => {
                if let Some(name) = current.take() {
                    let text = e.unescape().map_err(|e| {
                        SqsError::Serialization(format!("Failed to parse XML: {}", e))
                    })?;
                    found.push((name, text.into_owned()));
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SqsError::Serialization(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(found)
}

/// Value of a named `<Attribute>` in a GetQueueAttributes response
fn parse_attribute(xml: &str, attribute: &str) -> Result<Option<String>, SqsError> {
    let elements = collect_elements(xml, &["Name", "Value"])?;
    let mut pending_name: Option<String> = None;

    for (element, text) in elements {
        match element.as_str() {
            "Name" => pending_name = Some(text),
            _ if pending_name.as_deref() == Some(attribute) => return Ok(Some(text)),
            _ => pending_name = None,
        }
    }

    Ok(None)
}

/// Map an SQS error document to an error kind
fn parse_error_response(xml: &str, status_code: u16) -> SqsError {
    let elements = collect_elements(xml, &["Code", "Message"]).unwrap_or_default();

    let code = elements
        .iter()
        .find(|(name, _)| name == "Code")
        .map(|(_, text)| text.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let message = elements
        .iter()
        .find(|(name, _)| name == "Message")
        .map(|(_, text)| text.clone())
        .unwrap_or_else(|| format!("HTTP status {}", status_code));

    match code.as_str() {
        // The reply does not name the queue; callers fill it in with `for_queue`
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            SqsError::QueueNotFound(message)
        }
        "InvalidClientTokenId"
        | "UnrecognizedClientException"
        | "SignatureDoesNotMatch"
        | "MissingAuthenticationToken"
        | "ExpiredToken" => SqsError::Authentication(format!("{}: {}", code, message)),
        _ if status_code == 401 || status_code == 403 => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ => SqsError::Service { code, message },
    }
}

/// Queue name is the last path segment of its URL
fn queue_name_from_url(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}

// ============================================================================
// Driver
// ============================================================================

/// Queue driver for AWS SQS
#[derive(Default)]
pub struct SqsDriver {
    client: Option<SqsClient>,
}

impl SqsDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&SqsClient, QueueError> {
        self.client
            .as_ref()
            .ok_or_else(|| not_connected(BackendType::AwsSqs))
    }
}

impl fmt::Debug for SqsDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsDriver")
            .field("endpoint", &self.client.as_ref().map(|c| c.endpoint.as_str()))
            .finish()
    }
}

#[async_trait]
impl QueueDriver for SqsDriver {
    async fn open_connection(&mut self, options: &DriverOptions) -> Result<(), QueueError> {
        let options = self.resolve_options(options)?;
        let client = SqsClient::new(&options)?;

        // One cheap signed call proves the endpoint is reachable and accepts the credentials
        let mut params = HashMap::new();
        params.insert("MaxResults".to_string(), "1".to_string());
        client
            .call("ListQueues", params)
            .await
            .map_err(|e| match e {
                SqsError::Service { code, message } => QueueError::ConnectionFailed {
                    message: format!("{}: {}", code, message),
                },
                other => other.into(),
            })?;

        info!(endpoint = %client.endpoint, "Connected to SQS");
        self.client = Some(client);
        Ok(())
    }

    async fn add_message_to_queue(
        &mut self,
        message: &str,
        queue: &QueueName,
    ) -> Result<(), QueueError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(QueueError::ProviderError {
                provider: BackendType::AwsSqs.to_string(),
                code: "MessageTooLarge".to_string(),
                message: format!(
                    "{} bytes exceeds the {} byte limit",
                    message.len(),
                    MAX_MESSAGE_SIZE
                ),
            });
        }

        let client = self.client()?;
        let mut params = HashMap::new();
        params.insert("QueueUrl".to_string(), client.queue_url(queue).await?);
        params.insert("MessageBody".to_string(), message.to_string());

        client
            .call("SendMessage", params)
            .await
            .map_err(|e| e.for_queue(queue))?;
        debug!(queue = %queue, "Sent message");
        Ok(())
    }

    async fn queues(&mut self) -> Result<Vec<String>, QueueError> {
        let urls = self.client()?.list_queue_urls().await?;
        Ok(urls
            .iter()
            .map(|url| queue_name_from_url(url).to_string())
            .collect())
    }

    async fn current_count(&mut self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.client()?.approximate_count(queue).await?)
    }

    async fn total_count(&mut self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.client()?.approximate_count(queue).await?)
    }

    async fn clear_queue(&mut self, queue: &QueueName) -> Result<(), QueueError> {
        let client = self.client()?;
        let queue_url = client.queue_url(queue).await?;

        let mut deleted = 0u64;
        loop {
            let mut params = HashMap::new();
            params.insert("QueueUrl".to_string(), queue_url.clone());
            params.insert(
                "MaxNumberOfMessages".to_string(),
                RECEIVE_BATCH_SIZE.to_string(),
            );
            params.insert("WaitTimeSeconds".to_string(), "0".to_string());

            let response = client
                .call("ReceiveMessage", params)
                .await
                .map_err(|e| e.for_queue(queue))?;
            let receipts = collect_elements(&response, &["ReceiptHandle"])?;
            if receipts.is_empty() {
                break;
            }

            for (_, receipt_handle) in receipts {
                let mut params = HashMap::new();
                params.insert("QueueUrl".to_string(), queue_url.clone());
                params.insert("ReceiptHandle".to_string(), receipt_handle);
                client
                    .call("DeleteMessage", params)
                    .await
                    .map_err(|e| e.for_queue(queue))?;
                deleted += 1;
            }
        }

        debug!(queue = %queue, deleted, "Drained SQS queue");
        Ok(())
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["region"]
    }

    fn default_config(&self) -> DriverOptions {
        DriverOptions::new()
            .with("version", DEFAULT_API_VERSION)
            .with("timeout", DEFAULT_TIMEOUT_SECS)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::AwsSqs
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn close_connection(&mut self) {
        self.client = None;
    }
}
