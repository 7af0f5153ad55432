//! Beanstalkd driver speaking the text protocol over TCP.
//!
//! Queues are beanstalk *tubes*, addressed by name. Writes go through an
//! explicit `use <tube>` before `put`, which the driver issues on every
//! enqueue. Tubes appear on first `put` and vanish once empty and unwatched,
//! so a `NOT_FOUND` from `stats-tube` is reported as a count of zero.
//!
//! Jobs can sit in three states the driver has to drain: ready, delayed and
//! buried. Clearing a tube peeks and deletes each state in turn until the
//! peek comes back empty. Reserved jobs belong to their consumer and are
//! left alone.
//!
//! ## Wire format
//!
//! Commands are single `\r\n`-terminated lines. Replies are a status line,
//! optionally followed by a `<bytes>`-long body and a trailing `\r\n`
//! (`RESERVED`, `FOUND` and `OK`). `OK` bodies are YAML documents.

use crate::config::DriverOptions;
use crate::driver::{not_connected, QueueDriver};
use crate::error::QueueError;
use crate::message::QueueName;
use crate::provider::BackendType;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "beanstalk_tests.rs"]
mod tests;

/// Priority given to enqueued jobs (beanstalkd's conventional default)
pub const DEFAULT_PRIORITY: u32 = 1024;

/// Seconds a consumer may hold a reserved job before it is released
pub const DEFAULT_TTR: u32 = 60;

const DEFAULT_PORT: u64 = 11300;
const DEFAULT_TIMEOUT_SECS: u64 = 90;

// ============================================================================
// Protocol Types
// ============================================================================

/// A job returned by `reserve` or one of the `peek` commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub body: Bytes,
}

/// Job sub-states that can be inspected with `peek-*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Delayed,
    Buried,
}

impl JobState {
    /// Order in which a drain visits the states
    pub const DRAIN_ORDER: [JobState; 3] = [JobState::Buried, JobState::Delayed, JobState::Ready];

    fn peek_command(&self) -> &'static str {
        match self {
            Self::Ready => "peek-ready",
            Self::Delayed => "peek-delayed",
            Self::Buried => "peek-buried",
        }
    }
}

/// Subset of the `stats-tube` reply the driver reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TubeStats {
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    pub total_jobs: u64,
}

// ============================================================================
// Connection
// ============================================================================

/// One client session with a beanstalkd server
pub struct BeanstalkConnection {
    stream: BufReader<TcpStream>,
}

impl BeanstalkConnection {
    /// Connect, giving up after `timeout`
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, QueueError> {
        let address = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| QueueError::ConnectionFailed {
                message: format!("Timed out after {:?} connecting to {}", timeout, address),
            })?
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to connect to {}: {}", address, e),
            })?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Select the tube that later `put` and `peek-*` commands act on
    pub async fn use_tube(&mut self, tube: &str) -> Result<(), QueueError> {
        let command = format!("use {}", tube);
        let reply = self.command(&command, None).await?;
        match reply.status() {
            "USING" => Ok(()),
            _ => Err(reply.unexpected(&command)),
        }
    }

    /// Add a tube to the watch list used by `reserve`
    pub async fn watch(&mut self, tube: &str) -> Result<u64, QueueError> {
        let command = format!("watch {}", tube);
        let reply = self.command(&command, None).await?;
        match reply.status() {
            "WATCHING" => reply.number(1, &command),
            _ => Err(reply.unexpected(&command)),
        }
    }

    /// Remove a tube from the watch list
    pub async fn ignore(&mut self, tube: &str) -> Result<u64, QueueError> {
        let command = format!("ignore {}", tube);
        let reply = self.command(&command, None).await?;
        match reply.status() {
            "WATCHING" => reply.number(1, &command),
            _ => Err(reply.unexpected(&command)),
        }
    }

    /// Put a job into the used tube, returning its id
    pub async fn put(
        &mut self,
        body: &[u8],
        priority: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<u64, QueueError> {
        let command = format!("put {} {} {} {}", priority, delay, ttr, body.len());
        let reply = self.command(&command, Some(body)).await?;
        match reply.status() {
            "INSERTED" => reply.number(1, &command),
            "BURIED" => Err(QueueError::ProviderError {
                provider: BackendType::Beanstalk.to_string(),
                code: "BURIED".to_string(),
                message: "server out of memory, job was buried on insert".to_string(),
            }),
            _ => Err(reply.unexpected(&command)),
        }
    }

    /// Reserve a job from the watched tubes, `None` if nothing arrives in time
    pub async fn reserve_with_timeout(&mut self, seconds: u32) -> Result<Option<Job>, QueueError> {
        let command = format!("reserve-with-timeout {}", seconds);
        let reply = self.command(&command, None).await?;
        match reply.status() {
            "RESERVED" => self.read_job(&reply, &command).await.map(Some),
            "TIMED_OUT" | "DEADLINE_SOON" => Ok(None),
            _ => Err(reply.unexpected(&command)),
        }
    }

    /// Delete a job; `false` when the server no longer has it
    pub async fn delete(&mut self, id: u64) -> Result<bool, QueueError> {
        let command = format!("delete {}", id);
        let reply = self.command(&command, None).await?;
        match reply.status() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            _ => Err(reply.unexpected(&command)),
        }
    }

    /// Bury a job this connection has reserved
    pub async fn bury(&mut self, id: u64, priority: u32) -> Result<bool, QueueError> {
        let command = format!("bury {} {}", id, priority);
        let reply = self.command(&command, None).await?;
        match reply.status() {
            "BURIED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            _ => Err(reply.unexpected(&command)),
        }
    }

    /// Look at the next job in the used tube without reserving it
    pub async fn peek(&mut self, state: JobState) -> Result<Option<Job>, QueueError> {
        let command = state.peek_command();
        let reply = self.command(command, None).await?;
        match reply.status() {
            "FOUND" => self.read_job(&reply, command).await.map(Some),
            "NOT_FOUND" => Ok(None),
            _ => Err(reply.unexpected(command)),
        }
    }

    pub async fn list_tubes(&mut self) -> Result<Vec<String>, QueueError> {
        let command = "list-tubes";
        let body = self.yaml_command(command).await?;
        // Deserializing straight to strings keeps names like "007" or "null" verbatim
        parse_yaml(&body, command)
    }

    /// Tube statistics, `None` if the tube does not exist
    pub async fn stats_tube(&mut self, tube: &str) -> Result<Option<TubeStats>, QueueError> {
        let command = format!("stats-tube {}", tube);
        let reply = self.command(&command, None).await?;
        match reply.status() {
            "OK" => {
                let body = self.read_body(&reply, &command).await?;
                parse_yaml(&body, &command).map(Some)
            }
            "NOT_FOUND" => Ok(None),
            _ => Err(reply.unexpected(&command)),
        }
    }

    async fn yaml_command(&mut self, command: &str) -> Result<Bytes, QueueError> {
        let reply = self.command(command, None).await?;
        match reply.status() {
            "OK" => self.read_body(&reply, command).await,
            _ => Err(reply.unexpected(command)),
        }
    }

    /// Send a command line (plus optional body) and read the status line
    async fn command(&mut self, line: &str, body: Option<&[u8]>) -> Result<Reply, QueueError> {
        let mut frame = Vec::with_capacity(line.len() + 2 + body.map_or(0, |b| b.len() + 2));
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(b"\r\n");
        if let Some(body) = body {
            frame.extend_from_slice(body);
            frame.extend_from_slice(b"\r\n");
        }

        let stream = self.stream.get_mut();
        stream.write_all(&frame).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)?;

        let mut raw = Vec::new();
        let read = self
            .stream
            .read_until(b'\n', &mut raw)
            .await
            .map_err(io_error)?;
        if read == 0 {
            return Err(QueueError::ConnectionFailed {
                message: "connection closed by beanstalkd".to_string(),
            });
        }

        let text = String::from_utf8_lossy(&raw);
        let reply = Reply {
            parts: text.split_whitespace().map(str::to_string).collect(),
        };

        if let Some(error) = reply.server_error() {
            return Err(QueueError::Protocol {
                message: format!("'{}' failed: {}", line, error),
            });
        }

        Ok(reply)
    }

    async fn read_job(&mut self, reply: &Reply, command: &str) -> Result<Job, QueueError> {
        let id = reply.number(1, command)?;
        let body = self.read_data(reply.number(2, command)?, command).await?;
        Ok(Job { id, body })
    }

    async fn read_body(&mut self, reply: &Reply, command: &str) -> Result<Bytes, QueueError> {
        let length = reply.number(1, command)?;
        self.read_data(length, command).await
    }

    async fn read_data(&mut self, length: u64, command: &str) -> Result<Bytes, QueueError> {
        let length = usize::try_from(length).map_err(|_| QueueError::Protocol {
            message: format!("'{}' announced an oversized body ({} bytes)", command, length),
        })?;

        let mut data = vec![0u8; length + 2];
        self.stream
            .read_exact(&mut data)
            .await
            .map_err(io_error)?;

        if !data.ends_with(b"\r\n") {
            return Err(QueueError::Protocol {
                message: format!("'{}' body was not terminated by CRLF", command),
            });
        }
        data.truncate(length);

        Ok(Bytes::from(data))
    }
}

impl std::fmt::Debug for BeanstalkConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeanstalkConnection")
            .field("peer", &self.stream.get_ref().peer_addr().ok())
            .finish()
    }
}

/// A parsed status line
#[derive(Debug)]
struct Reply {
    parts: Vec<String>,
}

impl Reply {
    fn status(&self) -> &str {
        self.parts.first().map(String::as_str).unwrap_or("")
    }

    fn server_error(&self) -> Option<&str> {
        match self.status() {
            status @ ("OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND"
            | "EXPECTED_CRLF" | "JOB_TOO_BIG" | "DRAINING") => Some(status),
            _ => None,
        }
    }

    fn number(&self, index: usize, command: &str) -> Result<u64, QueueError> {
        self.parts
            .get(index)
            .and_then(|part| part.parse().ok())
            .ok_or_else(|| QueueError::Protocol {
                message: format!(
                    "'{}' reply '{}' is missing a numeric field",
                    command,
                    self.parts.join(" ")
                ),
            })
    }

    fn unexpected(&self, command: &str) -> QueueError {
        QueueError::Protocol {
            message: format!(
                "unexpected reply to '{}': '{}'",
                command,
                self.parts.join(" ")
            ),
        }
    }
}

fn io_error(err: std::io::Error) -> QueueError {
    QueueError::ConnectionFailed {
        message: format!("beanstalkd I/O failed: {}", err),
    }
}

fn parse_yaml<T: serde::de::DeserializeOwned>(body: &[u8], command: &str) -> Result<T, QueueError> {
    serde_yaml::from_slice(body).map_err(|e| QueueError::Protocol {
        message: format!("'{}' returned invalid YAML: {}", command, e),
    })
}

// ============================================================================
// Driver
// ============================================================================

/// Queue driver for beanstalkd
#[derive(Debug, Default)]
pub struct BeanstalkDriver {
    connection: Option<BeanstalkConnection>,
}

impl BeanstalkDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection(&mut self) -> Result<&mut BeanstalkConnection, QueueError> {
        self.connection
            .as_mut()
            .ok_or_else(|| not_connected(BackendType::Beanstalk))
    }

    async fn tube_stats(&mut self, queue: &QueueName) -> Result<TubeStats, QueueError> {
        match self.connection()?.stats_tube(queue.as_str()).await? {
            Some(stats) => Ok(stats),
            None => {
                warn!(queue = %queue, "Tube does not exist, reporting empty statistics");
                Ok(TubeStats::default())
            }
        }
    }
}

#[async_trait]
impl QueueDriver for BeanstalkDriver {
    async fn open_connection(&mut self, options: &DriverOptions) -> Result<(), QueueError> {
        let options = self.resolve_options(options)?;
        let host = options.require_string("host")?;
        let port = options.require_u64("port")?;
        let port = u16::try_from(port).map_err(|_| {
            crate::error::ConfigurationError::Invalid {
                key: "port".to_string(),
                message: format!("{} is not a valid TCP port", port),
            }
        })?;
        let timeout = Duration::from_secs(options.require_u64("timeout")?);

        let connection = BeanstalkConnection::connect(&host, port, timeout).await?;
        info!(host = %host, port, "Connected to beanstalkd");
        self.connection = Some(connection);
        Ok(())
    }

    async fn add_message_to_queue(
        &mut self,
        message: &str,
        queue: &QueueName,
    ) -> Result<(), QueueError> {
        let connection = self.connection()?;
        connection.use_tube(queue.as_str()).await?;
        let id = connection
            .put(message.as_bytes(), DEFAULT_PRIORITY, 0, DEFAULT_TTR)
            .await?;
        debug!(queue = %queue, job_id = id, "Put job");
        Ok(())
    }

    async fn queues(&mut self) -> Result<Vec<String>, QueueError> {
        self.connection()?.list_tubes().await
    }

    async fn current_count(&mut self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.tube_stats(queue).await?.current_jobs_ready)
    }

    async fn total_count(&mut self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.tube_stats(queue).await?.total_jobs)
    }

    async fn clear_queue(&mut self, queue: &QueueName) -> Result<(), QueueError> {
        let connection = self.connection()?;
        connection.use_tube(queue.as_str()).await?;

        let mut deleted = 0u64;
        for state in JobState::DRAIN_ORDER {
            let mut missed: Option<u64> = None;
            while let Some(job) = connection.peek(state).await? {
                if connection.delete(job.id).await? {
                    deleted += 1;
                    missed = None;
                } else if missed == Some(job.id) {
                    // The server keeps offering a job it refuses to delete
                    return Err(QueueError::Protocol {
                        message: format!(
                            "job {} in tube '{}' is visible to {:?} but cannot be deleted",
                            job.id, queue, state
                        ),
                    });
                } else {
                    missed = Some(job.id);
                }
            }
        }

        debug!(queue = %queue, deleted, "Drained tube");
        Ok(())
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["host"]
    }

    fn default_config(&self) -> DriverOptions {
        DriverOptions::new()
            .with("port", DEFAULT_PORT)
            .with("timeout", DEFAULT_TIMEOUT_SECS)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Beanstalk
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn close_connection(&mut self) {
        self.connection = None;
    }
}
