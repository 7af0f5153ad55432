//! Common test utilities for queue-check integration tests
//!
//! This module provides:
//! - An in-process beanstalkd speaking enough of the text protocol for the
//!   driver and for seeding jobs in every sub-state
//! - Tracing setup for test output

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

use queue_check::{BackendType, QueueSettings};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

// ============================================================================
// Tracing
// ============================================================================

/// Install a test-writer subscriber honouring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("queue_check=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Fake beanstalkd
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeJobState {
    Ready,
    /// Delayed jobs never mature; tests only need them to be visible to peek
    Delayed,
    Buried,
    Reserved { connection: u64 },
}

#[derive(Debug, Clone)]
struct FakeJob {
    tube: String,
    body: Vec<u8>,
    state: FakeJobState,
}

#[derive(Debug, Default)]
struct ServerState {
    next_job_id: u64,
    next_connection_id: u64,
    jobs: BTreeMap<u64, FakeJob>,
    /// Tube name to lifetime `total-jobs`
    tubes: BTreeMap<String, u64>,
}

impl ServerState {
    fn new() -> Self {
        let mut state = Self::default();
        state.tubes.insert("default".to_string(), 0);
        state
    }

    fn touch_tube(&mut self, tube: &str) {
        self.tubes.entry(tube.to_string()).or_insert(0);
    }

    fn count(&self, tube: &str, wanted: fn(&FakeJobState) -> bool) -> usize {
        self.jobs
            .values()
            .filter(|job| job.tube == tube && wanted(&job.state))
            .count()
    }

    fn first_in(&self, tube: &str, state: FakeJobState) -> Option<(u64, Vec<u8>)> {
        self.jobs
            .iter()
            .find(|(_, job)| job.tube == tube && job.state == state)
            .map(|(id, job)| (*id, job.body.clone()))
    }
}

/// A beanstalkd stand-in listening on an ephemeral localhost port
pub struct FakeBeanstalkd {
    port: u16,
    state: Arc<Mutex<ServerState>>,
    accept_loop: JoinHandle<()>,
}

impl FakeBeanstalkd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake beanstalkd");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(ServerState::new()));

        let shared = Arc::clone(&state);
        let accept_loop = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(serve_connection(socket, state));
            }
        });

        Self {
            port,
            state,
            accept_loop,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn settings(&self) -> QueueSettings {
        QueueSettings::new(BackendType::Beanstalk)
            .with_option("host", "127.0.0.1")
            .with_option("port", self.port as u64)
            .with_option("timeout", 5u64)
    }

    /// Number of jobs in `tube` currently in `state`
    pub fn jobs_in(&self, tube: &str, state: FakeJobState) -> usize {
        let server = self.state.lock().expect("fake beanstalkd state");
        server
            .jobs
            .values()
            .filter(|job| job.tube == tube && job.state == state)
            .count()
    }

    /// Number of jobs in `tube` in any state
    pub fn jobs_total(&self, tube: &str) -> usize {
        let server = self.state.lock().expect("fake beanstalkd state");
        server.jobs.values().filter(|job| job.tube == tube).count()
    }
}

impl Drop for FakeBeanstalkd {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

struct Session {
    id: u64,
    using: String,
    watching: BTreeSet<String>,
}

async fn serve_connection(socket: TcpStream, state: Arc<Mutex<ServerState>>) {
    let id = {
        let mut server = state.lock().expect("fake beanstalkd state");
        server.next_connection_id += 1;
        server.next_connection_id
    };
    let mut session = Session {
        id,
        using: "default".to_string(),
        watching: BTreeSet::from(["default".to_string()]),
    };

    let mut stream = BufReader::new(socket);
    loop {
        let mut line = String::new();
        match stream.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let parts: Vec<&str> = line.split_whitespace().collect();

        // put is the only command followed by a body
        let body = match parts.as_slice() {
            ["put", _, _, _, bytes] => {
                let Ok(length) = bytes.parse::<usize>() else {
                    if reply(&mut stream, b"BAD_FORMAT\r\n").await.is_err() {
                        break;
                    }
                    continue;
                };
                let mut data = vec![0u8; length + 2];
                if stream.read_exact(&mut data).await.is_err() {
                    break;
                }
                data.truncate(length);
                Some(data)
            }
            _ => None,
        };

        let response = {
            let mut server = state.lock().expect("fake beanstalkd state");
            handle_command(&mut server, &mut session, &parts, body)
        };
        if reply(&mut stream, &response).await.is_err() {
            break;
        }
    }

    // A closed connection releases its reservations
    let mut server = state.lock().expect("fake beanstalkd state");
    for job in server.jobs.values_mut() {
        if job.state == (FakeJobState::Reserved { connection: id }) {
            job.state = FakeJobState::Ready;
        }
    }
}

async fn reply(stream: &mut BufReader<TcpStream>, response: &[u8]) -> std::io::Result<()> {
    let socket = stream.get_mut();
    socket.write_all(response).await?;
    socket.flush().await
}

fn handle_command(
    server: &mut ServerState,
    session: &mut Session,
    parts: &[&str],
    body: Option<Vec<u8>>,
) -> Vec<u8> {
    match (parts, body) {
        (["use", tube], _) => {
            server.touch_tube(tube);
            session.using = tube.to_string();
            format!("USING {}\r\n", tube).into_bytes()
        }
        (["put", _priority, delay, _ttr, _bytes], Some(body)) => {
            server.next_job_id += 1;
            let id = server.next_job_id;
            let state = if *delay == "0" {
                FakeJobState::Ready
            } else {
                FakeJobState::Delayed
            };
            server.jobs.insert(
                id,
                FakeJob {
                    tube: session.using.clone(),
                    body,
                    state,
                },
            );
            *server.tubes.entry(session.using.clone()).or_insert(0) += 1;
            format!("INSERTED {}\r\n", id).into_bytes()
        }
        (["watch", tube], _) => {
            server.touch_tube(tube);
            session.watching.insert(tube.to_string());
            format!("WATCHING {}\r\n", session.watching.len()).into_bytes()
        }
        (["ignore", tube], _) => {
            if session.watching.len() == 1 && session.watching.contains(*tube) {
                return b"NOT_IGNORED\r\n".to_vec();
            }
            session.watching.remove(*tube);
            format!("WATCHING {}\r\n", session.watching.len()).into_bytes()
        }
        (["reserve-with-timeout", _seconds], _) => {
            let reservable = server
                .jobs
                .iter_mut()
                .find(|(_, job)| {
                    job.state == FakeJobState::Ready && session.watching.contains(&job.tube)
                });
            match reservable {
                Some((id, job)) => {
                    job.state = FakeJobState::Reserved {
                        connection: session.id,
                    };
                    job_frame("RESERVED", *id, &job.body)
                }
                None => b"TIMED_OUT\r\n".to_vec(),
            }
        }
        (["delete", id], _) => {
            let Ok(id) = id.parse::<u64>() else {
                return b"BAD_FORMAT\r\n".to_vec();
            };
            let deletable = server.jobs.get(&id).is_some_and(|job| match job.state {
                FakeJobState::Reserved { connection } => connection == session.id,
                _ => true,
            });
            if deletable {
                server.jobs.remove(&id);
                b"DELETED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        (["bury", id, _priority], _) => {
            let Ok(id) = id.parse::<u64>() else {
                return b"BAD_FORMAT\r\n".to_vec();
            };
            match server.jobs.get_mut(&id) {
                Some(job) if job.state == (FakeJobState::Reserved { connection: session.id }) => {
                    job.state = FakeJobState::Buried;
                    b"BURIED\r\n".to_vec()
                }
                _ => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        ([peek], _) if peek.starts_with("peek-") => {
            let state = match *peek {
                "peek-ready" => FakeJobState::Ready,
                "peek-delayed" => FakeJobState::Delayed,
                "peek-buried" => FakeJobState::Buried,
                _ => return b"UNKNOWN_COMMAND\r\n".to_vec(),
            };
            match server.first_in(&session.using, state) {
                Some((id, body)) => job_frame("FOUND", id, &body),
                None => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        (["list-tubes"], _) => {
            let mut yaml = String::from("---\n");
            for tube in server.tubes.keys() {
                yaml.push_str(&format!("- {}\n", tube));
            }
            ok_frame(&yaml)
        }
        (["stats-tube", tube], _) => {
            let Some(total_jobs) = server.tubes.get(*tube).copied() else {
                return b"NOT_FOUND\r\n".to_vec();
            };
            let ready = server.count(tube, |s| *s == FakeJobState::Ready);
            let delayed = server.count(tube, |s| *s == FakeJobState::Delayed);
            let buried = server.count(tube, |s| *s == FakeJobState::Buried);
            let reserved = server.count(tube, |s| matches!(s, FakeJobState::Reserved { .. }));
            let yaml = format!(
                "---\nname: {}\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: {}\n\
                 current-jobs-reserved: {}\ncurrent-jobs-delayed: {}\n\
                 current-jobs-buried: {}\ntotal-jobs: {}\ncurrent-using: 1\n\
                 current-watching: 1\ncurrent-waiting: 0\ncmd-delete: 0\n\
                 cmd-pause-tube: 0\npause: 0\npause-time-left: 0\n",
                tube, ready, reserved, delayed, buried, total_jobs
            );
            ok_frame(&yaml)
        }
        _ => b"UNKNOWN_COMMAND\r\n".to_vec(),
    }
}

fn job_frame(status: &str, id: u64, body: &[u8]) -> Vec<u8> {
    let mut frame = format!("{} {} {}\r\n", status, id, body.len()).into_bytes();
    frame.extend_from_slice(body);
    frame.extend_from_slice(b"\r\n");
    frame
}

fn ok_frame(yaml: &str) -> Vec<u8> {
    format!("OK {}\r\n{}\r\n", yaml.len(), yaml).into_bytes()
}
