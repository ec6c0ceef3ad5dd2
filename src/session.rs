//! Per-query session: race one client query across every enabled proxy and
//! decide which answer, if any, goes back to the client.
//!
//! Poisoned answers are modelled as a single forged A record injected over
//! UDP, typically arriving faster than the genuine answer. Each candidate is
//! either forwarded at once or held back, and the most plausible held-back
//! answer is sent when the deadline expires.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dns::{self, Answers, TYPE_A};
use crate::proxy::{Calibration, Proxy, Transport};
use crate::subnet::SubnetTable;
use crate::task::{Task, TaskHandle, TaskReport};

/// Answers with a confidence above this are forwarded immediately.
pub const CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Verdict on a single candidate answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward,
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Done,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An answer was forwarded as soon as it was trusted.
    Forwarded,
    /// The best held-back answer was sent at the deadline.
    Fallback,
    /// Nothing usable arrived before the deadline.
    Dropped,
}

#[derive(Debug)]
struct Candidate {
    confidence: f64,
    response: Vec<u8>,
}

/// How likely an answer arriving after `elapsed_ms` is genuine.
///
/// 0.0 at the expected forged-answer latency, 1.0 at the expected genuine
/// latency. When the genuine latency is below the forged one the scale is
/// inverted and fast answers score high. Equal latencies score 0.0.
pub fn confidence(calibration: &Calibration, elapsed_ms: u64) -> f64 {
    let legit = calibration.expected_legit_ms as f64;
    let fake = calibration.expected_fake_ms as f64;
    if legit == fake {
        return 0.0;
    }

    (elapsed_ms as f64 - fake) / (legit - fake)
}

pub struct Session {
    client: SocketAddr,
    query: Vec<u8>,
    domain: String,
    subnets: Rc<SubnetTable>,
    state: SessionState,
    best: Option<Candidate>,
}

impl Session {
    pub fn new(client: SocketAddr, query: &[u8], subnets: Rc<SubnetTable>) -> Self {
        Self {
            client,
            query: query.to_vec(),
            domain: dns::query_domain(query),
            subnets,
            state: SessionState::Running,
            best: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Confidence of the held-back answer, 0.0 if there is none.
    pub fn best_confidence(&self) -> f64 {
        self.best.as_ref().map_or(0.0, |c| c.confidence)
    }

    /// Classify one candidate answer.
    ///
    /// Suppressed answers from external UDP proxies may replace the held-back
    /// candidate when they score higher than it.
    pub fn forward_action(&mut self, proxy: &Proxy, response: &[u8], elapsed_ms: u64) -> Action {
        // Forging a TCP answer needs a full handshake.
        if proxy.transport == Transport::Tcp {
            return Action::Forward;
        }

        let answers = match Answers::parse(response) {
            Ok(a) => a,
            Err(e) => {
                warn!(proxy = %proxy.addr, domain = %self.domain, "dropping answer: {}", e);
                return Action::Suppress;
            }
        };

        // Negative answers are never forged.
        if answers.announced() == 0 {
            return Action::Forward;
        }

        // Only the first readable record is judged.
        for record in answers {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(proxy = %proxy.addr, domain = %self.domain, "skipping answer record: {}", e);
                    continue;
                }
            };

            if record.rtype != TYPE_A {
                return Action::Forward;
            }
            let Some(ip) = record.ipv4() else {
                warn!(proxy = %proxy.addr, domain = %self.domain, "skipping A record with {} byte rdata", record.rdata.len());
                continue;
            };

            if self.subnets.contains_ip(ip) {
                return Action::Forward;
            }

            // Internal resolvers are only trusted for internal addresses.
            if proxy.is_internal() {
                debug!(proxy = %proxy.addr, domain = %self.domain, %ip, "external address from internal proxy");
                return Action::Suppress;
            }

            let confidence = confidence(&proxy.calibration, elapsed_ms);
            debug!(proxy = %proxy.addr, domain = %self.domain, %ip, elapsed_ms, confidence, "scored answer");
            if confidence > CONFIDENCE_THRESHOLD {
                return Action::Forward;
            }

            if confidence > self.best_confidence() {
                self.best = Some(Candidate {
                    confidence,
                    response: response.to_vec(),
                });
            }
            break;
        }

        Action::Suppress
    }

    /// Handle a task report; returns the response to send, if it is final.
    pub fn on_task_done(&mut self, proxy: &Proxy, report: TaskReport) -> Option<Vec<u8>> {
        match self.state {
            SessionState::Done => return None,
            SessionState::Running => {}
        }

        let response = report.payload?;
        match self.forward_action(proxy, &response, report.elapsed_ms) {
            Action::Forward => {
                self.finish();
                Some(response)
            }
            Action::Suppress => None,
        }
    }

    /// Handle deadline expiry; returns the held-back answer, if any.
    pub fn on_deadline(&mut self) -> Option<Vec<u8>> {
        match self.state {
            SessionState::Done => None,
            SessionState::Running => {
                self.finish();
                self.best.take().map(|c| c.response)
            }
        }
    }

    fn finish(&mut self) {
        self.state = match self.state {
            SessionState::Running => SessionState::Done,
            SessionState::Done => unreachable!("session finished twice"),
        };
    }

    /// Race the query across `proxies` and answer the client at most once.
    pub async fn run(
        mut self,
        socket: &UdpSocket,
        proxies: &[Rc<Proxy>],
        timeout: Duration,
    ) -> Outcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tasks: Vec<TaskHandle> = proxies
            .iter()
            .enumerate()
            .map(|(id, proxy)| Task::new(id, proxy.clone(), &self.query, tx.clone()).spawn())
            .collect();
        drop(tx);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let (response, outcome) = loop {
            tokio::select! {
                Some(report) = rx.recv() => {
                    let proxy = &proxies[report.task];
                    if let Some(response) = self.on_task_done(proxy, report) {
                        debug!(domain = %self.domain, proxy = %proxy.addr, "forwarding answer");
                        break (Some(response), Outcome::Forwarded);
                    }
                }
                _ = &mut deadline => {
                    match self.on_deadline() {
                        Some(response) => {
                            debug!(domain = %self.domain, "deadline reached, sending best answer");
                            break (Some(response), Outcome::Fallback);
                        }
                        None => {
                            debug!(domain = %self.domain, "deadline reached without a usable answer");
                            break (None, Outcome::Dropped);
                        }
                    }
                }
            }
        };

        if let Some(response) = response {
            write_response(socket, self.client, &response).await;
        }

        join_all(tasks.into_iter().map(TaskHandle::close)).await;

        outcome
    }
}

/// Send the final answer to the client. Failures are not retried.
async fn write_response(socket: &UdpSocket, client: SocketAddr, response: &[u8]) {
    if let Err(e) = socket.send_to(response, client).await {
        warn!(%client, "failed to send response: {}", e);
    }
}
