//! One request/response exchange against one upstream proxy.
//!
//! A task runs on the local executor and reports every outcome through an
//! unbounded channel. The owner closes it with [`TaskHandle::close`], which
//! stops the I/O first and only returns once the task's socket and message
//! buffer have been released.

use std::io;
use std::rc::Rc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::proxy::{Proxy, Transport};
use crate::transport::{tcp, udp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Running,
    /// First response observed.
    Done,
    /// Transport failure; terminal.
    Error,
    /// A further response arrived after `Done`.
    MultiResult,
}

impl TaskState {
    fn start(self) -> Self {
        match self {
            TaskState::Init => TaskState::Running,
            TaskState::Running | TaskState::Done | TaskState::Error | TaskState::MultiResult => {
                unreachable!("task started twice (state {:?})", self)
            }
        }
    }

    fn respond(self) -> Self {
        match self {
            TaskState::Running => TaskState::Done,
            TaskState::Done | TaskState::MultiResult => TaskState::MultiResult,
            TaskState::Init | TaskState::Error => {
                unreachable!("response delivered in state {:?}", self)
            }
        }
    }

    fn fail(self) -> Self {
        match self {
            TaskState::Running => TaskState::Error,
            TaskState::Init | TaskState::Done | TaskState::Error | TaskState::MultiResult => {
                unreachable!("failure reported in state {:?}", self)
            }
        }
    }
}

/// Outcome of a task, delivered to its owner.
#[derive(Debug)]
pub struct TaskReport {
    pub task: usize,
    pub state: TaskState,
    /// Response message, `None` on transport failure.
    pub payload: Option<Vec<u8>>,
    pub elapsed_ms: u64,
}

pub struct Task {
    id: usize,
    proxy: Rc<Proxy>,
    message: Vec<u8>,
    state: TaskState,
    sent_at: Option<Instant>,
    reports: UnboundedSender<TaskReport>,
}

impl Task {
    /// Prepare an exchange of `query` with `proxy`.
    ///
    /// The query is copied; TCP tasks carry it behind a 2-byte length prefix.
    pub fn new(
        id: usize,
        proxy: Rc<Proxy>,
        query: &[u8],
        reports: UnboundedSender<TaskReport>,
    ) -> Self {
        let message = match proxy.transport {
            Transport::Udp => query.to_vec(),
            Transport::Tcp => tcp::frame(query),
        };

        Self {
            id,
            proxy,
            message,
            state: TaskState::Init,
            sent_at: None,
            reports,
        }
    }

    /// Start the exchange on the local executor.
    pub fn spawn(self) -> TaskHandle {
        TaskHandle {
            join: tokio::task::spawn_local(self.run()),
        }
    }

    async fn run(mut self) {
        self.state = self.state.start();

        match self.proxy.transport {
            Transport::Udp => udp::exchange(&mut self).await,
            Transport::Tcp => tcp::exchange(&mut self).await,
        }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Bytes put on the wire, including any framing.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Start the response clock once the send or connect has completed.
    pub(crate) fn mark_sent(&mut self) {
        self.sent_at = Some(Instant::now());
    }

    /// Whole milliseconds since [`Task::mark_sent`].
    pub fn elapsed_ms(&self) -> u64 {
        self.sent_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    pub(crate) fn deliver(&mut self, payload: Vec<u8>) {
        self.state = self.state.respond();
        self.report(Some(payload));
    }

    pub(crate) fn fail(&mut self, source: io::Error) {
        let err = Error::Transport {
            proxy: self.proxy.addr,
            source,
        };
        warn!(task = self.id, "{err}");

        self.state = self.state.fail();
        self.report(None);
    }

    fn report(&self, payload: Option<Vec<u8>>) {
        let report = TaskReport {
            task: self.id,
            state: self.state,
            payload,
            elapsed_ms: self.elapsed_ms(),
        };
        if self.reports.send(report).is_err() {
            debug!(task = self.id, proxy = %self.proxy.addr, "owner gone, report dropped");
        }
    }
}

/// Owner's side of a running task.
pub struct TaskHandle {
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Stop the exchange and wait until its resources are released.
    ///
    /// No report is sent once this returns; reports already queued in the
    /// channel are the owner's to discard.
    pub async fn close(self) {
        self.join.abort();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Trust;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::sync::mpsc;
    use tokio::task::LocalSet;

    fn proxy(addr: SocketAddr, transport: Transport) -> Rc<Proxy> {
        Rc::new(Proxy::new(addr, transport, Trust::External))
    }

    #[test]
    fn state_transitions() {
        let running = TaskState::Init.start();

        assert_eq!(running, TaskState::Running);
        assert_eq!(running.respond(), TaskState::Done);
        assert_eq!(TaskState::Done.respond(), TaskState::MultiResult);
        assert_eq!(TaskState::MultiResult.respond(), TaskState::MultiResult);
        assert_eq!(running.fail(), TaskState::Error);
    }

    #[test]
    #[should_panic]
    fn response_after_error_is_rejected() {
        TaskState::Error.respond();
    }

    #[test]
    #[should_panic]
    fn restart_is_rejected() {
        TaskState::Running.start();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tcp_frames_query_and_strips_response_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let query = b"\x12\x34query-bytes".to_vec();

        let upstream = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = vec![0u8; 2 + 13];
            stream.read_exact(&mut received).await.unwrap();
            stream.write_all(b"\x00\x05reply").await.unwrap();
            received
        });

        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let handle = Task::new(0, proxy(addr, Transport::Tcp), &query, tx).spawn();

                let report = rx.recv().await.unwrap();

                assert_eq!(report.state, TaskState::Done);
                assert_eq!(report.payload.as_deref(), Some(&b"reply"[..]));
                handle.close().await;
            })
            .await;

        let received = upstream.await.unwrap();
        assert_eq!(&received[..2], &[0x00, 13]);
        assert_eq!(&received[2..], &query[..]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn udp_duplicate_answers_are_multi_result() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, src) = upstream.recv_from(&mut buf).await.unwrap();
            upstream.send_to(&buf[..len], src).await.unwrap();
            upstream.send_to(&buf[..len], src).await.unwrap();
        });

        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let handle = Task::new(3, proxy(addr, Transport::Udp), b"ping", tx).spawn();

                let first = rx.recv().await.unwrap();
                let second = rx.recv().await.unwrap();

                assert_eq!(first.task, 3);
                assert_eq!(first.state, TaskState::Done);
                assert_eq!(first.payload.as_deref(), Some(&b"ping"[..]));
                assert_eq!(second.state, TaskState::MultiResult);
                handle.close().await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tcp_connect_failure_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let handle = Task::new(0, proxy(addr, Transport::Tcp), b"q", tx).spawn();

                let report = rx.recv().await.unwrap();

                assert_eq!(report.state, TaskState::Error);
                assert!(report.payload.is_none());
                handle.close().await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn udp_receive_error_reports_error_without_payload() {
        let closed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let handle = Task::new(1, proxy(addr, Transport::Udp), b"q", tx).spawn();

                let report = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();

                assert_eq!(report.task, 1);
                assert_eq!(report.state, TaskState::Error);
                assert!(report.payload.is_none());
                handle.close().await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn udp_oversized_answer_is_dropped() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, src) = upstream.recv_from(&mut buf).await.unwrap();
            upstream.send_to(&[0xAB; 5000], src).await.unwrap();
            upstream.send_to(b"short", src).await.unwrap();
        });

        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let handle = Task::new(0, proxy(addr, Transport::Udp), b"q", tx).spawn();

                let report = rx.recv().await.unwrap();

                assert_eq!(report.state, TaskState::Done);
                assert_eq!(report.payload.as_deref(), Some(&b"short"[..]));
                handle.close().await;
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_stops_further_reports() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();

        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let handle = Task::new(0, proxy(addr, Transport::Udp), b"q", tx).spawn();

                let mut buf = [0u8; 16];
                let (_, src) = upstream.recv_from(&mut buf).await.unwrap();
                handle.close().await;
                upstream.send_to(b"late", src).await.unwrap();

                let late = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
                assert!(matches!(late, Ok(None)));
            })
            .await;
    }
}
