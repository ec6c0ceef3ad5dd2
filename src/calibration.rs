//! Startup calibration of upstream proxies.
//!
//! Every proxy is probed with known-blocked and known-unblocked domains for
//! one fixed window. Answers to blocked domains on a poisoned path are the
//! forged ones, so their average latency becomes the proxy's expected fake
//! latency; unblocked domains give the expected genuine latency. Proxies that
//! answer too few probes are disabled.
//!
//! Calibration produces a fresh set of proxies; sessions only ever see the
//! finished snapshot.

use std::rc::Rc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dns::DnsQuery;
use crate::proxy::{Calibration, Proxy};
use crate::task::{Task, TaskHandle, TaskState};

/// Share of probes a proxy must answer to stay enabled.
pub const MIN_ANSWERED_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Blocked,
    NonBlocked,
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    proxy: usize,
    kind: ProbeKind,
}

/// Answered probe counts and latency totals for one proxy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTally {
    pub blocked_count: u64,
    pub blocked_total_ms: u64,
    pub non_blocked_count: u64,
    pub non_blocked_total_ms: u64,
}

impl ProbeTally {
    pub fn record(&mut self, kind: ProbeKind, elapsed_ms: u64) {
        match kind {
            ProbeKind::Blocked => {
                self.blocked_count += 1;
                self.blocked_total_ms += elapsed_ms;
            }
            ProbeKind::NonBlocked => {
                self.non_blocked_count += 1;
                self.non_blocked_total_ms += elapsed_ms;
            }
        }
    }

    pub fn answered(&self) -> u64 {
        self.blocked_count + self.non_blocked_count
    }

    /// Calibration for a proxy probed with `domains` domains in total.
    pub fn calibration(&self, domains: usize) -> Calibration {
        if (self.answered() as f64) < MIN_ANSWERED_RATIO * domains as f64 {
            return Calibration::disabled();
        }
        if self.blocked_count == 0 || self.non_blocked_count == 0 {
            return Calibration::disabled();
        }

        Calibration {
            enabled: true,
            expected_legit_ms: self.non_blocked_total_ms / self.non_blocked_count,
            expected_fake_ms: self.blocked_total_ms / self.blocked_count,
        }
    }
}

/// Probe set and window for a calibration run.
pub struct Calibrator<'a> {
    pub blocked: &'a [String],
    pub non_blocked: &'a [String],
    pub window: Duration,
}

impl Calibrator<'_> {
    /// Probe every proxy and return them with fresh calibration.
    ///
    /// Probes still outstanding when the window closes are abandoned without
    /// penalty beyond not being counted.
    pub async fn run(&self, proxies: &[Proxy]) -> Vec<Proxy> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut probes = Vec::new();
        let mut tasks: Vec<TaskHandle> = Vec::new();

        for (index, proxy) in proxies.iter().enumerate() {
            let proxy = Rc::new(proxy.clone());
            let domains = self
                .blocked
                .iter()
                .map(|d| (d, ProbeKind::Blocked))
                .chain(self.non_blocked.iter().map(|d| (d, ProbeKind::NonBlocked)));

            for (domain, kind) in domains {
                let query = DnsQuery::a(domain, rand::random()).to_bytes();
                let id = probes.len();
                probes.push(Probe { proxy: index, kind });
                tasks.push(Task::new(id, proxy.clone(), &query, tx.clone()).spawn());
            }
        }
        drop(tx);

        info!(
            "calibrating {} proxies with {} probes over {}ms",
            proxies.len(),
            probes.len(),
            self.window.as_millis()
        );

        let mut tallies = vec![ProbeTally::default(); proxies.len()];
        let deadline = tokio::time::sleep(self.window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                Some(report) = rx.recv() => {
                    if report.state != TaskState::Done {
                        continue;
                    }
                    let probe = probes[report.task];
                    tallies[probe.proxy].record(probe.kind, report.elapsed_ms);
                }
                _ = &mut deadline => break,
            }
        }

        join_all(tasks.into_iter().map(TaskHandle::close)).await;

        let domains = self.blocked.len() + self.non_blocked.len();
        let calibrated: Vec<Proxy> = proxies
            .iter()
            .zip(&tallies)
            .map(|(proxy, tally)| {
                let calibration = tally.calibration(domains);
                if calibration.enabled {
                    info!(
                        "proxy {} answered {}/{} probes, fake={}ms legit={}ms",
                        proxy,
                        tally.answered(),
                        domains,
                        calibration.expected_fake_ms,
                        calibration.expected_legit_ms
                    );
                } else {
                    warn!(
                        "proxy {} answered {}/{} probes, disabled",
                        proxy,
                        tally.answered(),
                        domains
                    );
                }
                proxy.calibrated(calibration)
            })
            .collect();

        if !calibrated.iter().any(Proxy::is_enabled) {
            warn!("no proxy passed calibration, queries will go unanswered");
        }

        calibrated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(blocked: &[u64], non_blocked: &[u64]) -> ProbeTally {
        let mut tally = ProbeTally::default();
        for &ms in blocked {
            tally.record(ProbeKind::Blocked, ms);
        }
        for &ms in non_blocked {
            tally.record(ProbeKind::NonBlocked, ms);
        }
        tally
    }

    #[test]
    fn too_few_answers_disables() {
        let tally = tally(&[20], &[80]);

        assert_eq!(tally.calibration(4), Calibration::disabled());
    }

    #[test]
    fn all_answers_average_latencies() {
        let tally = tally(&[20, 31], &[80, 101]);

        let calibration = tally.calibration(4);

        assert!(calibration.enabled);
        assert_eq!(calibration.expected_fake_ms, 25);
        assert_eq!(calibration.expected_legit_ms, 90);
    }

    #[test]
    fn threshold_is_inclusive() {
        // 4 of 5 is exactly 80%
        let tally = tally(&[10, 10], &[50, 70]);

        assert!(tally.calibration(5).enabled);
        assert!(!tally.calibration(6).enabled);
    }

    #[test]
    fn missing_category_disables() {
        let tally = tally(&[], &[50, 60, 70, 80, 90]);

        assert_eq!(tally.calibration(6), Calibration::disabled());
    }

    #[test]
    fn untouched_tally_disables() {
        assert!(!ProbeTally::default().calibration(2).enabled);
    }
}
