use std::{
    fmt::{self, Display, Formatter},
    ops::AddAssign,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use hdrhistogram::{sync::Recorder, Histogram, SyncHistogram};
use quanta::Clock;

use crate::common::Protocol;

/// Service-wide counters, updated by workers without locking.
#[derive(Debug, Default)]
pub struct Stats {
    calls: AtomicU64,
    udp_calls: AtomicU64,
    tcp_calls: AtomicU64,
    connections: AtomicU64,
}

impl Stats {
    pub fn count_call(&self, protocol: Protocol) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match protocol {
            Protocol::Udp => &self.udp_calls,
            Protocol::Tcp => &self.tcp_calls,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn udp_calls(&self) -> u64 {
        self.udp_calls.load(Ordering::Relaxed)
    }

    pub fn tcp_calls(&self) -> u64 {
        self.tcp_calls.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "calls {} (udp {}, tcp {}), connections {}",
            self.calls(),
            self.udp_calls(),
            self.tcp_calls(),
            self.connections()
        )
    }
}

pub struct Latency {
    name: String,
    hist: SyncHistogram<u32>,
}

#[derive(Clone)]
pub struct LocalLatency {
    recorder: Recorder<u32>,
    clock: Clock,
}

impl Latency {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hist: Histogram::new(2).unwrap().into(),
        }
    }

    /// Collect what the local recorders have measured so far.
    pub fn refresh(&mut self) {
        self.hist.refresh();
    }

    pub fn len(&self) -> u64 {
        self.hist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hist.is_empty()
    }

    pub fn local(&self) -> LocalLatency {
        LocalLatency {
            recorder: self.hist.recorder(),
            clock: Clock::new(),
        }
    }
}

pub struct Measure(u64);

impl LocalLatency {
    pub fn measure(&self) -> Measure {
        Measure(self.clock.start())
    }
}

impl AddAssign<Measure> for LocalLatency {
    fn add_assign(&mut self, measure: Measure) {
        self.recorder += self.clock.delta(measure.0, self.clock.end()).as_nanos() as u64;
    }
}

impl Display for Latency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.hist.is_empty() {
            return write!(f, "{} latency: no samples", self.name);
        }
        let nanos = |value: u64| Duration::from_nanos(value);
        write!(
            f,
            "{} latency: {} samples, mean {:?}",
            self.name,
            self.hist.len(),
            nanos(self.hist.mean() as u64)
        )?;
        for (label, quantile) in [("p50", 0.5), ("p90", 0.9), ("p99", 0.99)] {
            write!(f, ", {} {:?}", label, nanos(self.hist.value_at_quantile(quantile)))?;
        }
        write!(f, ", max {:?}", nanos(self.hist.max()))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn calls_counted_per_protocol() {
        let stats = Stats::default();
        stats.count_call(Protocol::Udp);
        stats.count_call(Protocol::Udp);
        stats.count_call(Protocol::Tcp);
        stats.count_connection();
        assert_eq!(stats.calls(), 3);
        assert_eq!(stats.udp_calls(), 2);
        assert_eq!(stats.tcp_calls(), 1);
        assert_eq!(
            stats.to_string(),
            "calls 3 (udp 2, tcp 1), connections 1"
        );
    }

    #[test]
    fn local_measures_show_after_refresh() {
        let mut latency = Latency::new("test");
        assert_eq!(latency.to_string(), "test latency: no samples");
        let locals: Vec<_> = (0..4)
            .map(|_| {
                let mut local = latency.local();
                thread::spawn(move || {
                    for _ in 0..10 {
                        let measure = local.measure();
                        thread::yield_now();
                        local += measure;
                    }
                })
            })
            .collect();
        for local in locals {
            local.join().unwrap();
        }
        latency.refresh();
        assert_eq!(latency.len(), 40);
        let report = latency.to_string();
        assert!(report.starts_with("test latency: 40 samples, mean "));
        assert!(report.contains(", p99 "));
        assert!(report.contains(", max "));
    }
}
