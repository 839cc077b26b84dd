use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Phase timestamps of a single HTTP round trip. Every redirect hop gets its own.
#[derive(Debug, Clone, Default)]
pub(crate) struct RoundTripTrace {
    pub tls: bool,
    pub start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub got_conn: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_done: Option<Instant>,
    pub end: Option<Instant>,
}

impl RoundTripTrace {
    pub fn durations(&self) -> PhaseDurations {
        PhaseDurations {
            resolve: between(self.start, self.dns_done),
            connect: between(self.dns_done, self.connect_done),
            tls: if self.tls {
                between(self.tls_start, self.tls_done)
            } else {
                Duration::ZERO
            },
            processing: between(self.got_conn, self.first_byte),
            transfer: between(self.first_byte, self.end),
        }
    }
}

/// Missing timestamps and clock inversions both collapse to zero.
fn between(from: Option<Instant>, to: Option<Instant>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) => to.saturating_duration_since(from),
        _ => Duration::ZERO,
    }
}

/// Durations of the network phases of one round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseDurations {
    pub resolve: Duration,
    pub connect: Duration,
    pub tls: Duration,
    pub processing: Duration,
    pub transfer: Duration,
}

impl PhaseDurations {
    /// `(phase label, seconds)` pairs in exposition order.
    pub fn phases(&self) -> [(&'static str, f64); 5] {
        [
            ("resolve", self.resolve.as_secs_f64()),
            ("connect", self.connect.as_secs_f64()),
            ("tls", self.tls.as_secs_f64()),
            ("processing", self.processing.as_secs_f64()),
            ("transfer", self.transfer.as_secs_f64()),
        ]
    }
}

/// The trace history of one transport. Only the newest trace is ever written.
#[derive(Debug, Clone, Default)]
pub(crate) struct TraceLog {
    traces: Arc<Mutex<Vec<RoundTripTrace>>>,
}

impl TraceLog {
    pub fn begin(&self, tls: bool) -> TraceHandle {
        self.traces.lock().push(RoundTripTrace {
            tls,
            ..RoundTripTrace::default()
        });
        TraceHandle { log: self.clone() }
    }

    /// A recorder for the newest trace without starting a new one.
    pub fn current(&self) -> TraceHandle {
        TraceHandle { log: self.clone() }
    }

    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    pub fn last(&self) -> Option<RoundTripTrace> {
        self.traces.lock().last().cloned()
    }

    fn update(&self, f: impl FnOnce(&mut RoundTripTrace)) {
        let mut traces = self.traces.lock();
        if let Some(current) = traces.last_mut() {
            f(current);
        }
    }
}

/// Recorder handed to the underlying transport for the current round trip.
///
/// Callbacks may run on another task than the prober; each one takes the lock
/// only long enough to store a timestamp.
#[derive(Debug, Clone)]
pub struct TraceHandle {
    log: TraceLog,
}

impl TraceHandle {
    pub fn dns_start(&self) {
        let now = Instant::now();
        self.log.update(|t| t.start = Some(now));
    }

    pub fn dns_done(&self) {
        let now = Instant::now();
        self.log.update(|t| t.dns_done = Some(now));
    }

    /// When no lookup happened (the connection target was an address), the
    /// resolve phase is pinned to zero at this point.
    pub fn connect_start(&self) {
        let now = Instant::now();
        self.log.update(|t| {
            if t.dns_done.is_none() {
                t.start = Some(now);
                t.dns_done = Some(now);
            }
        });
    }

    pub fn connect_done(&self) {
        let now = Instant::now();
        self.log.update(|t| t.connect_done = Some(now));
    }

    pub fn tls_start(&self) {
        let now = Instant::now();
        self.log.update(|t| t.tls_start = Some(now));
    }

    pub fn tls_done(&self) {
        let now = Instant::now();
        self.log.update(|t| t.tls_done = Some(now));
    }

    pub fn got_conn(&self) {
        let now = Instant::now();
        self.log.update(|t| t.got_conn = Some(now));
    }

    pub fn first_byte(&self) {
        let now = Instant::now();
        self.log.update(|t| t.first_byte = Some(now));
    }

    pub fn end(&self) {
        let now = Instant::now();
        self.log.update(|t| t.end = Some(now));
    }
}
