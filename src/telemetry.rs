use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::logger::{self, BreadcrumbFlags};

const MAX_EVENTS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayProtocol {
    Udp,
    Tcp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayDirection {
    /// entity A to entity B (UDP), client to server (TCP)
    Forward,
    /// entity B to entity A (UDP), server to client (TCP)
    Reverse,
}

#[derive(Clone, Debug)]
pub struct RelayEvent {
    pub timestamp_ms: u64,
    pub protocol: RelayProtocol,
    pub direction: RelayDirection,
    /// port the relay socket is bound to
    pub proxy_port: u16,
    pub received: usize,
    pub forwarded: usize,
}

impl RelayEvent {
    pub fn new(
        protocol: RelayProtocol,
        direction: RelayDirection,
        proxy_port: u16,
        received: usize,
        forwarded: usize,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            protocol,
            direction,
            proxy_port,
            received,
            forwarded,
        }
    }
}

#[derive(Default)]
struct TelemetryInner {
    events: VecDeque<RelayEvent>,
    dropped: u64,
}

#[derive(Default)]
pub struct Telemetry {
    inner: Mutex<TelemetryInner>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TelemetryInner {
                events: VecDeque::with_capacity(MAX_EVENTS),
                dropped: 0,
            }),
        }
    }

    pub fn record(&self, event: RelayEvent) {
        let mut guard = self.inner.lock();
        if guard.events.len() >= MAX_EVENTS {
            guard.events.pop_front();
            guard.dropped = guard.dropped.saturating_add(1);
            logger::breadcrumb(
                BreadcrumbFlags::BOOT,
                "telemetry backlog saturated, dropping oldest event".to_string(),
            );
        }
        guard.events.push_back(event);
    }

    /// Removes up to `max_events` events, oldest first, and returns them
    /// together with the number of events dropped since the last drain.
    pub fn drain(&self, max_events: usize) -> (Vec<RelayEvent>, u64) {
        let mut guard = self.inner.lock();
        let mut drained = Vec::with_capacity(max_events.min(guard.events.len()));
        while drained.len() < max_events {
            match guard.events.pop_front() {
                Some(event) => drained.push(event),
                None => break,
            }
        }
        let dropped = guard.dropped;
        guard.dropped = 0;
        (drained, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(received: usize) -> RelayEvent {
        RelayEvent::new(RelayProtocol::Udp, RelayDirection::Forward, 20001, received, 65_500)
    }

    #[test]
    fn drain_returns_oldest_first() {
        let telemetry = Telemetry::new();
        telemetry.record(event(1));
        telemetry.record(event(2));
        telemetry.record(event(3));
        let (events, dropped) = telemetry.drain(2);
        assert_eq!(events.iter().map(|e| e.received).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(dropped, 0);
        let (rest, _) = telemetry.drain(10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].received, 3);
    }

    #[test]
    fn overflow_evicts_and_counts() {
        let telemetry = Telemetry::new();
        for idx in 0..MAX_EVENTS + 5 {
            telemetry.record(event(idx));
        }
        let (events, dropped) = telemetry.drain(MAX_EVENTS * 2);
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(dropped, 5);
        assert_eq!(events[0].received, 5);
        let (_, dropped_again) = telemetry.drain(1);
        assert_eq!(dropped_again, 0);
    }
}
