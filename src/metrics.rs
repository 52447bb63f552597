//! Wire-activity metrics.
//!
//! Process-wide counters across all connections, exposed through the
//! `metriken` registry for Prometheus exposition by the host.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "loomline/frames/received",
    description = "Total HTTP/2 frames received"
)]
pub static FRAMES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "loomline/frames/sent",
    description = "Total HTTP/2 frames sent"
)]
pub static FRAMES_SENT: Counter = Counter::new();

#[metric(
    name = "loomline/streams/opened",
    description = "Total streams opened"
)]
pub static STREAMS_OPENED: Counter = Counter::new();

#[metric(
    name = "loomline/streams/closed",
    description = "Total streams closed"
)]
pub static STREAMS_CLOSED: Counter = Counter::new();

#[metric(
    name = "loomline/streams/active",
    description = "Currently live streams"
)]
pub static STREAMS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "loomline/resets/sent",
    description = "RST_STREAM frames sent"
)]
pub static RESETS_SENT: Counter = Counter::new();

#[metric(
    name = "loomline/resets/received",
    description = "RST_STREAM frames received"
)]
pub static RESETS_RECEIVED: Counter = Counter::new();

#[metric(
    name = "loomline/goaway/sent",
    description = "GOAWAY frames sent"
)]
pub static GOAWAY_SENT: Counter = Counter::new();

#[metric(
    name = "loomline/messages/started",
    description = "Messages surfaced to the application"
)]
pub static MESSAGES_STARTED: Counter = Counter::new();
