//! Service metrics.

use metriken::{Counter, Gauge, metric};

// Session lifecycle
#[metric(
    name = "sessions_admitted",
    description = "Total sessions admitted across all loops"
)]
pub static SESSIONS_ADMITTED: Counter = Counter::new();

#[metric(
    name = "sessions_active",
    description = "Number of currently live sessions"
)]
pub static SESSIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "sessions_closed",
    description = "Total sessions closed (any reason)"
)]
pub static SESSIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "admission_failures",
    description = "Admissions rejected (allocator full or registration failure)"
)]
pub static ADMISSION_FAILURES: Counter = Counter::new();

// Data plane
#[metric(name = "bytes_received", description = "Application bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Application bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "recv_overflow_disconnects",
    description = "Sessions disconnected for exceeding the receive buffer cap"
)]
pub static RECV_OVERFLOW_DISCONNECTS: Counter = Counter::new();

#[metric(
    name = "ping_timeouts",
    description = "Sessions disconnected by the ping-check watchdog"
)]
pub static PING_TIMEOUTS: Counter = Counter::new();

// Outbound connects
#[metric(name = "connects_started", description = "Connect requests accepted")]
pub static CONNECTS_STARTED: Counter = Counter::new();

#[metric(name = "connects_ok", description = "Connects that completed")]
pub static CONNECTS_OK: Counter = Counter::new();

#[metric(name = "connects_failed", description = "Connects that failed")]
pub static CONNECTS_FAILED: Counter = Counter::new();

#[metric(name = "connect_timeouts", description = "Connects that timed out")]
pub static CONNECT_TIMEOUTS: Counter = Counter::new();
