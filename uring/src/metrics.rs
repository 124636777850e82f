//! Ring metrics.
//!
//! Counters for enter syscalls, submission/completion throughput, and the
//! recovery and deferral paths. Exposed through metriken for scraping by
//! whatever exposition layer the embedding application runs.

use metriken::{Counter, metric};

// ── Kernel transitions ───────────────────────────────────────────

#[metric(name = "uring/enter/calls", description = "Total io_uring_enter syscalls")]
pub static ENTER_CALLS: Counter = Counter::new();

#[metric(
    name = "uring/enter/wakeups",
    description = "Enter calls issued only to wake the kernel SQ poll thread"
)]
pub static SQPOLL_WAKEUPS: Counter = Counter::new();

// ── Submission ───────────────────────────────────────────────────

#[metric(name = "uring/sqe/submitted", description = "SQEs confirmed consumed by the kernel")]
pub static SQE_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "uring/sqe/queue_full",
    description = "Slot acquisitions that failed because the queue was full"
)]
pub static SQ_FULL: Counter = Counter::new();

#[metric(
    name = "uring/sqe/deferred",
    description = "Operations deferred because no slot was free"
)]
pub static OPS_DEFERRED: Counter = Counter::new();

// ── Completion ───────────────────────────────────────────────────

#[metric(name = "uring/cqe/harvested", description = "CQEs dequeued")]
pub static CQE_HARVESTED: Counter = Counter::new();

#[metric(
    name = "uring/cqe/overflow_recoveries",
    description = "Batch reads that forced a getevents to recover overflowed CQEs"
)]
pub static CQ_OVERFLOW_RECOVERIES: Counter = Counter::new();

// ── Registration ─────────────────────────────────────────────────

#[metric(name = "uring/register/calls", description = "Total io_uring_register syscalls")]
pub static REGISTER_CALLS: Counter = Counter::new();

#[metric(
    name = "uring/register/rlimit_raises",
    description = "RLIMIT_NOFILE raises performed to complete a file registration"
)]
pub static RLIMIT_RAISES: Counter = Counter::new();
