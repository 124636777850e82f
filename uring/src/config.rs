//! Ring configuration.
//!
//! [`Config`] captures everything negotiated with the kernel at setup
//! time. Use it directly or through [`ConfigBuilder`]; either way
//! [`Config::validate`] runs before any kernel interaction, so a bad
//! configuration never reaches `io_uring_setup`.

use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::sys;

/// Kernel submission-queue polling parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqPoll {
    /// Idle time in milliseconds before the kernel poll thread sleeps and
    /// starts requiring an explicit wakeup.
    pub idle_ms: u32,
    /// Pin the poll thread to this CPU.
    pub cpu: Option<u32>,
}

/// Ring setup options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Requested submission queue entries. Rounded up to the next power of
    /// two before setup; the kernel reports the negotiated count back.
    pub entries: u32,
    /// Completion queue entries. The default is the kernel's (twice the
    /// submission entries); when set it must be at least `entries`.
    pub cq_entries: Option<u32>,
    /// Busy-poll for completions on the device side instead of relying on
    /// interrupts. Only meaningful for files opened with O_DIRECT.
    pub io_poll: bool,
    /// Run a kernel thread that polls the submission queue, removing the
    /// enter syscall from the submit path while the thread is awake.
    pub sq_poll: Option<SqPoll>,
    /// Clamp oversized entry counts to the kernel maxima instead of
    /// failing validation.
    pub clamp: bool,
    /// Share the async worker backend of an existing ring.
    pub attach_wq: Option<RawFd>,
    /// Create the ring disabled; it must be enabled through registration
    /// before use (see `Ring::enable_rings`).
    pub start_disabled: bool,
    /// Keep consuming submission entries after one fails instead of
    /// stopping the batch at the first error.
    pub submit_all: bool,
    /// Hint that completions are processed by the submitting task, letting
    /// the kernel skip interrupt-style rescheduling.
    pub coop_taskrun: bool,
    /// Have the kernel raise a submission-ring flag when task work is
    /// pending, so userspace knows an enter is worthwhile.
    pub taskrun_flag: bool,
    /// 128-byte submission descriptors (passthrough commands).
    pub sqe128: bool,
    /// 32-byte completion records.
    pub cqe32: bool,
    /// Promise that a single task submits; unlocks kernel fast paths.
    pub single_issuer: bool,
    /// Defer task work until a getevents enter. Requires `single_issuer`.
    pub defer_taskrun: bool,
    /// Mark the ring mappings MADV_DONTFORK at construction so a forked
    /// child cannot touch the shared rings.
    pub dont_fork: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entries: 128,
            cq_entries: None,
            io_poll: false,
            sq_poll: None,
            clamp: false,
            attach_wq: None,
            start_disabled: false,
            submit_all: false,
            coop_taskrun: false,
            taskrun_flag: false,
            sqe128: false,
            cqe32: false,
            single_issuer: false,
            defer_taskrun: false,
            dont_fork: false,
        }
    }
}

impl Config {
    /// Validate the configuration without touching the kernel.
    pub fn validate(&self) -> Result<()> {
        if self.entries == 0 {
            return Err(Error::Config("entries must be nonzero".into()));
        }
        if self.entries > sys::IORING_MAX_ENTRIES && !self.clamp {
            return Err(Error::Config(format!(
                "entries {} exceeds the kernel maximum {} (enable clamp to truncate)",
                self.entries,
                sys::IORING_MAX_ENTRIES
            )));
        }
        if let Some(cq) = self.cq_entries {
            if cq == 0 {
                return Err(Error::Config("cq_entries must be nonzero".into()));
            }
            if cq < self.entries {
                return Err(Error::Config(
                    "cq_entries must be at least entries".into(),
                ));
            }
            if cq > sys::IORING_MAX_CQ_ENTRIES && !self.clamp {
                return Err(Error::Config(format!(
                    "cq_entries {} exceeds the kernel maximum {} (enable clamp to truncate)",
                    cq,
                    sys::IORING_MAX_CQ_ENTRIES
                )));
            }
        }
        if self.defer_taskrun && !self.single_issuer {
            return Err(Error::Config(
                "defer_taskrun requires single_issuer".into(),
            ));
        }
        if self.sq_poll.is_some() && (self.coop_taskrun || self.defer_taskrun) {
            return Err(Error::Config(
                "task-run hints are incompatible with sq_poll".into(),
            ));
        }
        Ok(())
    }

    /// Assemble the setup flag word.
    pub(crate) fn setup_flags(&self) -> u32 {
        let mut flags = 0;
        if self.io_poll {
            flags |= sys::IORING_SETUP_IOPOLL;
        }
        if let Some(sq_poll) = self.sq_poll {
            flags |= sys::IORING_SETUP_SQPOLL;
            if sq_poll.cpu.is_some() {
                flags |= sys::IORING_SETUP_SQ_AFF;
            }
        }
        if self.cq_entries.is_some() {
            flags |= sys::IORING_SETUP_CQSIZE;
        }
        if self.clamp {
            flags |= sys::IORING_SETUP_CLAMP;
        }
        if self.attach_wq.is_some() {
            flags |= sys::IORING_SETUP_ATTACH_WQ;
        }
        if self.start_disabled {
            flags |= sys::IORING_SETUP_R_DISABLED;
        }
        if self.submit_all {
            flags |= sys::IORING_SETUP_SUBMIT_ALL;
        }
        if self.coop_taskrun {
            flags |= sys::IORING_SETUP_COOP_TASKRUN;
        }
        if self.taskrun_flag {
            flags |= sys::IORING_SETUP_TASKRUN_FLAG;
        }
        if self.sqe128 {
            flags |= sys::IORING_SETUP_SQE128;
        }
        if self.cqe32 {
            flags |= sys::IORING_SETUP_CQE32;
        }
        if self.single_issuer {
            flags |= sys::IORING_SETUP_SINGLE_ISSUER;
        }
        if self.defer_taskrun {
            flags |= sys::IORING_SETUP_DEFER_TASKRUN;
        }
        flags
    }

    /// Build the setup params the kernel negotiates against.
    pub(crate) fn to_params(&self) -> sys::io_uring_params {
        let mut params = sys::io_uring_params {
            flags: self.setup_flags(),
            ..Default::default()
        };
        if let Some(cq) = self.cq_entries {
            params.cq_entries = cq.min(sys::IORING_MAX_CQ_ENTRIES).next_power_of_two();
        }
        if let Some(sq_poll) = self.sq_poll {
            params.sq_thread_idle = sq_poll.idle_ms;
            if let Some(cpu) = sq_poll.cpu {
                params.sq_thread_cpu = cpu;
            }
        }
        if let Some(wq_fd) = self.attach_wq {
            params.wq_fd = wq_fd as u32;
        }
        params
    }
}

/// Builder for [`Config`]. `build()` validates.
#[derive(Debug, Default, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // ── Queue geometry ──────────────────────────────────────────────

    /// Requested submission queue entries.
    pub fn entries(mut self, entries: u32) -> Self {
        self.config.entries = entries;
        self
    }

    /// Completion queue entries (defaults to the kernel's choice).
    pub fn cq_entries(mut self, cq_entries: u32) -> Self {
        self.config.cq_entries = Some(cq_entries);
        self
    }

    /// Clamp oversized entry counts instead of rejecting them.
    pub fn clamp(mut self) -> Self {
        self.config.clamp = true;
        self
    }

    // ── Kernel polling ──────────────────────────────────────────────

    /// Device-side completion polling.
    pub fn io_poll(mut self) -> Self {
        self.config.io_poll = true;
        self
    }

    /// Kernel submission polling with the given idle time.
    pub fn sq_poll(mut self, idle_ms: u32) -> Self {
        self.config.sq_poll = Some(SqPoll { idle_ms, cpu: None });
        self
    }

    /// Kernel submission polling pinned to a CPU.
    pub fn sq_poll_on_cpu(mut self, idle_ms: u32, cpu: u32) -> Self {
        self.config.sq_poll = Some(SqPoll {
            idle_ms,
            cpu: Some(cpu),
        });
        self
    }

    // ── Task-run behavior ───────────────────────────────────────────

    pub fn submit_all(mut self) -> Self {
        self.config.submit_all = true;
        self
    }

    pub fn coop_taskrun(mut self) -> Self {
        self.config.coop_taskrun = true;
        self
    }

    pub fn taskrun_flag(mut self) -> Self {
        self.config.taskrun_flag = true;
        self
    }

    pub fn defer_taskrun(mut self) -> Self {
        self.config.defer_taskrun = true;
        self
    }

    // ── Record formats ──────────────────────────────────────────────

    /// 128-byte submission descriptors.
    pub fn sqe128(mut self) -> Self {
        self.config.sqe128 = true;
        self
    }

    /// 32-byte completion records.
    pub fn cqe32(mut self) -> Self {
        self.config.cqe32 = true;
        self
    }

    // ── Ownership and lifecycle ─────────────────────────────────────

    pub fn single_issuer(mut self) -> Self {
        self.config.single_issuer = true;
        self
    }

    /// Create the ring disabled (enable later via registration).
    pub fn start_disabled(mut self) -> Self {
        self.config.start_disabled = true;
        self
    }

    /// Share another ring's async worker backend.
    pub fn attach_wq(mut self, ring_fd: RawFd) -> Self {
        self.config.attach_wq = Some(ring_fd);
        self
    }

    /// Keep the ring mappings out of forked children.
    pub fn dont_fork(mut self) -> Self {
        self.config.dont_fork = true;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_entries_rejected() {
        let config = Config {
            entries: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversize_needs_clamp() {
        let mut config = Config {
            entries: sys::IORING_MAX_ENTRIES + 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        config.clamp = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cq_smaller_than_sq_rejected() {
        let config = Config {
            entries: 64,
            cq_entries: Some(32),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn defer_taskrun_needs_single_issuer() {
        let config = Config {
            defer_taskrun: true,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = ConfigBuilder::new()
            .single_issuer()
            .defer_taskrun()
            .build()
            .unwrap();
        assert!(config.defer_taskrun);
    }

    #[test]
    fn sq_poll_flags() {
        let config = ConfigBuilder::new()
            .entries(64)
            .sq_poll_on_cpu(100, 3)
            .build()
            .unwrap();
        let flags = config.setup_flags();
        assert!(flags & sys::IORING_SETUP_SQPOLL != 0);
        assert!(flags & sys::IORING_SETUP_SQ_AFF != 0);
        let params = config.to_params();
        assert_eq!(params.sq_thread_cpu, 3);
        assert_eq!(params.sq_thread_idle, 100);
    }

    #[test]
    fn cq_entries_rounded_in_params() {
        let config = ConfigBuilder::new()
            .entries(32)
            .cq_entries(48)
            .build()
            .unwrap();
        let params = config.to_params();
        assert!(params.flags & sys::IORING_SETUP_CQSIZE != 0);
        assert_eq!(params.cq_entries, 64);
    }
}
