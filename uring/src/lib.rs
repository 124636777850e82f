//! uring: a userspace io_uring binding for Linux.
//!
//! Two lock-free rings are shared with the kernel through mapped pages: a
//! submission queue of fixed-layout operation descriptors and a completion
//! queue of results. This crate owns the ring lifecycle, the slot-state
//! protocol that keeps half-encoded descriptors invisible to the kernel,
//! the memory-ordering discipline both rings need, and the registration
//! protocol for auxiliary resources (fixed files and buffers, buffer
//! groups and rings, eventfd, the ring fd itself).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use uring::Ring;
//!
//! fn main() -> Result<(), uring::Error> {
//!     let mut ring = Ring::new(8)?;
//!
//!     let slot = ring.try_slot().unwrap();
//!     ring.prepare(slot, |sqe| sqe.prep_nop(7));
//!
//!     ring.submit_and_wait(1)?;
//!     let completion = ring.try_completion().unwrap();
//!     assert_eq!(completion.user_data(), 7);
//!     assert_eq!(completion.result(), 0);
//!     Ok(())
//! }
//! ```
//!
//! Operations complete in whatever order the kernel finishes them; the
//! caller-chosen correlation tag (`user_data`) ties each completion back
//! to its submission. Per-operation failures are never surfaced as
//! errors from this API; they arrive as negative results in the matching
//! completion record.
//!
//! # Platform
//!
//! Linux only. The core works on 5.1+; individual opcodes and
//! registration calls need newer kernels, so probe at runtime with
//! [`Ring::probe`].

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod buffer;
pub(crate) mod cqueue;
pub(crate) mod metrics;
pub(crate) mod mmap;
pub(crate) mod probe;
pub(crate) mod register;
pub(crate) mod ring;
pub(crate) mod sqe;
pub(crate) mod squeue;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod sys;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Backing pool for a provide-buffers group.
pub use buffer::BufferGroup;
/// Ring-mapped provided-buffer ring.
pub use buffer::BufferRing;
/// Ring configuration.
pub use config::Config;
/// Builder for [`Config`] with `build()` validation.
pub use config::ConfigBuilder;
/// Kernel submission-queue polling options.
pub use config::SqPoll;
/// One dequeued completion record.
pub use cqueue::Completion;
/// Crate errors.
pub use error::Error;
/// Crate result alias.
pub use error::Result;
/// Cached opcode-capability bitset.
pub use probe::RingProbe;
/// The ring session: queues, submission, completions, registration.
pub use ring::Ring;
/// Memlock budget needed by a configuration on older kernels.
pub use ring::mlock_size;
/// Raw file descriptor wrapper for operation encoding.
pub use sqe::Fd;
/// Fixed-file table index.
pub use sqe::Fixed;
/// One submission descriptor and its operation encoders.
pub use sqe::Sqe;
/// Token for an acquired submission slot.
pub use squeue::Slot;
