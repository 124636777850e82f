//! Opcode capability probing.

use crate::sys;

/// Which operations the running kernel supports, cached as a bitset.
///
/// Built from a one-shot probe registration; query it instead of probing
/// again.
#[derive(Debug, Clone, Copy)]
pub struct RingProbe {
    supported: [u64; 4],
    last_op: u8,
}

impl RingProbe {
    pub(crate) fn from_reply(
        header: &sys::io_uring_probe,
        ops: &[sys::io_uring_probe_op],
    ) -> Self {
        let mut supported = [0u64; 4];
        for op in &ops[..(header.ops_len as usize).min(ops.len())] {
            if op.flags & sys::IO_URING_OP_SUPPORTED != 0 {
                supported[(op.op >> 6) as usize] |= 1 << (op.op & 63);
            }
        }
        Self {
            supported,
            last_op: header.last_op,
        }
    }

    /// Whether the kernel can execute `opcode`.
    pub fn is_supported(&self, opcode: u8) -> bool {
        self.supported[(opcode >> 6) as usize] & (1 << (opcode & 63)) != 0
    }

    /// Highest opcode the kernel knows about, supported or not.
    pub fn last_op(&self) -> u8 {
        self.last_op
    }
}
