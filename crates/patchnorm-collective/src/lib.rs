//! All-gather collective primitive for patch-parallel workers.
//!
//! Every worker contributes one small buffer and receives the buffers of
//! all workers, laid out in rank order. Calls are synchronous and
//! blocking: a worker that never posts a round stalls every peer, and any
//! failure is fatal to the whole group.
//!
//! Two implementations ship with the crate:
//! - [`LoopbackCollective`] for a single worker (unsharded execution).
//! - [`LocalFabric`] for N in-process workers that rendezvous through
//!   shared memory, used by simulations and tests.

use std::fmt;

mod local;
mod loopback;

pub use local::{LocalCollective, LocalFabric, run_workers};
pub use loopback::LoopbackCollective;

// ── Errors ────────────────────────────────────────────────────────────

/// Element type carried by one collective round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    F32,
    U64,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::U64 => write!(f, "u64"),
        }
    }
}

/// Errors produced by collective operations. None of them are recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectiveError {
    /// The collective group was configured incorrectly.
    #[error("invalid collective config: {0}")]
    InvalidConfig(String),
    /// The receive buffer does not hold `world_size` blocks.
    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// Ranks posted buffers of different lengths in the same round.
    #[error("round {round}: rank {rank} posted {actual} values, rank 0 posted {expected}")]
    ShapeMismatch { round: u64, rank: usize, expected: usize, actual: usize },
    /// Ranks posted different element types in the same round.
    #[error("round {round}: rank {rank} posted {actual} payload, rank 0 posted {expected}")]
    KindMismatch { round: u64, rank: usize, expected: PayloadKind, actual: PayloadKind },
    /// A participant left the group before posting a round.
    #[error("rank {rank} left the collective group before round {round}")]
    PeerDeparted { round: u64, rank: usize },
    /// A round did not complete within the configured harness timeout.
    #[error("round {round} timed out after {waited_ms} ms")]
    Timeout { round: u64, waited_ms: u64 },
    /// Shared collective state was poisoned by a panicking worker.
    #[error("collective state poisoned by a panicking worker")]
    Poisoned,
}

// ── Collective context ────────────────────────────────────────────────

/// Capability handed to every sharded layer.
///
/// Implementations must deliver contributions in rank order and must
/// return identical data to every rank for the same round.
pub trait CollectiveContext: fmt::Debug + Send + Sync {
    /// Number of participating workers.
    fn world_size(&self) -> usize;

    /// Rank of this worker (0-based).
    fn rank(&self) -> usize;

    /// Gather `send_buf` from every rank into `recv_buf`.
    ///
    /// `recv_buf` must hold exactly `world_size * send_buf.len()` values;
    /// rank `r`'s contribution lands at `r * send_buf.len()`.
    fn all_gather(&self, send_buf: &[f32], recv_buf: &mut [f32]) -> Result<(), CollectiveError>;

    /// Integer flavour of [`CollectiveContext::all_gather`].
    fn all_gather_u64(&self, send_buf: &[u64], recv_buf: &mut [u64])
    -> Result<(), CollectiveError>;

    /// Allocate the receive buffer and gather into it.
    fn gather_f32(&self, send_buf: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        let mut recv_buf = vec![0.0; send_buf.len() * self.world_size()];
        self.all_gather(send_buf, &mut recv_buf)?;
        Ok(recv_buf)
    }
}

/// Check that a receive buffer can hold one block per rank.
pub(crate) fn check_recv_len(
    send_len: usize,
    recv_len: usize,
    world_size: usize,
) -> Result<(), CollectiveError> {
    let expected = send_len * world_size;
    if recv_len != expected {
        return Err(CollectiveError::LengthMismatch { expected, actual: recv_len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_len_must_match_world() {
        assert!(check_recv_len(3, 6, 2).is_ok());
        assert_eq!(
            check_recv_len(3, 5, 2),
            Err(CollectiveError::LengthMismatch { expected: 6, actual: 5 })
        );
    }

    #[test]
    fn error_messages_name_the_rank() {
        let err = CollectiveError::KindMismatch {
            round: 2,
            rank: 1,
            expected: PayloadKind::F32,
            actual: PayloadKind::U64,
        };
        assert_eq!(err.to_string(), "round 2: rank 1 posted u64 payload, rank 0 posted f32");

        let err = CollectiveError::PeerDeparted { round: 0, rank: 3 };
        assert!(err.to_string().contains("rank 3"));
    }

    #[test]
    fn gather_f32_allocates_world_sized_buffer() {
        let ctx = LoopbackCollective::new();
        let out = ctx.gather_f32(&[1.0, 2.0]).unwrap();
        assert_eq!(out, vec![1.0, 2.0]);
    }
}
