//! In-process collective fabric.
//!
//! Each worker runs on its own thread and owns one [`LocalCollective`].
//! Calls are matched by round number: the k-th call of every worker forms
//! round k, and no worker leaves a round before every rank has posted it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::{CollectiveContext, CollectiveError, PayloadKind, check_recv_len};

#[derive(Debug, Clone, PartialEq)]
enum Payload {
    F32(Vec<f32>),
    U64(Vec<u64>),
}

impl Payload {
    fn kind(&self) -> PayloadKind {
        match self {
            Self::F32(_) => PayloadKind::F32,
            Self::U64(_) => PayloadKind::U64,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::U64(values) => values.len(),
        }
    }

    fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::F32(values) => Some(values),
            Self::U64(_) => None,
        }
    }

    fn as_u64(&self) -> Option<&[u64]> {
        match self {
            Self::U64(values) => Some(values),
            Self::F32(_) => None,
        }
    }
}

#[derive(Debug)]
struct Round {
    slots: Vec<Option<Payload>>,
    /// Ranks whose call on this round has returned, successfully or not.
    left: usize,
}

impl Round {
    fn new(world_size: usize) -> Self {
        Self { slots: vec![None; world_size], left: 0 }
    }

    fn posted(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn missing_ranks(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().enumerate().filter(|(_, slot)| slot.is_none()).map(|(rank, _)| rank)
    }
}

#[derive(Debug)]
struct FabricState {
    rounds: HashMap<u64, Round>,
    departed: Vec<bool>,
}

impl FabricState {
    /// The round is dropped once every rank that posted to it has left.
    fn leave(&mut self, round: u64) {
        let Some(pending) = self.rounds.get_mut(&round) else {
            return;
        };
        pending.left += 1;
        if pending.left >= pending.posted() {
            self.rounds.remove(&round);
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<FabricState>,
    round_posted: Condvar,
    timeout: Option<Duration>,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, FabricState>, CollectiveError> {
        self.state.lock().map_err(|_| CollectiveError::Poisoned)
    }
}

/// Builder for a group of in-process workers.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    world_size: usize,
    timeout: Option<Duration>,
}

impl LocalFabric {
    pub fn new(world_size: usize) -> Result<Self, CollectiveError> {
        if world_size == 0 {
            return Err(CollectiveError::InvalidConfig("world_size must be >= 1".into()));
        }
        Ok(Self { world_size, timeout: None })
    }

    /// Fail a round with [`CollectiveError::Timeout`] instead of waiting forever.
    ///
    /// Only meant for test harnesses; the protocol itself has no timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// One context per rank, in rank order. Each must move to its own thread.
    pub fn into_contexts(self) -> Vec<LocalCollective> {
        let shared = Arc::new(Shared {
            state: Mutex::new(FabricState {
                rounds: HashMap::new(),
                departed: vec![false; self.world_size],
            }),
            round_posted: Condvar::new(),
            timeout: self.timeout,
        });
        (0..self.world_size)
            .map(|rank| LocalCollective {
                rank,
                world_size: self.world_size,
                next_round: AtomicU64::new(0),
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One worker's endpoint on a [`LocalFabric`].
///
/// Dropping it marks the rank as departed; peers still waiting on a round
/// this rank never posted fail with [`CollectiveError::PeerDeparted`].
#[derive(Debug)]
pub struct LocalCollective {
    rank: usize,
    world_size: usize,
    next_round: AtomicU64,
    shared: Arc<Shared>,
}

impl LocalCollective {
    /// Number of rounds this worker has posted so far.
    pub fn rounds_posted(&self) -> u64 {
        self.next_round.load(Ordering::Relaxed)
    }

    /// Rounds the fabric still holds, across all ranks.
    pub fn open_rounds(&self) -> Result<usize, CollectiveError> {
        Ok(self.shared.lock()?.rounds.len())
    }

    fn exchange(&self, payload: Payload) -> Result<Vec<Payload>, CollectiveError> {
        let round = self.next_round.fetch_add(1, Ordering::Relaxed);
        trace!(
            rank = self.rank,
            round,
            kind = %payload.kind(),
            len = payload.len(),
            "posting collective round"
        );

        let mut state = self.shared.lock()?;
        state.rounds.entry(round).or_insert_with(|| Round::new(self.world_size)).slots
            [self.rank] = Some(payload);
        self.shared.round_posted.notify_all();

        let started = Instant::now();
        loop {
            let Some(pending) = state.rounds.get(&round) else {
                return Err(CollectiveError::Poisoned);
            };
            if pending.is_complete() {
                break;
            }
            let departed = pending.missing_ranks().find(|&rank| state.departed[rank]);
            if let Some(rank) = departed {
                state.leave(round);
                return Err(CollectiveError::PeerDeparted { round, rank });
            }
            state = match self.shared.timeout {
                None => {
                    self.shared.round_posted.wait(state).map_err(|_| CollectiveError::Poisoned)?
                }
                Some(timeout) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        state.leave(round);
                        return Err(CollectiveError::Timeout {
                            round,
                            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    self.shared
                        .round_posted
                        .wait_timeout(state, timeout - waited)
                        .map_err(|_| CollectiveError::Poisoned)?
                        .0
                }
            };
        }

        let Some(done) = state.rounds.get(&round) else {
            return Err(CollectiveError::Poisoned);
        };
        let gathered: Vec<Payload> = done.slots.iter().flatten().cloned().collect();
        state.leave(round);
        drop(state);

        validate_round(round, &gathered)?;
        trace!(rank = self.rank, round, "collective round complete");
        Ok(gathered)
    }
}

/// Every rank must have posted the same element type and length.
fn validate_round(round: u64, gathered: &[Payload]) -> Result<(), CollectiveError> {
    let Some(first) = gathered.first() else {
        return Ok(());
    };
    for (rank, payload) in gathered.iter().enumerate().skip(1) {
        if payload.kind() != first.kind() {
            return Err(CollectiveError::KindMismatch {
                round,
                rank,
                expected: first.kind(),
                actual: payload.kind(),
            });
        }
        if payload.len() != first.len() {
            return Err(CollectiveError::ShapeMismatch {
                round,
                rank,
                expected: first.len(),
                actual: payload.len(),
            });
        }
    }
    Ok(())
}

fn copy_blocks<'a, T: Copy + 'a>(
    recv_buf: &mut [T],
    block_len: usize,
    blocks: impl Iterator<Item = &'a [T]>,
) -> Result<(), CollectiveError> {
    if block_len == 0 {
        return Ok(());
    }
    for (dst, src) in recv_buf.chunks_mut(block_len).zip(blocks) {
        if dst.len() != src.len() {
            return Err(CollectiveError::LengthMismatch { expected: dst.len(), actual: src.len() });
        }
        dst.copy_from_slice(src);
    }
    Ok(())
}

impl CollectiveContext for LocalCollective {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_gather(&self, send_buf: &[f32], recv_buf: &mut [f32]) -> Result<(), CollectiveError> {
        check_recv_len(send_buf.len(), recv_buf.len(), self.world_size)?;
        let gathered = self.exchange(Payload::F32(send_buf.to_vec()))?;
        copy_blocks(recv_buf, send_buf.len(), gathered.iter().filter_map(Payload::as_f32))
    }

    fn all_gather_u64(
        &self,
        send_buf: &[u64],
        recv_buf: &mut [u64],
    ) -> Result<(), CollectiveError> {
        check_recv_len(send_buf.len(), recv_buf.len(), self.world_size)?;
        let gathered = self.exchange(Payload::U64(send_buf.to_vec()))?;
        copy_blocks(recv_buf, send_buf.len(), gathered.iter().filter_map(Payload::as_u64))
    }
}

impl Drop for LocalCollective {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.departed[self.rank] = true;
        self.shared.round_posted.notify_all();
    }
}

/// Run `worker` once per rank on scoped threads and collect the results in
/// rank order. A panicking worker re-panics on the caller's thread.
pub fn run_workers<T, E, F>(fabric: LocalFabric, worker: F) -> Vec<Result<T, E>>
where
    F: Fn(LocalCollective) -> Result<T, E> + Sync,
    T: Send,
    E: Send,
{
    let contexts = fabric.into_contexts();
    let worker = &worker;
    thread::scope(|scope| {
        let handles: Vec<_> =
            contexts.into_iter().map(|ctx| scope.spawn(move || worker(ctx))).collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}
