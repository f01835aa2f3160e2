//! Collective operations for data-parallel training
//!
//! The training loops only see the [`Collective`] trait. [`SingleProcess`] is
//! the no-op, always-leader implementation; [`ThreadGroup`] runs N workers as
//! scoped threads in one process and synchronizes them with a blocking
//! exchange. Every collective is a barrier: no worker returns from it until
//! all workers have contributed.
//!
//! A worker that fails aborts the group. Every other worker then gets
//! [`CoreError::SyncFailure`] from its next (or current) collective, so no
//! worker keeps training on partial gradients.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use candle_core::Tensor;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Reduction applied by [`Collective::all_reduce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
}

/// Gradient-synchronization boundary shared by both trainers
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Rank 0 owns all persistence
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Combine `tensor` across all workers; every worker gets the result
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// Every worker gets `root`'s tensor
    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor>;

    /// Block until all workers arrive
    fn barrier(&self) -> Result<()>;

    /// Sum of a host scalar across workers
    fn all_reduce_f64(&self, value: f64) -> Result<f64> {
        let t = Tensor::new(&[value], &candle_core::Device::Cpu)?;
        let reduced: Vec<f64> = self.all_reduce(&t, ReduceOp::Sum)?.to_vec1()?;
        Ok(reduced[0])
    }
}

/// One worker, always leader
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn broadcast(&self, tensor: &Tensor, _root: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process thread group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    AllReduce(ReduceOp),
    Broadcast(usize),
    Barrier,
}

struct Exchange {
    generation: u64,
    arrived: usize,
    ops: Vec<Option<OpKind>>,
    slots: Vec<Option<Tensor>>,
    result: Option<Tensor>,
    aborted: Option<String>,
}

struct Shared {
    world_size: usize,
    timeout: Duration,
    state: Mutex<Exchange>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Exchange> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn abort(&self, reason: String) {
        let mut state = self.lock();
        if state.aborted.is_none() {
            state.aborted = Some(reason);
        }
        drop(state);
        self.cond.notify_all();
    }
}

/// Factory for an in-process group of data-parallel workers
pub struct ThreadGroup {
    world_size: usize,
    timeout: Duration,
}

impl ThreadGroup {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size: world_size.max(1),
            timeout: Duration::from_secs(600),
        }
    }

    /// Longest time a worker waits at a collective before failing the run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Run `f` once per rank on its own thread and collect results by rank.
    ///
    /// If any worker fails the whole run fails. The returned error is the
    /// first worker's own failure, preferred over the `SyncFailure`s it caused
    /// in the others.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&ThreadWorker) -> Result<T> + Sync,
    {
        let shared = Arc::new(Shared {
            world_size: self.world_size,
            timeout: self.timeout,
            state: Mutex::new(Exchange {
                generation: 0,
                arrived: 0,
                ops: vec![None; self.world_size],
                slots: vec![None; self.world_size],
                result: None,
                aborted: None,
            }),
            cond: Condvar::new(),
        });

        let outcomes: Vec<Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.world_size)
                .map(|rank| {
                    let worker = ThreadWorker {
                        rank,
                        shared: Arc::clone(&shared),
                    };
                    let f = &f;
                    scope.spawn(move || {
                        let _guard = AbortOnPanic(&worker);
                        let outcome = f(&worker);
                        if let Err(e) = &outcome {
                            worker.abort(format!("worker {rank} failed: {e}"));
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, h)| {
                    h.join().unwrap_or_else(|_| {
                        Err(CoreError::sync(format!("worker {rank} panicked")).into())
                    })
                })
                .collect()
        });

        let mut results = Vec::with_capacity(outcomes.len());
        let mut first_sync: Option<anyhow::Error> = None;
        for outcome in outcomes {
            match outcome {
                Ok(v) => results.push(v),
                Err(e) if matches!(e.downcast_ref::<CoreError>(), Some(CoreError::SyncFailure { .. })) => {
                    first_sync.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match first_sync {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

struct AbortOnPanic<'a>(&'a ThreadWorker);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort(format!("worker {} panicked", self.0.rank));
        }
    }
}

/// One rank's handle into a [`ThreadGroup`]
pub struct ThreadWorker {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadWorker {
    /// Mark the group as failed and wake every waiting worker
    pub fn abort(&self, reason: String) {
        warn!("Aborting worker group: {}", reason);
        self.shared.abort(reason);
    }

    /// Deposit this rank's contribution; the last arrival combines them.
    fn exchange(&self, op: OpKind, tensor: Option<&Tensor>) -> Result<Option<Tensor>> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if let Some(reason) = &state.aborted {
            return Err(CoreError::sync(reason.clone()).into());
        }

        let generation = state.generation;
        state.ops[self.rank] = Some(op);
        state.slots[self.rank] = tensor.cloned();
        state.arrived += 1;

        if state.arrived == shared.world_size {
            let combined = combine(&state.ops, &state.slots);
            state.arrived = 0;
            state.ops.iter_mut().for_each(|o| *o = None);
            state.slots.iter_mut().for_each(|s| *s = None);
            match combined {
                Ok(result) => {
                    state.result = result.clone();
                    state.generation += 1;
                    drop(state);
                    shared.cond.notify_all();
                    debug!("rank {} completed collective {:?}", self.rank, op);
                    Ok(result)
                }
                Err(e) => {
                    let reason = e.to_string();
                    if state.aborted.is_none() {
                        state.aborted = Some(reason.clone());
                    }
                    drop(state);
                    shared.cond.notify_all();
                    Err(CoreError::sync(reason).into())
                }
            }
        } else {
            let (state, timeout) = shared
                .cond
                .wait_timeout_while(state, shared.timeout, |s| {
                    s.generation == generation && s.aborted.is_none()
                })
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.generation != generation {
                return Ok(state.result.clone());
            }
            if let Some(reason) = &state.aborted {
                return Err(CoreError::sync(reason.clone()).into());
            }
            drop(state);
            if timeout.timed_out() {
                let reason = format!(
                    "rank {} timed out after {:?} waiting for peers",
                    self.rank, shared.timeout
                );
                shared.abort(reason.clone());
                return Err(CoreError::sync(reason).into());
            }
            Err(CoreError::sync("spurious wakeup without progress").into())
        }
    }
}

fn combine(ops: &[Option<OpKind>], slots: &[Option<Tensor>]) -> Result<Option<Tensor>> {
    let op = ops[0].ok_or_else(|| CoreError::sync("rank 0 missing from collective"))?;
    if let Some(rank) = ops.iter().position(|o| *o != Some(op)) {
        return Err(CoreError::sync(format!(
            "collective mismatch: rank 0 called {op:?}, rank {rank} called {:?}",
            ops[rank]
        ))
        .into());
    }

    let tensors = || -> Result<Vec<&Tensor>> {
        slots
            .iter()
            .enumerate()
            .map(|(rank, s)| {
                s.as_ref()
                    .ok_or_else(|| CoreError::sync(format!("rank {rank} sent no tensor")).into())
            })
            .collect()
    };

    match op {
        OpKind::Barrier => Ok(None),
        OpKind::Broadcast(root) => {
            let t = tensors()?;
            let src = t
                .get(root)
                .ok_or_else(|| CoreError::sync(format!("broadcast root {root} out of range")))?;
            Ok(Some((*src).clone()))
        }
        OpKind::AllReduce(ReduceOp::Sum) => {
            let t = tensors()?;
            let mut acc = t[0].clone();
            for other in &t[1..] {
                if other.dims() != acc.dims() {
                    return Err(CoreError::sync(format!(
                        "all_reduce shape mismatch: {:?} vs {:?}",
                        acc.dims(),
                        other.dims()
                    ))
                    .into());
                }
                acc = (acc + *other)?;
            }
            Ok(Some(acc))
        }
    }
}

impl Collective for ThreadWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        self.exchange(OpKind::AllReduce(op), Some(&tensor.detach()))?
            .ok_or_else(|| CoreError::sync("all_reduce produced no tensor").into())
    }

    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        self.exchange(OpKind::Broadcast(root), Some(&tensor.detach()))?
            .ok_or_else(|| CoreError::sync("broadcast produced no tensor").into())
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(OpKind::Barrier, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_single_process_is_identity() {
        let c = SingleProcess;
        assert!(c.is_leader());
        let t = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let r: Vec<f32> = c.all_reduce(&t, ReduceOp::Sum).unwrap().to_vec1().unwrap();
        assert_eq!(r, vec![1.0, 2.0]);
        assert!(c.barrier().is_ok());
    }

    #[test]
    fn test_thread_group_all_reduce() {
        let group = ThreadGroup::new(3);
        let results = group
            .run(|w| {
                let t = Tensor::new(&[w.rank() as f32, 1.0], &Device::Cpu)?;
                let sum: Vec<f32> = w.all_reduce(&t, ReduceOp::Sum)?.to_vec1()?;
                let total = w.all_reduce_f64(1.5)?;
                w.barrier()?;
                Ok((w.is_leader(), sum, total))
            })
            .unwrap();

        assert_eq!(results.len(), 3);
        for (rank, (leader, sum, total)) in results.into_iter().enumerate() {
            assert_eq!(leader, rank == 0);
            assert_eq!(sum, vec![3.0, 3.0]);
            assert!((total - 4.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_thread_group_broadcast() {
        let results = ThreadGroup::new(2)
            .run(|w| {
                let t = Tensor::new(&[w.rank() as f32 + 10.0], &Device::Cpu)?;
                let b: Vec<f32> = w.broadcast(&t, 0)?.to_vec1()?;
                Ok(b[0])
            })
            .unwrap();
        assert_eq!(results, vec![10.0, 10.0]);
    }

    #[test]
    fn test_failed_worker_fails_the_run() {
        let err = ThreadGroup::new(2)
            .with_timeout(Duration::from_secs(30))
            .run(|w| {
                if w.rank() == 1 {
                    anyhow::bail!("disk on fire");
                }
                let t = Tensor::new(&[1f32], &Device::Cpu)?;
                w.all_reduce(&t, ReduceOp::Sum)?;
                Ok(())
            })
            .unwrap_err();
        // The root cause wins over the induced SyncFailure
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_survivor_sees_sync_failure() {
        let outcomes = std::sync::Mutex::new(Vec::new());
        let _ = ThreadGroup::new(2).run(|w| {
            let r = if w.rank() == 1 {
                Err(anyhow::anyhow!("crash"))
            } else {
                let t = Tensor::new(&[1f32], &Device::Cpu)?;
                w.all_reduce(&t, ReduceOp::Sum).map(|_| ())
            };
            if w.rank() == 0 {
                let is_sync = matches!(
                    r.as_ref().err().and_then(|e| e.downcast_ref::<CoreError>()),
                    Some(CoreError::SyncFailure { .. })
                );
                outcomes.lock().unwrap().push(is_sync);
            }
            r
        });
        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_absent_peer_times_out() {
        let timeout = Duration::from_millis(200);
        let err = ThreadGroup::new(2)
            .with_timeout(timeout)
            .run(|w| {
                if w.rank() == 1 {
                    // Outlives the timeout without ever reaching the barrier
                    std::thread::sleep(timeout * 5);
                    return Ok(());
                }
                w.barrier()
            })
            .unwrap_err();
        match err.downcast_ref::<CoreError>() {
            Some(CoreError::SyncFailure { reason }) => assert!(reason.contains("timed out")),
            other => panic!("expected SyncFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_collectives() {
        let err = ThreadGroup::new(2)
            .run(|w| {
                if w.rank() == 0 {
                    w.barrier()
                } else {
                    let t = Tensor::new(&[1f32], &Device::Cpu)?;
                    w.all_reduce(&t, ReduceOp::Sum).map(|_| ())
                }
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::SyncFailure { .. })
        ));
    }
}
