//! The `doall` primitive and the per-thread accumulator banks JITed
//! reductions and maps dispatch work to.
//!
//! A single interpreter thread drives bytecode and JIT trace entry; it
//! only ever blocks at a `doall` barrier, and the barrier's own worker
//! threads never touch an environment or suspend -- they run one tile of
//! a fused loop body and return. This module owns the tiling and the
//! deterministic serial merge; the fixed-size worker pool underneath it
//! is intentionally the simplest thing that satisfies that contract
//! (`std::thread::scope`, joined every call), not a reusable scheduler.

use std::thread;

/// Stable identity a worker can use to index its own slot in a per-thread
/// accumulator bank. Assigned `0..worker_count`, never reused mid-call.
pub type ThreadIndex = usize;

/// One contiguous slice of `[start, end)` assigned to a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub start: usize,
    pub end: usize,
    pub thread_index: ThreadIndex,
}

impl Tile {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Split `[start, end)` into tiles sized between `tile_min` and
/// `tile_max`, in order, one per worker up to `worker_count`. Never
/// produces more tiles than `worker_count`: the last tile absorbs any
/// remainder past `worker_count * tile_max`, so a caller sizing `tile_max`
/// too small relative to the range simply gets fewer, larger tiles rather
/// than more workers than it asked for.
pub fn partition(start: usize, end: usize, tile_min: usize, tile_max: usize, worker_count: usize) -> Vec<Tile> {
    assert!(tile_min >= 1 && tile_min <= tile_max, "tile_min must be in 1..=tile_max");
    assert!(worker_count >= 1, "doall needs at least one worker");
    let total = end.saturating_sub(start);
    if total == 0 {
        return Vec::new();
    }

    let even_share = total.div_ceil(worker_count).max(tile_min);
    let tile_len = even_share.min(tile_max);

    let mut tiles = Vec::new();
    let mut cursor = start;
    let mut thread_index = 0;
    while cursor < end {
        let is_last_slot = thread_index + 1 == worker_count;
        let this_len = if is_last_slot { end - cursor } else { tile_len.min(end - cursor) };
        tiles.push(Tile {
            start: cursor,
            end: cursor + this_len,
            thread_index,
        });
        cursor += this_len;
        thread_index += 1;
        if thread_index >= worker_count {
            break;
        }
    }
    // If tiles ran out before the range did (worker_count * tile_len < total
    // and we weren't yet on the last slot), grow the final tile to cover it.
    if let Some(last) = tiles.last_mut() {
        if last.end < end {
            last.end = end;
        }
    }
    tiles
}

/// A private slot per worker thread, merged serially (in thread-index
/// order, for reproducibility) once every worker has returned.
pub struct AccumulatorBank<T> {
    slots: Vec<T>,
}

impl<T> AccumulatorBank<T> {
    pub fn new(worker_count: usize, identity: impl Fn() -> T) -> Self {
        AccumulatorBank {
            slots: (0..worker_count).map(|_| identity()).collect(),
        }
    }

    pub fn slot_mut(&mut self, thread_index: ThreadIndex) -> &mut T {
        &mut self.slots[thread_index]
    }

    /// Serial, thread-index-ordered fold over every slot. Associative up
    /// to floating-point rounding is the caller's job to guarantee;
    /// determinism of the combination *order* is this function's.
    pub fn merge(self, mut combine: impl FnMut(T, T) -> T) -> Option<T> {
        let mut iter = self.slots.into_iter();
        let first = iter.next()?;
        Some(iter.fold(first, &mut combine))
    }
}

/// Error raised by a worker during a `doall`, captured in a shared slot
/// and surfaced to the coordinator after the barrier rather than
/// unwinding across the thread boundary.
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub thread_index: ThreadIndex,
    pub message: String,
}

/// Run `body` once per tile of `[start, end)`, across up to
/// `worker_count` OS threads, and block until every tile has completed.
/// `body` receives the tile and must not touch any environment (the JIT
/// never emits one inside a `doall` body); the first error any worker
/// reports wins and is returned once every worker has finished, so a
/// worker that fails never leaves its peers' tiles half-run.
pub fn doall<F>(
    start: usize,
    end: usize,
    tile_min: usize,
    tile_max: usize,
    worker_count: usize,
    body: F,
) -> Result<(), WorkerError>
where
    F: Fn(Tile) -> Result<(), String> + Sync,
{
    let tiles = partition(start, end, tile_min, tile_max, worker_count);
    let error_slot: std::sync::Mutex<Option<WorkerError>> = std::sync::Mutex::new(None);

    thread::scope(|scope| {
        for tile in &tiles {
            let body = &body;
            let error_slot = &error_slot;
            scope.spawn(move || {
                if let Err(message) = body(*tile) {
                    let mut slot = error_slot.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(WorkerError {
                            thread_index: tile.thread_index,
                            message,
                        });
                    }
                }
            });
        }
    });

    match error_slot.into_inner().unwrap() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn partition_covers_the_whole_range_without_overlap() {
        let tiles = partition(0, 100, 4, 16, 4);
        assert_eq!(tiles.first().unwrap().start, 0);
        assert_eq!(tiles.last().unwrap().end, 100);
        for w in tiles.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }
    }

    #[test]
    fn partition_never_exceeds_worker_count() {
        let tiles = partition(0, 1_000_000, 1, 8, 4);
        assert!(tiles.len() <= 4);
    }

    #[test]
    fn partition_of_an_empty_range_is_empty() {
        assert!(partition(5, 5, 1, 8, 4).is_empty());
    }

    #[test]
    fn doall_visits_every_index_exactly_once() {
        let n = 257usize;
        let counts: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
        doall(0, n, 8, 32, 4, |tile| {
            for i in tile.start..tile.end {
                counts[i].fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
        .unwrap();
        assert!(counts.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn accumulator_bank_merges_in_thread_index_order() {
        let mut bank = AccumulatorBank::new(4, || 0i64);
        for i in 0..4 {
            *bank.slot_mut(i) = (i as i64) + 1;
        }
        let total = bank.merge(|a, b| a + b).unwrap();
        assert_eq!(total, 1 + 2 + 3 + 4);
    }

    #[test]
    fn doall_surfaces_a_worker_error_after_the_barrier() {
        let result = doall(0, 16, 1, 4, 4, |tile| {
            if tile.thread_index == 2 {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        });
        let err = result.unwrap_err();
        assert_eq!(err.thread_index, 2);
        assert_eq!(err.message, "boom");
    }
}
