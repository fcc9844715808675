// ============================================================================
// Superpatch scheduler — dependency-respecting wavefront over spatial tiles
// ============================================================================
//
// One refinement pass has a sequential data dependency: a pixel's
// propagation reads neighbors already updated earlier in the same pass.  To
// parallelize without breaking it, the target is cut into square tiles and
// processed as a diagonal wavefront: a tile runs only after its
// scan-predecessor tiles (left and top in direct order) are done.  Within a
// tile the unmodified sequential algorithm runs; parallelism exists at tile
// granularity only.
//
// Workers coordinate through a blocking queue.  Finishing the terminal tile
// pushes an explicit `Shutdown` job which is never popped, so every worker
// observes it and exits.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::field::Lcg;
use crate::geometry::Rect;
use crate::nnf::NnfEngine;
use crate::pixel::PixelOps;

/// One scheduling tile: a rectangle of target pixels plus 4-neighbor
/// adjacency.  Tiles never overlap and jointly cover the target.
#[derive(Clone, Debug)]
pub struct SuperPatch {
    pub rect: Rect,
    pub left: Option<usize>,
    pub top: Option<usize>,
    pub right: Option<usize>,
    pub bottom: Option<usize>,
}

/// Static tile layout for one target size; rebuilt only when the image
/// dimensions change.  Per-pass `enqueued`/`processed` flags live in the
/// scheduler, reset every iteration.
#[derive(Clone, Debug)]
pub struct SuperPatchGrid {
    tiles: Vec<SuperPatch>,
    cols: usize,
    rows: usize,
}

impl SuperPatchGrid {
    pub fn new(width: i32, height: i32, tile_size: i32) -> Self {
        debug_assert!(tile_size > 0);
        let cols = ((width + tile_size - 1) / tile_size).max(1) as usize;
        let rows = ((height + tile_size - 1) / tile_size).max(1) as usize;
        let mut tiles = Vec::with_capacity(cols * rows);
        for ty in 0..rows {
            for tx in 0..cols {
                let left = tx as i32 * tile_size;
                let top = ty as i32 * tile_size;
                tiles.push(SuperPatch {
                    rect: Rect::new(
                        left,
                        top,
                        (left + tile_size).min(width),
                        (top + tile_size).min(height),
                    ),
                    left: (tx > 0).then(|| ty * cols + tx - 1),
                    top: (ty > 0).then(|| (ty - 1) * cols + tx),
                    right: (tx + 1 < cols).then(|| ty * cols + tx + 1),
                    bottom: (ty + 1 < rows).then(|| (ty + 1) * cols + tx),
                });
            }
        }
        SuperPatchGrid { tiles, cols, rows }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tile(&self, idx: usize) -> &SuperPatch {
        &self.tiles[idx]
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// First tile of a pass: top-left in direct order, bottom-right in
    /// reverse.  It is the only tile with no unmet dependency.
    pub fn seed_tile(&self, direct: bool) -> usize {
        if direct { 0 } else { self.tiles.len() - 1 }
    }
}

// ============================================================================
// Blocking work queue
// ============================================================================

/// Work item carried by the tile queue.  An explicit variant instead of a
/// null sentinel marks the end of the pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Job {
    Tile(usize),
    Shutdown,
}

/// Producer/consumer queue of tile jobs.  `pop` blocks while empty; a
/// `Shutdown` at the head is returned but never removed, so it reaches every
/// consumer.
pub struct TileQueue {
    jobs: Mutex<VecDeque<Job>>,
    ready: Condvar,
}

impl TileQueue {
    pub fn new() -> Self {
        TileQueue {
            jobs: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, job: Job) {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.push_back(job);
        drop(jobs);
        match job {
            // Every blocked worker must see the end-of-pass marker.
            Job::Shutdown => self.ready.notify_all(),
            Job::Tile(_) => self.ready.notify_one(),
        }
    }

    pub fn pop(&self) -> Job {
        let mut jobs = self.jobs.lock().unwrap();
        loop {
            match jobs.front() {
                Some(Job::Shutdown) => return Job::Shutdown,
                Some(Job::Tile(_)) => {
                    let job = jobs.pop_front().unwrap();
                    return job;
                }
                None => {
                    jobs = self.ready.wait(jobs).unwrap();
                }
            }
        }
    }
}

impl Default for TileQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Default)]
struct TileFlags {
    enqueued: bool,
    processed: bool,
}

// ============================================================================
// Wavefront pass
// ============================================================================

/// Run one full-image refinement pass of `engine` across `threads` workers.
///
/// Scan order alternates with the engine's iteration counter exactly as in
/// the single-threaded pass.  Each tile draws from its own PRNG seeded by
/// (engine seed, iteration, tile index), so the result is reproducible for a
/// fixed tile grid regardless of worker count — though it differs from the
/// sequence a single-threaded `iteration()` draws.
pub(crate) fn iterate_wavefront<P: PixelOps>(engine: &mut NnfEngine<P>, threads: usize) {
    let iteration = engine.advance_iteration();
    let direct = iteration % 2 == 1;
    let base_seed = engine.params().seed;
    let workers = threads.max(1);

    let (grid, ctx) = engine.wavefront_parts();
    let queue = TileQueue::new();
    let flags = Mutex::new(vec![TileFlags::default(); grid.len()]);

    {
        let seed = grid.seed_tile(direct);
        flags.lock().unwrap()[seed].enqueued = true;
        queue.push(Job::Tile(seed));
    }

    rayon::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|_| {
                loop {
                    let idx = match queue.pop() {
                        Job::Shutdown => break,
                        Job::Tile(idx) => idx,
                    };
                    let tile = grid.tile(idx);
                    let mut rng = Lcg::new(tile_seed(base_seed, iteration, idx));
                    // Tile interiors are disjoint and the halo this scan
                    // reads belongs to already-processed predecessors: the
                    // aliasing contract of ScanCtx holds.
                    unsafe {
                        ctx.scan_rect(
                            tile.rect.left,
                            tile.rect.top,
                            tile.rect.right,
                            tile.rect.bottom,
                            direct,
                            &mut rng,
                        );
                    }
                    finish_tile(grid, &flags, &queue, idx, direct);
                }
            });
        }
    });
}

fn tile_seed(base: u64, iteration: u32, tile: usize) -> u64 {
    base.wrapping_add((iteration as u64) << 40)
        .wrapping_add((tile as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Mark a tile processed and, under the lock, hand its now-ready successors
/// to the queue.  The terminal tile pushes the shutdown marker instead.
fn finish_tile(
    grid: &SuperPatchGrid,
    flags: &Mutex<Vec<TileFlags>>,
    queue: &TileQueue,
    idx: usize,
    direct: bool,
) {
    let tile = grid.tile(idx);
    let (succ_a, succ_b) = if direct {
        (tile.right, tile.bottom)
    } else {
        (tile.left, tile.top)
    };

    let mut flags = flags.lock().unwrap();
    flags[idx].processed = true;

    if succ_a.is_none() && succ_b.is_none() {
        drop(flags);
        queue.push(Job::Shutdown);
        return;
    }

    for succ in [succ_a, succ_b].into_iter().flatten() {
        // The successor's other predecessor: a right neighbor still waits on
        // its top tile, a bottom neighbor on its left tile (mirrored for
        // reverse order).
        let other = if direct {
            if Some(succ) == tile.right {
                grid.tile(succ).top
            } else {
                grid.tile(succ).left
            }
        } else if Some(succ) == tile.left {
            grid.tile(succ).bottom
        } else {
            grid.tile(succ).right
        };
        let ready = other.map_or(true, |o| flags[o].processed);
        if ready && !flags[succ].enqueued {
            flags[succ].enqueued = true;
            queue.push(Job::Tile(succ));
        }
    }
}
