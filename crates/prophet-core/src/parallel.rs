//! Recursive fork/join bisection helpers.
//!
//! Every parallel site in the crate (forward, backward, input normalization,
//! layer init, weight update, per-sample batch work) goes through these two
//! helpers instead of open-coding the split/merge logic. Work runs on the
//! global rayon pool, which is initialized once per process and shared by
//! all networks.

use std::ops::Range;

/// Run `f` over disjoint chunks of `out`, splitting at the midpoint until
/// chunks are at most `grain` elements long.
///
/// `f(base, chunk)` receives the absolute start index of its chunk. Slices
/// no longer than `threshold` are processed on the calling thread without
/// touching the pool. Because every chunk owns a disjoint index range, the
/// per-element floating-point evaluation order is identical to the
/// sequential path and results are bit-exact either way.
pub fn parallel_chunks<T, F>(out: &mut [T], threshold: usize, grain: usize, f: &F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync,
{
    if out.len() <= threshold {
        f(0, out);
    } else {
        bisect_chunks(out, 0, grain.max(1), f);
    }
}

fn bisect_chunks<T, F>(out: &mut [T], base: usize, grain: usize, f: &F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync,
{
    if out.len() <= grain {
        f(base, out);
        return;
    }
    let mid = out.len() / 2;
    let (lo, hi) = out.split_at_mut(mid);
    rayon::join(
        || bisect_chunks(lo, base, grain, f),
        || bisect_chunks(hi, base + mid, grain, f),
    );
}

/// Fold an index range into task-local accumulators, merging pairwise at
/// each join.
///
/// Ranges no longer than `threshold` fold sequentially into a single
/// accumulator on the calling thread. Otherwise the range is bisected until
/// pieces are at most `grain` long; each leaf gets a fresh accumulator from
/// `make`, folds its indices with `fold`, and the two halves of every split
/// are combined with `merge`. No accumulator is ever visible to two tasks,
/// so `fold` needs no synchronization.
pub fn parallel_fold<A, M, F, J>(
    range: Range<usize>,
    threshold: usize,
    grain: usize,
    make: &M,
    fold: &F,
    merge: &J,
) -> A
where
    A: Send,
    M: Fn() -> A + Sync,
    F: Fn(&mut A, usize) + Sync,
    J: Fn(A, A) -> A + Sync,
{
    if range.len() <= threshold {
        let mut acc = make();
        for i in range {
            fold(&mut acc, i);
        }
        return acc;
    }
    bisect_fold(range, grain.max(1), make, fold, merge)
}

fn bisect_fold<A, M, F, J>(range: Range<usize>, grain: usize, make: &M, fold: &F, merge: &J) -> A
where
    A: Send,
    M: Fn() -> A + Sync,
    F: Fn(&mut A, usize) + Sync,
    J: Fn(A, A) -> A + Sync,
{
    if range.len() <= grain {
        let mut acc = make();
        for i in range {
            fold(&mut acc, i);
        }
        return acc;
    }
    let mid = range.start + range.len() / 2;
    let (lo, hi) = rayon::join(
        || bisect_fold(range.start..mid, grain, make, fold, merge),
        || bisect_fold(mid..range.end, grain, make, fold, merge),
    );
    merge(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_every_index_once() {
        let mut out = vec![0u32; 1000];
        parallel_chunks(&mut out, 16, 8, &|base, chunk| {
            for (i, v) in chunk.iter_mut().enumerate() {
                *v += (base + i) as u32;
            }
        });
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i as u32);
        }
    }

    #[test]
    fn chunks_sequential_below_threshold() {
        // A threshold larger than the slice must keep everything on the
        // calling thread as one chunk.
        let mut out = vec![0u8; 64];
        let mut calls = std::sync::atomic::AtomicUsize::new(0);
        parallel_chunks(&mut out, 64, 8, &|_base, _chunk| {
            calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        });
        assert_eq!(*calls.get_mut(), 1);
    }

    #[test]
    fn fold_matches_sequential_sum() {
        let seq: u64 = (0..10_000u64).sum();
        let par = parallel_fold(
            0..10_000,
            128,
            64,
            &|| 0u64,
            &|acc, i| *acc += i as u64,
            &|a, b| a + b,
        );
        assert_eq!(par, seq);
    }

    #[test]
    fn fold_empty_range() {
        let acc = parallel_fold(0..0, 4, 2, &|| 7i32, &|_, _| unreachable!(), &|a, b| a + b);
        assert_eq!(acc, 7);
    }
}
