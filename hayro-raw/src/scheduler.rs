//! Running independent decode units on a worker pool.
//!
//! A unit is a band of rows, a tile or a plane. Each unit owns a disjoint part of the output,
//! so units never share pixel data. Errors of single units are collected into the error list
//! of the image; the decode only fails if every unit fails.

use core::ops::Range;
use std::sync::{Mutex, PoisonError};

use rayon::prelude::*;

use crate::error::{DecodingError, Result};
use crate::image::{Array2dMut, RawImage};
use crate::log::{ldebug, ltrace, lwarn};

/// The life cycle of a decode unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Idle,
    Dispatched,
    Running,
    Completed,
    Failed,
    Joined,
}

/// Split `0..total` into `pieces` contiguous ranges.
///
/// The first `total % pieces` ranges are one element larger than the rest. Empty ranges are
/// never produced, so fewer than `pieces` ranges are returned if `total < pieces`.
pub fn split_evenly(total: usize, pieces: usize) -> Vec<Range<usize>> {
    let pieces = pieces.clamp(1, total.max(1));

    if total == 0 {
        return Vec::new();
    }

    let base = total / pieces;
    let extra = total % pieces;
    let mut start = 0;

    (0..pieces)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;

            range
        })
        .collect()
}

/// The number of workers for `threads`, where 0 means all available cores.
pub fn effective_threads(threads: usize) -> usize {
    if threads != 0 {
        return threads;
    }

    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn run_units<U, R, F>(units: Vec<U>, threads: usize, f: F) -> Result<Vec<Result<R>>>
where
    U: Send,
    R: Send,
    F: Fn(usize, U) -> Result<R> + Sync,
{
    let count = units.len();
    let workers = effective_threads(threads).min(count).max(1);

    ldebug!("dispatching {} units to {} workers", count, workers);

    let work = |(index, unit): (usize, U)| {
        ltrace!("unit {}: {:?}", index, TaskState::Running);
        let result = f(index, unit);

        let state = if result.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        ltrace!("unit {}: {:?}", index, state);

        result
    };

    for index in 0..count {
        ltrace!("unit {}: {:?}", index, TaskState::Idle);
    }

    let results: Vec<Result<R>> = if workers == 1 {
        units.into_iter().enumerate().map(work).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|_| DecodingError::ThreadPool)?;

        for index in 0..count {
            ltrace!("unit {}: {:?}", index, TaskState::Dispatched);
        }

        pool.install(|| units.into_par_iter().enumerate().map(work).collect())
    };

    ltrace!("all units: {:?}", TaskState::Joined);

    Ok(results)
}

/// Keep successful results with their unit index, recording failures in `errors`.
///
/// Fails if nothing succeeded.
fn settle<R>(results: Vec<Result<R>>, errors: &Mutex<Vec<String>>) -> Result<Vec<(usize, R)>> {
    if !results.is_empty() && results.iter().all(Result::is_err) {
        let first = results.into_iter().find_map(Result::err);

        return Err(first.unwrap_or(DecodingError::Corrupt("no unit succeeded").into()));
    }

    let mut out = Vec::with_capacity(results.len());
    let mut log = errors.lock().unwrap_or_else(PoisonError::into_inner);

    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(r) => out.push((index, r)),
            Err(e) => {
                let e = e.normalize();
                lwarn!("unit {} failed: {}", index, e);
                log.push(format!("unit {index}: {e}"));
            }
        }
    }

    Ok(out)
}

/// Run `f` on every unit using up to `threads` workers.
///
/// Errors are appended to `errors`. If every unit fails, the first error is returned and
/// nothing is recorded.
pub fn decode_in_parallel<U, F>(
    units: Vec<U>,
    threads: usize,
    errors: &Mutex<Vec<String>>,
    f: F,
) -> Result<()>
where
    U: Send,
    F: Fn(usize, U) -> Result<()> + Sync,
{
    map_in_parallel(units, threads, errors, f)?;

    Ok(())
}

/// Run `f` on every unit and return the successful results with their unit index.
///
/// Failures are handled as in [`decode_in_parallel`].
pub fn map_in_parallel<U, R, F>(
    units: Vec<U>,
    threads: usize,
    errors: &Mutex<Vec<String>>,
    f: F,
) -> Result<Vec<(usize, R)>>
where
    U: Send,
    R: Send,
    F: Fn(usize, U) -> Result<R> + Sync,
{
    let results = run_units(units, threads, f)?;

    settle(results, errors)
}

/// Split `view` into one band of rows per worker and decode the bands in parallel.
///
/// `f` receives the absolute row range and a view of exactly those rows.
pub fn decode_rows<T, F>(
    view: Array2dMut<'_, T>,
    threads: usize,
    errors: &Mutex<Vec<String>>,
    f: F,
) -> Result<()>
where
    T: Send,
    F: Fn(Range<usize>, &mut Array2dMut<'_, T>) -> Result<()> + Sync,
{
    let ranges = split_evenly(view.height(), effective_threads(threads));
    decode_row_bands(view, &ranges, threads, errors, f)
}

/// Decode fixed bands of rows in parallel. `ranges` must be sorted and disjoint.
pub fn decode_row_bands<T, F>(
    view: Array2dMut<'_, T>,
    ranges: &[Range<usize>],
    threads: usize,
    errors: &Mutex<Vec<String>>,
    f: F,
) -> Result<()>
where
    T: Send,
    F: Fn(Range<usize>, &mut Array2dMut<'_, T>) -> Result<()> + Sync,
{
    let bands = view.into_row_bands(ranges);
    let units: Vec<_> = ranges.iter().cloned().zip(bands).collect();

    decode_in_parallel(units, threads, errors, |_, (range, mut band)| {
        f(range, &mut band)
    })
}

/// Run `f` with a fresh error list and move the collected errors to `image` afterwards.
///
/// This lets units report errors while `f` holds a mutable view of the pixels.
pub fn collect_errors<R>(
    image: &mut RawImage,
    f: impl FnOnce(&mut RawImage, &Mutex<Vec<String>>) -> Result<R>,
) -> Result<R> {
    let errors = Mutex::new(Vec::new());
    let result = f(image, &errors);

    for error in errors.into_inner().unwrap_or_else(PoisonError::into_inner) {
        image.set_error(error);
    }

    result
}

/// A decoded tile waiting to be copied into the image.
#[derive(Debug, Clone)]
pub struct DecodedTile<T> {
    /// The first column in the target, in samples.
    pub x: usize,
    /// The first row in the target.
    pub y: usize,
    /// The width in samples.
    pub width: usize,
    /// The samples, `width` per row.
    pub data: Vec<T>,
}

impl<T> DecodedTile<T> {
    /// The number of complete rows.
    pub fn height(&self) -> usize {
        self.data.len().checked_div(self.width).unwrap_or(0)
    }
}

/// Decode tiles in parallel into private buffers, then copy them into `target` in order.
///
/// Tiles that extend past the target are clipped.
pub fn decode_tiles<T, U, F>(
    target: &mut Array2dMut<'_, T>,
    tiles: Vec<U>,
    threads: usize,
    errors: &Mutex<Vec<String>>,
    f: F,
) -> Result<()>
where
    T: Copy + Send,
    U: Send,
    F: Fn(usize, U) -> Result<DecodedTile<T>> + Sync,
{
    for (_, tile) in map_in_parallel(tiles, threads, errors, f)? {
        blit(target, &tile);
    }

    Ok(())
}

/// Copy a tile into `target`, clipped to its bounds.
pub fn blit<T: Copy>(target: &mut Array2dMut<'_, T>, tile: &DecodedTile<T>) {
    if tile.x >= target.width() || tile.width == 0 {
        return;
    }

    let cols = tile.width.min(target.width() - tile.x);

    for (r, src) in tile.data.chunks_exact(tile.width).enumerate() {
        let row = tile.y + r;

        if row >= target.height() {
            break;
        }

        target.row_mut(row)[tile.x..tile.x + cols].copy_from_slice(&src[..cols]);
    }
}
