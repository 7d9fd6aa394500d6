//! Data-parallel helpers for kernels
//!
//! Kernels compute independent outputs (usually one row per task) on the rayon
//! pool and then scatter the results into the destination allocation.

use crate::error::Result;
use rayon::prelude::*;

/// Run `f` for every index in `0..n`, stopping at the first error
pub fn parallel_for<F>(n: usize, f: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Send + Sync,
{
    (0..n).into_par_iter().try_for_each(f)
}

/// Evaluate `f` for every index in `0..n`, preserving index order
pub fn parallel_map<T, F>(n: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Send + Sync,
{
    (0..n).into_par_iter().map(f).collect()
}

/// Evaluate `f` over a row-major `[outer, inner]` index space
///
/// The result holds `outer * inner` values, `inner` varying fastest.
pub fn parallel_nd<T, F>(dims: [usize; 2], f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize, usize) -> Result<T> + Send + Sync,
{
    let [outer, inner] = dims;
    if inner == 0 {
        return Ok(Vec::new());
    }
    parallel_map(outer * inner, |linear| f(linear / inner, linear % inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;

    #[test]
    fn map_preserves_order() {
        let out = parallel_map(100, |i| Ok(i * 2)).unwrap();
        assert_eq!(out, (0..100).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn nd_is_row_major() {
        let out = parallel_nd([3, 4], |r, c| Ok((r, c))).unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(out[0], (0, 0));
        assert_eq!(out[5], (1, 1));
        assert_eq!(out[11], (2, 3));
    }

    #[test]
    fn errors_propagate() {
        let result = parallel_for(64, |i| {
            if i == 17 {
                Err(BackendError::execution_error("row 17"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn empty_space_yields_nothing() {
        assert!(parallel_nd::<u8, _>([5, 0], |_, _| Ok(0)).unwrap().is_empty());
    }
}
