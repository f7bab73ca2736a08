use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Scatter/gather execution over independent work items.
///
/// With one worker every task runs sequentially on the calling thread; with
/// more, tasks are spread over a dedicated rayon pool. Either way results come
/// back in task order, so output is identical regardless of worker count.
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Result<Self> {
        let pool = if num_workers > 1 {
            let p = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .build()
                .map_err(|e| Error::WorkerComm(e.to_string()))?;
            Some(p)
        } else {
            None
        };
        Ok(Self { pool })
    }

    pub fn num_workers(&self) -> usize {
        self.pool.as_ref().map_or(1, |p| p.current_num_threads())
    }

    /// Apply `f` to every item and gather the results in input order. A panic
    /// inside a task is reported as a worker failure rather than tearing down
    /// the process.
    pub fn map_gather<I, O, F>(&self, items: Vec<I>, f: F) -> Vec<Result<O>>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> Result<O> + Sync + Send,
    {
        let run = |item: I| -> Result<O> {
            catch_unwind(AssertUnwindSafe(|| f(item)))
                .unwrap_or_else(|_| Err(Error::WorkerComm("task panicked".into())))
        };
        match &self.pool {
            Some(pool) => pool.install(|| items.into_par_iter().map(run).collect()),
            None => items.into_iter().map(run).collect(),
        }
    }
}

/// Split `0..n` into `chunks` contiguous ranges whose sizes differ by at most
/// one. Used to scatter row blocks of a correlation matrix over workers.
pub fn scatter_ranges(n: usize, chunks: usize) -> Vec<std::ops::Range<usize>> {
    let chunks = chunks.max(1);
    (0..chunks)
        .map(|c| (c * n / chunks)..((c + 1) * n / chunks))
        .filter(|r| !r.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_and_parallel_gather_identically() {
        let work: Vec<u64> = (0..200).collect();
        let square = |x: u64| -> Result<u64> { Ok(x * x) };
        let seq = WorkerPool::new(1).unwrap();
        let par = WorkerPool::new(4).unwrap();
        let a: Vec<u64> = seq
            .map_gather(work.clone(), square)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        let b: Vec<u64> = par
            .map_gather(work, square)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(a, b);
        assert_eq!(a[13], 169);
    }

    #[test]
    fn task_panic_surfaces_as_worker_error() {
        let pool = WorkerPool::new(2).unwrap();
        let results = pool.map_gather(vec![1u32, 2, 3], |x| {
            if x == 2 {
                panic!("boom");
            }
            Ok(x)
        });
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::WorkerComm(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn scatter_covers_without_gaps() {
        let ranges = scatter_ranges(17, 5);
        let mut next = 0;
        for r in &ranges {
            assert_eq!(r.start, next);
            next = r.end;
        }
        assert_eq!(next, 17);
        assert!(ranges.iter().all(|r| r.len() >= 3));
        assert!(scatter_ranges(3, 8).len() == 3);
    }
}
