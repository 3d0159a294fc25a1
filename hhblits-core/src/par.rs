/// Parallel map: apply `$f` to each element of `$slice`, collecting into a Vec.
macro_rules! par_map {
    ($slice:expr, $f:expr) => {{
        #[cfg(feature = "parallel")]
        {
            use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
            $slice.par_iter().map($f).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            $slice.iter().map($f).collect()
        }
    }};
}

/// Parallel by-value map over an owned Vec, preserving order.
macro_rules! par_map_owned {
    ($vec:expr, $f:expr) => {{
        #[cfg(feature = "parallel")]
        {
            use rayon::iter::{IntoParallelIterator, ParallelIterator};
            $vec.into_par_iter().map($f).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            $vec.into_iter().map($f).collect()
        }
    }};
}

/// Fixed-size worker pool. Every `par_*` call made inside [`WorkerPool::install`]
/// runs on this pool's threads instead of rayon's global pool.
pub struct WorkerPool {
    threads: usize,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> crate::error::SearchResult<Self> {
        let threads = threads.max(1);
        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("hhblits-worker-{i}"))
                .build()
                .map_err(|e| crate::error::SearchError::Config {
                    msg: format!("cannot start {threads} worker threads: {e}"),
                })?;
            Ok(Self { threads, pool })
        }
        #[cfg(not(feature = "parallel"))]
        {
            Ok(Self { threads })
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        #[cfg(feature = "parallel")]
        {
            self.pool.install(f)
        }
        #[cfg(not(feature = "parallel"))]
        {
            f()
        }
    }
}
