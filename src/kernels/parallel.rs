/// Sequential vs. work-partitioned execution.
///
/// One policy makes the call for every kernel: deterministic mode forces
/// sequential, small outer dimensions stay sequential, and everything else
/// is split into contiguous chunks with static assignment. No stealing, so
/// a given (input, thread-count) pair always partitions the same way.

/// Outer dimensions below this are not worth fanning out.
pub const PARALLELIZATION_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct ParallelPolicy {
    /// Force sequential execution for bit-stable runs.
    pub deterministic: bool,
    /// Minimum outer dimension before partitioning kicks in.
    pub threshold: usize,
    /// Upper bound on worker threads.
    pub max_degree: usize,
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        Self {
            deterministic: false,
            threshold: PARALLELIZATION_THRESHOLD,
            max_degree: num_cpus::get(),
        }
    }
}

impl ParallelPolicy {
    pub fn sequential() -> Self {
        Self {
            deterministic: true,
            ..Self::default()
        }
    }

    /// Worker count for an outer dimension of `outer`.
    pub(crate) fn degree(&self, outer: usize) -> usize {
        if self.deterministic || outer < self.threshold {
            return 1;
        }
        self.max_degree.clamp(1, outer)
    }
}

/// Split a mutable slice into `outer` equal rows and run `work` on each,
/// partitioned per the policy. Used for row-wise kernels (norms, RoPE).
pub fn for_each_row<F>(policy: &ParallelPolicy, data: &mut [f32], outer: usize, work: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if outer == 0 {
        return;
    }
    let row_len = data.len() / outer;
    let degree = if policy.deterministic || outer < policy.threshold {
        1
    } else {
        policy.max_degree.clamp(1, outer)
    };

    if degree <= 1 {
        for (i, row) in data.chunks_mut(row_len).enumerate() {
            work(i, row);
        }
        return;
    }

    let rows_per_chunk = outer.div_ceil(degree);
    rayon::scope(|scope| {
        for (c, chunk) in data.chunks_mut(rows_per_chunk * row_len).enumerate() {
            let work = &work;
            scope.spawn(move |_| {
                for (i, row) in chunk.chunks_mut(row_len).enumerate() {
                    work(c * rows_per_chunk + i, row);
                }
            });
        }
    });
}
