/// The collective operations a search needs when its work is split over
/// several workers. Every worker runs the same search on its own share of
/// the data.
pub trait ParallelContext {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// First element of this worker's share of `elements` items.
    fn begin(&self, elements: usize) -> usize {
        elements * self.rank() / self.size()
    }

    /// One past the last element of this worker's share of `elements` items.
    fn end(&self, elements: usize) -> usize {
        elements * (self.rank() + 1) / self.size()
    }

    /// Sum of `value` over all workers.
    fn sum_u64(&self, value: u64) -> u64;

    /// The local values of all workers, concatenated in worker order.
    fn concatenate_doubles(&self, local: &[f64]) -> Vec<f64>;
}

/// A single worker owning all the data.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialContext;

impl ParallelContext for SequentialContext {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sum_u64(&self, value: u64) -> u64 {
        value
    }

    fn concatenate_doubles(&self, local: &[f64]) -> Vec<f64> {
        local.to_vec()
    }
}
