//! Load balancer over the fixed pool of `lb-<i>` slots
//!
//! Selection is uniform random with no affinity, weighting or health
//! awareness. A slot that is down is brought back by its own supervisor.

use crate::instance::InstanceIdentity;
use rand::Rng;
use tracing::trace;

/// Selects pool slots
#[derive(Debug, Clone, Copy)]
pub struct LoadBalancer {
    size: u32,
}

impl LoadBalancer {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    /// Pick one slot uniformly at random. `None` for an empty pool.
    pub fn select(&self) -> Option<InstanceIdentity> {
        self.select_with(&mut rand::thread_rng())
    }

    /// Pick one slot using the given random source
    pub fn select_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<InstanceIdentity> {
        if self.size == 0 {
            return None;
        }
        let index = rng.gen_range(0..self.size);
        trace!(index, size = self.size, "Selected pool slot");
        Some(InstanceIdentity::pool_slot(index))
    }

    /// Every slot, in index order
    pub fn enumerate(&self) -> Vec<InstanceIdentity> {
        (0..self.size).map(InstanceIdentity::pool_slot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_enumerate_in_slot_order() {
        let lb = LoadBalancer::new(3);
        let names: Vec<String> = lb.enumerate().iter().map(|id| id.to_string()).collect();
        assert_eq!(names, vec!["lb-0", "lb-1", "lb-2"]);
    }

    #[test]
    fn test_empty_pool_selects_nothing() {
        let lb = LoadBalancer::new(0);
        assert!(lb.select().is_none());
        assert!(lb.enumerate().is_empty());
    }

    #[test]
    fn test_single_slot() {
        let lb = LoadBalancer::new(1);
        assert_eq!(lb.select().unwrap().as_str(), "lb-0");
    }

    #[test]
    fn test_selection_is_roughly_uniform() {
        let lb = LoadBalancer::new(5);
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0u32; 5];

        for _ in 0..10_000 {
            let id = lb.select_with(&mut rng).unwrap();
            counts[id.slot_index().unwrap() as usize] += 1;
        }

        // Expected 2000 per slot
        for count in counts {
            assert!((1700..=2300).contains(&count), "skewed counts: {:?}", counts);
        }
    }
}
