//! Counted resource pools for processors and devices.
//!
//! A [`ResourcePool`] hands out integer resource ids (core indices, device
//! ordinals) to tests as they launch and takes them back when tests finish.
//! Acquisition never blocks and never fails: a request larger than the pool
//! is satisfied with oversubscribed ids, and only the real capacity is
//! charged against availability.

/// A non-blocking pool of integer resource ids.
///
/// The pool distinguishes `total` (the capacity charged against
/// availability) from `max_available` (the id space handed out). A test
/// asking for more ids than `max_available` still receives a full-length
/// id list; the ids cycle through the available range and the accounting
/// charges only what the pool actually has.
///
/// # Example
///
/// ```
/// use gantry::resources::ResourcePool;
///
/// let mut pool = ResourcePool::new(4, 4);
/// let ids = pool.get(2);
/// assert_eq!(ids.len(), 2);
/// assert_eq!(pool.num_available(), 2);
/// pool.put(&ids);
/// assert_eq!(pool.num_available(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct ResourcePool {
    total: usize,
    max_available: usize,
    inuse: usize,
    use_counts: Vec<u32>,
}

impl ResourcePool {
    /// Creates a pool with `total` chargeable slots over an id space of
    /// `max_available` ids.
    ///
    /// # Panics
    ///
    /// Panics if `max_available < total`.
    pub fn new(total: usize, max_available: usize) -> Self {
        assert!(
            max_available >= total,
            "max_available ({}) must be >= total ({})",
            max_available,
            total
        );
        Self {
            total,
            max_available,
            inuse: 0,
            use_counts: vec![0; max_available],
        }
    }

    pub fn num_total(&self) -> usize {
        self.total
    }

    pub fn max_available(&self) -> usize {
        self.max_available
    }

    /// Number of chargeable slots currently free, clamped at zero.
    pub fn num_available(&self) -> usize {
        self.max_available.saturating_sub(self.inuse)
    }

    /// Acquires `num` resource ids.
    ///
    /// Ids with the lowest use count are preferred, ties broken by lowest
    /// id, so repeated acquire/release cycles rotate through the id space.
    /// When `num` exceeds the id space the returned list still has length
    /// `num` (ids cycle through the range); availability is charged
    /// `min(num, total)` in every case.
    pub fn get(&mut self, num: usize) -> Vec<usize> {
        let ids = if num <= self.max_available {
            let mut order: Vec<usize> = (0..self.max_available).collect();
            order.sort_by_key(|&i| (self.use_counts[i], i));
            order.truncate(num);
            order.sort_unstable();
            order
        } else if self.max_available == 0 {
            (0..num).collect()
        } else {
            (0..num).map(|i| i % self.max_available).collect()
        };

        for &i in &ids {
            if i < self.max_available {
                self.use_counts[i] += 1;
            }
        }

        let charge = num.min(self.total);
        self.inuse = (self.inuse + charge).min(self.max_available);

        ids
    }

    /// Returns previously acquired ids to the pool.
    ///
    /// The availability charge is reversed using the same `min(len, total)`
    /// rule applied at acquisition, so oversubscribed allocations balance.
    pub fn put(&mut self, ids: &[usize]) {
        for &i in ids {
            if i < self.max_available && self.use_counts[i] > 0 {
                self.use_counts[i] -= 1;
            }
        }

        let charge = ids.len().min(self.total);
        self.inuse = self.inuse.saturating_sub(charge);
    }
}
