//! Size sets (§4.5.1): a post-grower reconciliation pass for groups of
//! requests whose sizes must agree with each other rather than simply
//! with their own base/max bounds — e.g. the root and a root-verity
//! partner partition must end up exactly the same size, or a set of
//! swap partitions spread across disks must together add up to a
//! fixed total.

use crate::device::DeviceId;

/// A set of devices whose *sizes must sum* to `total_size` once the
/// grower has run. If the grower's independent proportional growth
/// left the sum off target, the shortfall or surplus is redistributed
/// across the set's members before the action executes.
#[derive(Debug, Clone)]
pub struct TotalSizeSet {
    pub members:    Vec<DeviceId>,
    pub total_size: u64,
}

impl TotalSizeSet {
    pub fn new(members: Vec<DeviceId>, total_size: u64) -> TotalSizeSet { TotalSizeSet { members, total_size } }

    /// Adjusts `sizes` (keyed by the same order as `self.members`) so
    /// they sum to `self.total_size`, spreading the delta evenly with
    /// any remainder going to the first member. Returns `false` if the
    /// set is empty (nothing to reconcile).
    pub fn reconcile(&self, sizes: &mut [u64]) -> bool {
        if self.members.is_empty() || sizes.is_empty() {
            return false;
        }
        let current: u64 = sizes.iter().sum();
        if current == self.total_size {
            return true;
        }
        if current < self.total_size {
            let mut shortfall = self.total_size - current;
            let share = shortfall / sizes.len() as u64;
            for size in sizes.iter_mut() {
                *size += share;
            }
            shortfall -= share * sizes.len() as u64;
            if let Some(first) = sizes.first_mut() {
                *first += shortfall;
            }
        } else {
            let mut surplus = current - self.total_size;
            for size in sizes.iter_mut() {
                let take = surplus.min(*size);
                *size -= take;
                surplus -= take;
                if surplus == 0 {
                    break;
                }
            }
        }
        true
    }
}

/// A set of devices that must all end up the *same size* — the
/// common case being a root filesystem and its dm-verity hash
/// partition, which the allocator places independently but which the
/// grower must not be allowed to diverge.
#[derive(Debug, Clone)]
pub struct SameSizeSet {
    pub members: Vec<DeviceId>,
}

impl SameSizeSet {
    pub fn new(members: Vec<DeviceId>) -> SameSizeSet { SameSizeSet { members } }

    /// Clamps every member in `sizes` down to the smallest size in the
    /// set — growth that one member achieved and another didn't is
    /// given back to the chunk pool rather than kept, since a same-size
    /// set can only grow as far as its most constrained member.
    pub fn reconcile(&self, sizes: &mut [u64]) -> bool {
        let Some(&min) = sizes.iter().min() else { return false };
        for size in sizes.iter_mut() {
            *size = min;
        }
        true
    }
}

/// Runs every size set's reconciliation against the grower's output in
/// a single pass. `lookup` maps a device id to its post-growth size;
/// `apply` writes each member's reconciled size back. Space a
/// `SameSizeSet` clamps away is not fed back into a second
/// `grow_requests` round in this crate (§4.5.1 Open Question, decided
/// in DESIGN.md) — it is simply forfeited by that set's members.
pub fn manage_size_sets(
    total_sets: &[TotalSizeSet],
    same_sets: &[SameSizeSet],
    mut lookup: impl FnMut(DeviceId) -> Option<u64>,
    mut apply: impl FnMut(DeviceId, u64),
) {
    for set in total_sets {
        let mut sizes: Vec<u64> = set.members.iter().map(|&id| lookup(id).unwrap_or(0)).collect();
        if set.reconcile(&mut sizes) {
            for (&id, &size) in set.members.iter().zip(sizes.iter()) {
                apply(id, size);
            }
        }
    }
    for set in same_sets {
        let mut sizes: Vec<u64> = set.members.iter().map(|&id| lookup(id).unwrap_or(0)).collect();
        if set.reconcile(&mut sizes) {
            for (&id, &size) in set.members.iter().zip(sizes.iter()) {
                apply(id, size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> DeviceId { DeviceId(n) }

    #[test]
    fn total_size_set_tops_up_shortfall() {
        let set = TotalSizeSet::new(vec![id(1), id(2)], 100);
        let mut sizes = vec![40, 40];
        assert!(set.reconcile(&mut sizes));
        assert_eq!(sizes.iter().sum::<u64>(), 100);
    }

    #[test]
    fn total_size_set_trims_surplus() {
        let set = TotalSizeSet::new(vec![id(1), id(2)], 50);
        let mut sizes = vec![40, 40];
        assert!(set.reconcile(&mut sizes));
        assert_eq!(sizes.iter().sum::<u64>(), 50);
    }

    #[test]
    fn same_size_set_clamps_to_minimum() {
        let set = SameSizeSet::new(vec![id(1), id(2)]);
        let mut sizes = vec![120, 100];
        assert!(set.reconcile(&mut sizes));
        assert_eq!(sizes, vec![100, 100]);
    }

    #[test]
    fn empty_set_reconciles_to_noop() {
        let set = TotalSizeSet::new(vec![], 0);
        let mut sizes: Vec<u64> = vec![];
        assert!(!set.reconcile(&mut sizes));
    }
}
