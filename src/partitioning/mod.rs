//! The partition allocator and grower (§4.4, §4.5): disk-geometry-aware
//! placement of fixed- and growable-size partition/LV requests under
//! alignment and disklabel/VG constraints.

pub mod allocator;
pub mod grower;
pub mod sizeset;

use itertools::Itertools;

use crate::device::{tree::DeviceTree, DeviceId, DeviceKind};

/// A contiguous run of unallocated sectors on a disklabel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: u64,
    pub end:   u64,
}

impl FreeRegion {
    pub fn len(&self) -> u64 { self.end.saturating_sub(self.start) + 1 }

    pub fn contains(&self, sector: u64) -> bool { sector >= self.start && sector <= self.end }
}

/// Scans `disk`'s current partition children and returns the gaps
/// between them (and before the first / after the last), computed on
/// demand rather than cached — mirroring a live disklabel free-space
/// query (§4.1 note on `Disklabel`).
pub fn free_regions(tree: &DeviceTree, disk: DeviceId) -> Vec<FreeRegion> {
    let Some(disk_device) = tree.get(disk) else { return Vec::new() };
    let Some(disklabel) = disk_device.format.disklabel() else { return Vec::new() };

    let mut occupied: Vec<(u64, u64)> = tree
        .iter()
        .filter_map(|d| d.kind.as_partition())
        .filter(|p| p.disk == Some(disk))
        .filter_map(|p| p.parted_partition)
        .map(|pp| (pp.start_sector, pp.end_sector))
        .collect();
    occupied.sort_by_key(|&(start, _)| start);

    let mut regions = Vec::new();
    let mut cursor = disklabel.first_usable;
    for (start, end) in occupied {
        if start > cursor {
            regions.push(FreeRegion { start: cursor, end: start - 1 });
        }
        cursor = cursor.max(end + 1);
    }
    if cursor <= disklabel.max_end_sector {
        regions.push(FreeRegion { start: cursor, end: disklabel.max_end_sector });
    }
    regions
}

/// True if any partition of `disk` is currently an extended partition.
pub fn has_extended(tree: &DeviceTree, disk: DeviceId) -> bool {
    tree.iter().any(|d| {
        d.kind
            .as_partition()
            .map(|p| p.disk == Some(disk) && p.parted_partition.map(|pp| pp.part_type) == Some(crate::device::PartitionType::Extended))
            .unwrap_or(false)
    })
}

pub fn extended_partition(tree: &DeviceTree, disk: DeviceId) -> Option<DeviceId> {
    tree.iter()
        .find(|d| {
            d.kind
                .as_partition()
                .map(|p| p.disk == Some(disk) && p.parted_partition.map(|pp| pp.part_type) == Some(crate::device::PartitionType::Extended))
                .unwrap_or(false)
        })
        .map(|d| d.id)
}

pub fn primary_and_logical_count(tree: &DeviceTree, disk: DeviceId) -> (u32, u32) {
    let mut primary = 0;
    let mut logical = 0;
    for d in tree.iter() {
        if let Some(p) = d.kind.as_partition() {
            if p.disk != Some(disk) {
                continue;
            }
            match p.parted_partition.map(|pp| pp.part_type) {
                Some(crate::device::PartitionType::Primary) => primary += 1,
                Some(crate::device::PartitionType::Logical) => logical += 1,
                _ => {}
            }
        }
    }
    (primary, logical)
}

pub fn is_partitioned_disk(tree: &DeviceTree, id: DeviceId) -> bool {
    tree.get(id).map(|d| matches!(d.kind, DeviceKind::Disk) && d.format.disklabel().is_some()).unwrap_or(false)
}

/// Resolves `req_disk_tags` to the partitioned disks carrying at least
/// one of those tags (§4.4 main loop, step 1: "else
/// `resolve_disk_tags(disks, req_disk_tags)`"). Candidates are returned
/// in tree iteration order, deduplicated; a request with no matching
/// disk yields an empty list, which the allocator treats the same as
/// "no candidate disk".
pub fn resolve_disk_tags(tree: &DeviceTree, tags: &[String]) -> Vec<DeviceId> {
    if tags.is_empty() {
        return Vec::new();
    }
    tree.iter()
        .filter(|d| is_partitioned_disk(tree, d.id))
        .filter(|d| tags.iter().any(|t| d.tags.contains(t)))
        .map(|d| d.id)
        .unique()
        .collect()
}

/// Orders candidate disks by the engine's disk comparator (stable by
/// device id absent any other distinguishing signal this core defines)
/// and then moves the boot disk, if present among the candidates, to
/// the head of the list (§4.4 main loop, step 1).
pub fn order_candidate_disks(mut disks: Vec<DeviceId>, boot_disk: Option<DeviceId>) -> Vec<DeviceId> {
    disks.sort_by_key(|d| d.0);
    if let Some(boot) = boot_disk {
        if let Some(pos) = disks.iter().position(|&d| d == boot) {
            let boot = disks.remove(pos);
            disks.insert(0, boot);
        }
    }
    disks
}
