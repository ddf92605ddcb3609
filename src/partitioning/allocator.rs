//! The partition allocator (§4.4): chooses a disk, partition type,
//! start sector, and length for every not-yet-placed partition
//! request, then reconciles extended-partition bookkeeping.

use std::cmp::Ordering;

use log::{debug, info};

use super::{free_regions, grower, FreeRegion};
use crate::{
    device::{tree::DeviceTree, format::TWO_TIB, Device, DeviceId, DeviceKind, PartedPartition, PartitionType},
    error::PartitioningError,
    size::Size,
};

/// The partition-type decision `get_next_partition_type` can return.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NextPartitionType {
    Normal,
    Extended,
    Logical,
    None,
}

/// Sorts pending partition requests by the specificity-first
/// comparator: the more constrained a request, the earlier it is
/// allocated, so a loosely-specified request doesn't steal space a
/// tightly-specified one needed.
pub fn compare_requests(tree: &DeviceTree, a: DeviceId, b: DeviceId) -> Ordering {
    let (Some(da), Some(db)) = (tree.get(a), tree.get(b)) else { return Ordering::Equal };
    let (Some(pa), Some(pb)) = (da.kind.as_partition(), db.kind.as_partition()) else { return Ordering::Equal };

    // 1. explicit start sector first, lower first among both set.
    match (pa.req_start_sector, pb.req_start_sector) {
        (Some(sa), Some(sb)) => return sa.cmp(&sb),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        (None, None) => {}
    }

    // 2. higher weight first.
    if pa.weight != pb.weight {
        return pb.weight.cmp(&pa.weight);
    }

    // 3. non-empty req_disks before empty; shorter first among both non-empty.
    match (pa.req_disks.is_empty(), pb.req_disks.is_empty()) {
        (false, true) => return Ordering::Less,
        (true, false) => return Ordering::Greater,
        (false, false) => {
            if pa.req_disks.len() != pb.req_disks.len() {
                return pa.req_disks.len().cmp(&pb.req_disks.len());
            }
        }
        (true, true) => {}
    }

    // 4. primary requests before non-primary.
    if pa.req_primary != pb.req_primary {
        return pb.req_primary.cmp(&pa.req_primary);
    }

    // 5. fixed sizes before growable.
    if pa.req_grow != pb.req_grow {
        return pa.req_grow.cmp(&pb.req_grow);
    }

    // 6. larger base size first.
    if pa.req_base_size.bytes() != pb.req_base_size.bytes() {
        return pb.req_base_size.bytes().cmp(&pa.req_base_size.bytes());
    }

    // 7. among growable pairs: unbounded max before bounded; larger max first.
    match (pa.req_max_size, pb.req_max_size) {
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(ma), Some(mb)) if ma.bytes() != mb.bytes() => return mb.bytes().cmp(&ma.bytes()),
        _ => {}
    }

    // 8. mountpoint lexicographic tie-break.
    da.format.common.mountpoint.cmp(&db.format.common.mountpoint)
}

pub fn sort_requests(tree: &DeviceTree, mut requests: Vec<DeviceId>) -> Vec<DeviceId> {
    requests.sort_by(|&a, &b| compare_requests(tree, a, b));
    requests
}

/// Decides the next partition type a request should receive on `disk`.
pub fn get_next_partition_type(tree: &DeviceTree, disk: DeviceId, no_primary: bool) -> NextPartitionType {
    let Some(disk_device) = tree.get(disk) else { return NextPartitionType::None };
    let Some(disklabel) = disk_device.format.disklabel() else { return NextPartitionType::None };
    let has_ext = super::has_extended(tree, disk);
    let max = disklabel.max_primary();

    if !disklabel.table_type.supports_extended() {
        return if disklabel.primary_count < max { NextPartitionType::Normal } else { NextPartitionType::None };
    }

    if disklabel.primary_count < max - 1 {
        return if no_primary && has_ext { NextPartitionType::Logical } else { NextPartitionType::Normal };
    }
    if disklabel.primary_count == max - 1 && !has_ext {
        return if no_primary {
            NextPartitionType::None
        } else {
            NextPartitionType::Extended
        };
    }
    if disklabel.primary_count >= max && has_ext {
        return NextPartitionType::Logical;
    }
    NextPartitionType::None
}

/// Finds the best free region on `disk` for a request of `req_size`
/// sectors, per the §4.4 scan rules.
#[allow(clippy::too_many_arguments)]
pub fn get_best_free_space_region(
    tree: &DeviceTree,
    disk: DeviceId,
    part_type: NextPartitionType,
    req_size: u64,
    start: Option<u64>,
    boot: bool,
    grow: bool,
) -> Option<FreeRegion> {
    let disk_device = tree.get(disk)?;
    let disklabel = disk_device.format.disklabel()?;
    let has_ext = super::has_extended(tree, disk);
    let ext_region = super::extended_partition(tree, disk).and_then(|ext| {
        tree.get(ext)?.kind.as_partition()?.parted_partition.map(|pp| (pp.start_sector, pp.end_sector))
    });

    let mut candidates: Vec<FreeRegion> = free_regions(tree, disk)
        .into_iter()
        .filter_map(|mut region| {
            if let Some(start) = start {
                let aligned = disklabel.alignment.align_up(start);
                if aligned < start || aligned > region.end {
                    return None;
                }
                if !region.contains(start) {
                    return None;
                }
                region.start = aligned;
            }

            if has_ext {
                match (part_type, ext_region) {
                    (NextPartitionType::Logical, Some((es, ee))) => {
                        if region.start < es || region.end > ee {
                            return None;
                        }
                    }
                    (NextPartitionType::Normal, Some((es, ee))) => {
                        if region.start >= es && region.end <= ee {
                            return None;
                        }
                    }
                    _ => {}
                }
            }

            if region.start > disklabel.max_start_sector {
                return None;
            }

            if boot {
                let sector_size = disklabel.sector_size.max(1);
                let boot_cap_sector = TWO_TIB / sector_size;
                if region.start + req_size > boot_cap_sector {
                    return None;
                }
            }

            if region.len() < req_size {
                return None;
            }

            Some(region)
        })
        .collect();

    if candidates.is_empty() {
        return None;
    }

    if grow || part_type == NextPartitionType::Extended {
        candidates.sort_by_key(|r| std::cmp::Reverse(r.len()));
    } else if boot {
        candidates.sort_by_key(|r| r.start);
    } else {
        candidates.sort_by_key(|r| r.len());
    }
    candidates.into_iter().next()
}

struct PlacedRequest {
    id:         DeviceId,
    disk:       DeviceId,
    start:      u64,
    length:     u64,
    part_type:  PartitionType,
}

/// One candidate disk's placement for a request, with `score` only
/// meaningful for growable requests (§4.4 main loop, step 3): the total
/// sectors the disk-chunk grower would distribute on that disk if the
/// request were placed there.
struct CandidatePlacement {
    disk:      DeviceId,
    region:    FreeRegion,
    size:      u64,
    part_type: PartitionType,
    score:     u64,
}

/// Evaluates placing a `size_sectors`-long request of `part_type`
/// preference on `disk`, returning the free region it would occupy (if
/// any) and its `NextPartitionType`/`PartitionType` pairing.
fn evaluate_disk(
    tree: &DeviceTree,
    disk: DeviceId,
    req_size: u64,
    req_primary: bool,
    req_bootable: bool,
    req_grow: bool,
    req_start: Option<u64>,
) -> Option<(FreeRegion, u64, PartitionType)> {
    let disklabel_grain = tree.get(disk).and_then(|d| d.format.disklabel()).map(|dl| dl.alignment.grain_size).unwrap_or(2048);
    let sector_size = tree.get(disk).and_then(|d| d.format.disklabel()).map(|dl| dl.sector_size).unwrap_or(512);
    let mut size_sectors = req_size / sector_size.max(1);
    if req_start.is_none() {
        size_sectors = ((size_sectors + disklabel_grain - 1) / disklabel_grain) * disklabel_grain;
    }

    let no_primary = !req_primary;
    let next_type = get_next_partition_type(tree, disk, no_primary);
    if next_type == NextPartitionType::None {
        return None;
    }

    let region = get_best_free_space_region(tree, disk, next_type, size_sectors, req_start, req_bootable, req_grow)?;
    let part_type = match next_type {
        NextPartitionType::Normal => PartitionType::Primary,
        NextPartitionType::Logical => PartitionType::Logical,
        NextPartitionType::Extended | NextPartitionType::None => PartitionType::Primary,
    };
    Some((region, size_sectors, part_type))
}

/// Simulates placing `id` on `disk` at `region`/`size_sectors` in a
/// disposable clone of `tree`, runs the disk-chunk grower over it, and
/// returns the total sectors the grower distributed on that disk — the
/// scoring function for §4.4 main loop step 3 ("choose the disk that
/// yields the greatest total growth"). The clone is dropped at the end
/// of this call, so the real tree is never mutated by the simulation
/// (§5 "every such simulation must remove its temporary partition
/// before returning control").
fn simulate_growth_on_disk(tree: &DeviceTree, id: DeviceId, disk: DeviceId, region: FreeRegion, size_sectors: u64, part_type: PartitionType) -> u64 {
    let mut sim = tree.clone();
    if let Some(device) = sim.get_mut(id) {
        if let Some(data) = device.kind.as_partition_mut() {
            data.disk = Some(disk);
            data.parted_partition = Some(PartedPartition {
                start_sector: region.start,
                end_sector:   region.start + size_sectors.min(region.len()) - 1,
                part_type,
                flags:        crate::device::format::PartitionFlags::LBA,
                gpt_type_uuid: None,
            });
        }
    }
    let Some((mut chunk, _)) = grower::disk_chunk(&sim, disk) else { return 0 };
    chunk.grow_requests();
    chunk.requests.iter().map(|r| r.growth).sum()
}

/// Allocates every not-yet-placed partition request in `pending`
/// (device ids already in the tree, each a `DeviceKind::Partition`
/// with `parted_partition == None`). Candidate disks for a request come
/// from `req_disks` if set, else `req_disk_tags` resolved against the
/// tree's disk tags, else every partitioned disk in the tree; the
/// engine's boot disk (if configured) is always moved to the head of
/// the candidate list (§4.4 main loop, step 1).
pub fn allocate_partitions(tree: &mut DeviceTree, pending: Vec<DeviceId>, ctx: &crate::context::Context) -> Result<(), PartitioningError> {
    let ordered = sort_requests(tree, pending);
    let mut placed: Vec<PlacedRequest> = Vec::new();

    for id in ordered {
        let (req_size, req_disks, req_disk_tags, req_primary, req_bootable, req_grow, req_start) = {
            let device = tree.get(id).ok_or(PartitioningError::NoCandidateDisk { id })?;
            let data = device.kind.as_partition().ok_or(PartitioningError::NoCandidateDisk { id })?;
            let size = data.req_size.unwrap_or(data.req_base_size);
            (size.bytes(), data.req_disks.clone(), data.req_disk_tags.clone(), data.req_primary, data.req_bootable, data.req_grow, data.req_start_sector)
        };

        let candidate_disks: Vec<DeviceId> = if !req_disks.is_empty() {
            req_disks
        } else if !req_disk_tags.is_empty() {
            super::resolve_disk_tags(tree, &req_disk_tags)
        } else {
            tree.iter().filter(|d| matches!(d.kind, DeviceKind::Disk) && d.format.disklabel().is_some()).map(|d| d.id).collect()
        };
        let candidate_disks = super::order_candidate_disks(candidate_disks, ctx.boot_disk);
        if candidate_disks.is_empty() {
            return Err(PartitioningError::NoCandidateDisk { id });
        }

        let best = if req_grow {
            use rayon::prelude::*;

            candidate_disks
                .par_iter()
                .filter_map(|&disk| {
                    let (region, size_sectors, part_type) = evaluate_disk(tree, disk, req_size, req_primary, req_bootable, req_grow, req_start)?;
                    let score = simulate_growth_on_disk(tree, id, disk, region, size_sectors, part_type);
                    Some(CandidatePlacement { disk, region, size: size_sectors, part_type, score })
                })
                .max_by_key(|c| c.score)
        } else {
            candidate_disks.iter().find_map(|&disk| {
                let (region, size_sectors, part_type) = evaluate_disk(tree, disk, req_size, req_primary, req_bootable, req_grow, req_start)?;
                Some(CandidatePlacement { disk, region, size: size_sectors, part_type, score: 0 })
            })
        };

        let CandidatePlacement { disk, region, size: size_sectors, part_type: mut part_type, .. } =
            best.ok_or(PartitioningError::NoFreeRegion { id })?;

        let mut start = region.start;
        let mut length = size_sectors.min(region.len());

        if part_type == PartitionType::Primary && get_next_partition_type(tree, disk, !req_primary) == NextPartitionType::Extended {
            // the disk has no room left for a normal/logical split
            // without carving an explicit extended partition first.
            create_extended_partition(tree, disk, region)?;
            part_type = PartitionType::Logical;
            let grain = tree.get(disk).and_then(|d| d.format.disklabel()).map(|dl| dl.alignment.grain_size).unwrap_or(2048);
            start = region.start + grain;
            length = length.saturating_sub(grain).max(1);
        }

        {
            let device = tree.get_mut(disk).ok_or(PartitioningError::NoCandidateDisk { id })?;
            if let DeviceKind::Disk = device.kind {
                if let Some(dl) = device.format.disklabel_mut() {
                    if part_type == PartitionType::Primary {
                        dl.primary_count += 1;
                    }
                }
            }
        }

        let sector_size = tree.get(disk).and_then(|d| d.format.disklabel()).map(|dl| dl.sector_size).unwrap_or(512).max(1);
        let placed_bytes = length * sector_size;
        {
            let device = tree.get(id).ok_or(PartitioningError::NoCandidateDisk { id })?;
            let min_size = device.format.common.min_size.bytes();
            if min_size > 0 && placed_bytes < min_size {
                return Err(PartitioningError::BelowFormatMinSize { id });
            }
            if let Some(max_size) = device.format.common.max_size {
                if placed_bytes > max_size.bytes() {
                    return Err(PartitioningError::AboveFormatMaxSize { id });
                }
            }
        }

        let gpt_type_uuid = if ctx.gpt_discoverable_partitions {
            let is_gpt = tree.get(disk).and_then(|d| d.format.disklabel()).map(|dl| dl.table_type == crate::device::format::DisklabelType::Gpt).unwrap_or(false);
            let mountpoint = tree.get(id).and_then(|d| d.format.common.mountpoint.clone());
            match (is_gpt, mountpoint) {
                (true, Some(mountpoint)) => crate::gpt::gpt_part_uuid_for_mountpoint(&mountpoint, ctx.arch).ok().flatten(),
                _ => None,
            }
        } else {
            None
        };

        {
            let device = tree.get_mut(id).ok_or(PartitioningError::NoCandidateDisk { id })?;
            let data = device.kind.as_partition_mut().ok_or(PartitioningError::NoCandidateDisk { id })?;
            data.disk = Some(disk);
            data.parted_partition = Some(PartedPartition {
                start_sector: start,
                end_sector:   start + length - 1,
                part_type,
                flags:        crate::device::format::PartitionFlags::LBA,
                gpt_type_uuid,
            });
        }

        info!("placed partition {:?} on disk {:?} at sector {} ({} sectors)", id, disk, start, length);
        placed.push(PlacedRequest { id, disk, start, length, part_type });
    }

    for disk in placed.iter().map(|p| p.disk).collect::<std::collections::HashSet<_>>() {
        update_extended_partitions(tree, disk, ctx);
        grower::grow_partitions(tree, disk, ctx);
    }

    Ok(())
}

fn create_extended_partition(tree: &mut DeviceTree, disk: DeviceId, region: FreeRegion) -> Result<DeviceId, PartitioningError> {
    let id = tree.next_id();
    let name = tree.get(disk).map(|d| d.name.clone()).unwrap_or_default();
    let mut data = crate::device::PartitionData::default();
    data.disk = Some(disk);
    data.parted_partition = Some(PartedPartition {
        start_sector: region.start,
        end_sector:   region.end,
        part_type:    PartitionType::Extended,
        flags:        crate::device::format::PartitionFlags::LBA,
        gpt_type_uuid: None,
    });
    let sector_size = tree.get(disk).and_then(|d| d.format.disklabel()).map(|dl| dl.sector_size).unwrap_or(512).max(1);
    let device = Device::new(id, format!("{name}-extended"), Size(region.len() * sector_size), DeviceKind::Partition(data)).with_parent(disk);
    tree.add(device).map_err(|_| PartitioningError::ExtendedCreateFailed { disk })?;
    debug!("created extended partition {:?} on disk {:?}", id, disk);
    Ok(id)
}

/// Reconciles extended-partition bookkeeping after allocation: unless
/// `ctx.keep_empty_ext_partitions` is set, any disk whose disklabel no
/// longer has logical partitions loses its implicit extended
/// PartitionDevice.
pub fn update_extended_partitions(tree: &mut DeviceTree, disk: DeviceId, ctx: &crate::context::Context) {
    if ctx.keep_empty_ext_partitions {
        return;
    }
    let Some(ext) = super::extended_partition(tree, disk) else { return };
    let (_, logical) = super::primary_and_logical_count(tree, disk);
    if logical == 0 && tree.is_leaf(ext) {
        let _ = tree.remove(ext, true, true);
        debug!("removed now-empty extended partition {:?} on disk {:?}", ext, disk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        format::{Alignment, Disklabel, DisklabelType, FormatCommon, FormatKind},
        DeviceFormat, PartitionData,
    };
    use crate::size::Size;

    fn disk_with_label(tree: &mut DeviceTree, name: &str, sectors: u64, table: DisklabelType) -> DeviceId {
        let id = tree.next_id();
        let mut disklabel = Disklabel::new(table, 512, sectors);
        disklabel.alignment = Alignment::new(2048, 0);
        let format = DeviceFormat::new(FormatKind::Disklabel(disklabel), FormatCommon::default());
        let mut device = Device::new(id, name, Size(sectors * 512), DeviceKind::Disk);
        device.format = format;
        tree.add(device).unwrap()
    }

    fn partition_request(tree: &mut DeviceTree, size: Size, primary: bool, grow: bool) -> DeviceId {
        let id = tree.next_id();
        let mut data = PartitionData::default();
        data.req_base_size = size;
        data.req_size = Some(size);
        data.req_primary = primary;
        data.req_grow = grow;
        let device = Device::new(id, "pending", size, DeviceKind::Partition(data));
        tree.add(device).unwrap()
    }

    #[test]
    fn next_partition_type_prefers_normal_when_slots_free() {
        let mut tree = DeviceTree::new();
        let disk = disk_with_label(&mut tree, "sda", 2_000_000, DisklabelType::Msdos);
        assert_eq!(get_next_partition_type(&tree, disk, false), NextPartitionType::Normal);
    }

    #[test]
    fn next_partition_type_offers_extended_at_cap() {
        let mut tree = DeviceTree::new();
        let disk = disk_with_label(&mut tree, "sda", 2_000_000, DisklabelType::Msdos);
        if let Some(dl) = tree.get_mut(disk).unwrap().format.disklabel_mut() {
            dl.primary_count = 3;
        }
        assert_eq!(get_next_partition_type(&tree, disk, false), NextPartitionType::Extended);
    }

    #[test]
    fn allocate_places_request_in_free_region() {
        let mut tree = DeviceTree::new();
        let disk = disk_with_label(&mut tree, "sda", 2_000_000, DisklabelType::Gpt);
        let req = partition_request(&mut tree, Size::from_mib(100), true, false);
        allocate_partitions(&mut tree, vec![req], &crate::context::Context::default()).unwrap();
        let data = tree.get(req).unwrap().kind.as_partition().unwrap();
        assert_eq!(data.disk, Some(disk));
        assert!(data.parted_partition.is_some());
    }

    #[test]
    fn growable_request_picks_disk_with_more_free_space() {
        let mut tree = DeviceTree::new();
        let small = disk_with_label(&mut tree, "sda", 250_000, DisklabelType::Gpt);
        let big = disk_with_label(&mut tree, "sdb", 2_000_000, DisklabelType::Gpt);
        let req = partition_request(&mut tree, Size::from_mib(10), true, true);
        if let Some(data) = tree.get_mut(req).unwrap().kind.as_partition_mut() {
            data.req_disks = vec![small, big];
        }
        allocate_partitions(&mut tree, vec![req], &crate::context::Context::default()).unwrap();
        let data = tree.get(req).unwrap().kind.as_partition().unwrap();
        assert_eq!(data.disk, Some(big));
    }

    #[test]
    fn sorts_fixed_before_growable() {
        let mut tree = DeviceTree::new();
        let growable = partition_request(&mut tree, Size::from_mib(10), true, true);
        let fixed = partition_request(&mut tree, Size::from_mib(10), true, false);
        let sorted = sort_requests(&tree, vec![growable, fixed]);
        assert_eq!(sorted[0], fixed);
        assert_eq!(sorted[1], growable);
    }
}
