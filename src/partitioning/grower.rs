//! The proportional-distribution grower (§4.5): once the allocator has
//! placed every request's base size, any leftover chunk capacity is
//! handed out to growable requests in proportion to their base size,
//! repeatedly, until the pool is exhausted or no growable request can
//! make further progress.

use crate::{
    device::{tree::DeviceTree, DeviceId, DeviceKind, PartitionType},
    error::PartitioningError,
};

use super::{free_regions, sizeset};

/// One request competing for a [`Chunk`]'s spare capacity.
#[derive(Debug, Clone)]
pub struct Request {
    pub device:     DeviceId,
    /// The size already committed to this request before growth, in
    /// the chunk's native unit (sectors for a disk, extents for a VG).
    pub base:       u64,
    /// Accumulated growth so far; zero until `grow_requests` runs.
    pub growth:     u64,
    /// Upper bound on `growth`, `0` meaning unbounded.
    pub max_growth: u64,
    /// Once true this request takes no further share of the pool.
    /// Seeded `true` for non-growable requests so they never compete.
    pub done:       bool,
}

impl Request {
    pub fn fixed(device: DeviceId, base: u64) -> Request {
        Request { device, base, growth: 0, max_growth: 0, done: true }
    }

    pub fn growable(device: DeviceId, base: u64, max_growth: u64) -> Request {
        Request { device, base, growth: 0, max_growth, done: false }
    }

    pub fn final_size(&self) -> u64 { self.base + self.growth }
}

/// A pool of capacity (sectors on a disk, extents in a VG, chunks in a
/// thin pool) shared by a set of requests whose combined base size
/// does not exceed `length`.
#[derive(Debug, Default)]
pub struct Chunk {
    pub length:   u64,
    pub pool:     u64,
    pub requests: Vec<Request>,
}

impl Chunk {
    /// `length` is the chunk's total capacity; `pool` starts equal to
    /// it and shrinks as requests are added.
    pub fn new(length: u64) -> Chunk { Chunk { length, pool: length, requests: Vec::new() } }

    pub fn add_request(&mut self, req: Request) {
        self.pool = self.pool.saturating_sub(req.base);
        self.requests.push(req);
    }

    pub fn is_full(&self) -> bool { self.pool == 0 }

    /// Distributes `self.pool` across every non-`done` request,
    /// proportionally to its base size, iterating until the pool stops
    /// changing. A request that reaches `max_growth` is capped, marked
    /// done, and its overshoot returned to the pool for the next
    /// iteration. If the loop stalls (floor rounding leaves less than
    /// one unit of share for anyone) with exactly one request still
    /// growing, that request absorbs the residual; with more than one,
    /// the residual is left in the pool rather than guessing who should
    /// get it.
    pub fn grow_requests(&mut self) {
        loop {
            if self.pool == 0 {
                break;
            }
            let pool_snapshot = self.pool;
            let active: Vec<usize> = (0..self.requests.len()).filter(|&i| !self.requests[i].done).collect();
            if active.is_empty() {
                break;
            }
            let growing_base: u64 = active.iter().map(|&i| self.requests[i].base).sum();
            if growing_base == 0 {
                break;
            }

            let mut deltas = vec![0u64; self.requests.len()];
            for &i in &active {
                let base = self.requests[i].base as u128;
                deltas[i] = (base * pool_snapshot as u128 / growing_base as u128) as u64;
            }
            let total_delta: u64 = deltas.iter().sum();
            if total_delta == 0 {
                break;
            }

            for &i in &active {
                self.requests[i].growth += deltas[i];
                self.pool -= deltas[i];
            }
            for &i in &active {
                let req = &mut self.requests[i];
                if req.max_growth > 0 && req.growth >= req.max_growth {
                    let excess = req.growth - req.max_growth;
                    req.growth = req.max_growth;
                    req.done = true;
                    self.pool += excess;
                }
            }
        }

        if self.pool > 0 {
            let remaining: Vec<usize> = (0..self.requests.len()).filter(|&i| !self.requests[i].done).collect();
            if remaining.len() == 1 {
                let i = remaining[0];
                let req = &mut self.requests[i];
                let take = if req.max_growth > 0 {
                    self.pool.min(req.max_growth.saturating_sub(req.growth))
                } else {
                    self.pool
                };
                req.growth += take;
                self.pool -= take;
                req.done = true;
            }
        }
    }

    pub fn request_for(&self, device: DeviceId) -> Option<&Request> {
        self.requests.iter().find(|r| r.device == device)
    }
}

/// Builds the [`Chunk`] representing a disk's growable capacity: its
/// partitions in start-sector order contribute requests (fixed for
/// `req_grow == false`, growable otherwise, bounded by `req_max_size`
/// converted to sectors), and the chunk's pool is seeded from every
/// free region on the disklabel (§4.5 "DiskChunk").
pub fn disk_chunk(tree: &DeviceTree, disk: DeviceId) -> Option<(Chunk, Vec<DeviceId>)> {
    let disk_device = tree.get(disk)?;
    let disklabel = disk_device.format.disklabel()?;
    let sector_size = disklabel.sector_size.max(1);

    let mut partitions: Vec<(DeviceId, u64, u64, u64)> = tree
        .iter()
        .filter_map(|d| d.kind.as_partition().map(|p| (d, p)))
        .filter(|(_, p)| p.disk == Some(disk))
        .filter_map(|(d, p)| p.parted_partition.map(|pp| (d.id, pp.start_sector, pp.length(), p.req_max_size.map(|s| s.bytes() / sector_size).unwrap_or(0))))
        .collect();
    partitions.sort_by_key(|&(_, start, _, _)| start);

    let total_free: u64 = free_regions(tree, disk).iter().map(|r| r.len()).sum();
    let base_total: u64 = partitions.iter().map(|&(_, _, len, _)| len).sum();
    let mut chunk = Chunk::new(base_total + total_free);
    chunk.pool = total_free;

    let mut order = Vec::with_capacity(partitions.len());
    for (id, _, len, max_sectors) in partitions {
        let device = tree.get(id)?;
        let grow = device.kind.as_partition().map(|p| p.req_grow).unwrap_or(false);
        let req = if grow {
            let max_growth = if max_sectors > len { max_sectors - len } else { 0 };
            Request::growable(id, len, max_growth)
        } else {
            Request::fixed(id, len)
        };
        chunk.requests.push(req);
        order.push(id);
    }
    Some((chunk, order))
}

/// Orders raw `(id, extents, max_extents, grow)` LV tuples by the VG
/// chunk's comparator (§4.5 `grow_requests`, step 1): larger base
/// first, fixed before growable, and among growable requests the one
/// with more headroom (unbounded, then larger `max_extents`) first.
fn sort_lv_requests(lvs: &mut [(DeviceId, u64, u64, bool)]) {
    lvs.sort_by(|a, b| {
        b.1.cmp(&a.1).then_with(|| a.3.cmp(&b.3)).then_with(|| match (a.2, b.2) {
            (0, 0) => std::cmp::Ordering::Equal,
            (0, _) => std::cmp::Ordering::Less,
            (_, 0) => std::cmp::Ordering::Greater,
            (ma, mb) => mb.cmp(&ma),
        })
    });
}

/// Resolves every `req_percent`-based LV of `vg` to a fixed extent
/// count before the proportional grower runs (§4.5 "LVM grower":
/// "Percentage-based LVs (`req_percent`) are sized at `floor(percent ×
/// (free + percent_base))` extents first; the sum of percentages
/// within one VG must be ≤ 100"). Resolved LVs have `req_grow` cleared
/// so `vg_chunk` treats them as fixed.
pub fn resolve_percent_lvs(tree: &mut DeviceTree, vg: DeviceId) -> Result<(), PartitioningError> {
    let vg_data = tree.get(vg).and_then(|d| d.kind.as_vg()).ok_or(PartitioningError::VolumeGroupOverCommitted { id: vg })?;
    let pe_size = vg_data.pe_size.bytes().max(1);
    let free_extents = vg_data.free_extents;

    let percent_lvs: Vec<(DeviceId, u8, u64)> = tree
        .iter()
        .filter_map(|d| d.kind.as_lv().map(|lv| (d.id, lv)))
        .filter(|(_, lv)| lv.vg == Some(vg))
        .filter_map(|(id, lv)| lv.req_percent.map(|p| (id, p, lv.used_space.bytes() / pe_size)))
        .collect();

    let total_percent: u32 = percent_lvs.iter().map(|&(_, p, _)| p as u32).sum();
    if total_percent > 100 {
        return Err(PartitioningError::VolumeGroupOverCommitted { id: vg });
    }

    let mut total_growth = 0u64;
    for (id, percent, base_extents) in percent_lvs {
        let target = (percent as u128 * (free_extents + base_extents) as u128 / 100) as u64;
        let target = target.max(base_extents);
        total_growth += target - base_extents;
        if let Some(lv) = tree.get_mut(id).and_then(|d| d.kind.as_lv_mut()) {
            lv.used_space = crate::size::Size(target * pe_size);
            lv.req_grow = false;
        }
    }

    if let Some(data) = tree.get_mut(vg).and_then(|d| d.kind.as_vg_mut()) {
        data.free_extents = data.free_extents.saturating_sub(total_growth);
    }
    Ok(())
}

/// Raises the owning VG's pmspare reservation to at least `pool`'s
/// current size, if its thin-pool metadata estimate now needs more
/// than the VG currently reserves (§4.5 "each existing thin pool's
/// metadata size is auto-tuned (possibly enlarging the VG's pmspare
/// reservation, in which case the extra is taken from the pool)").
/// Returns the extent delta taken from the VG's free pool, `0` if no
/// enlargement was needed.
pub fn tune_thin_pool_metadata(tree: &mut DeviceTree, pool: DeviceId, vg: DeviceId) -> Option<u64> {
    let pool_bytes = tree.get(pool)?.size.bytes();
    let pe_size = tree.get(vg)?.kind.as_vg()?.pe_size.bytes().max(1);

    // mirrors lvm2's thin-pool metadata sizing heuristic: roughly 0.1%
    // of pool size, clamped to its legal range.
    let estimate = (pool_bytes / 1000).clamp(2 * crate::size::Size::MIB, 16 * crate::size::Size::GIB);

    let vg_data = tree.get_mut(vg)?.kind.as_vg_mut()?;
    if estimate <= vg_data.pmspare_size.bytes() {
        return Some(0);
    }
    let delta = estimate - vg_data.pmspare_size.bytes();
    vg_data.pmspare_size = crate::size::Size(estimate);
    let delta_extents = delta.div_ceil(pe_size);
    vg_data.free_extents = vg_data.free_extents.saturating_sub(delta_extents);
    Some(delta_extents)
}

/// Builds the [`Chunk`] representing a volume group's growable
/// capacity: each LV with `req_grow` set contributes a growable
/// request in extents (sub-LVs of a thin pool are excluded — they
/// compete within [`thin_pool_chunk`] instead); each thin pool member
/// contributes a fixed request pinned to at least the sum of its child
/// LVs' `used_space` (§4.5 "LVM grower": "Thin pool bases are pinned to
/// at least the sum of their child LVs' `used_space`"); `req_percent`-
/// based LVs are resolved to a fixed base size before the grower runs
/// ([`resolve_percent_lvs`]) and are therefore treated as fixed here.
pub fn vg_chunk(tree: &DeviceTree, vg: DeviceId) -> Option<(Chunk, Vec<DeviceId>)> {
    let vg_device = tree.get(vg)?;
    let vg_data = vg_device.kind.as_vg()?;
    let pe_size = vg_data.pe_size.bytes().max(1);

    let mut lvs: Vec<(DeviceId, u64, u64, bool)> = tree
        .iter()
        .filter_map(|d| d.kind.as_lv().map(|lv| (d, lv)))
        .filter(|(_, lv)| lv.vg == Some(vg) && lv.pool.is_none())
        .map(|(d, lv)| {
            let extents = lv.used_space.bytes() / pe_size;
            let max_extents = lv.req_max_size.map(|s| s.bytes() / pe_size).unwrap_or(0);
            (d.id, extents, max_extents, lv.req_grow)
        })
        .collect();

    for pool in tree.iter().filter(|d| matches!(d.kind, DeviceKind::LvmThinPool(_)) && d.parents.contains(&vg)) {
        let children_used: u64 = tree
            .iter()
            .filter_map(|d| d.kind.as_lv())
            .filter(|lv| lv.pool == Some(pool.id))
            .map(|lv| lv.used_space.bytes())
            .sum();
        let extents = pool.size.bytes().max(children_used) / pe_size;
        lvs.push((pool.id, extents, 0, false));
    }

    sort_lv_requests(&mut lvs);

    let reserved_extents = vg_data.reserved_space.bytes().div_ceil(pe_size);
    let mut chunk = Chunk::new(vg_data.extents.saturating_sub(reserved_extents));
    let mut order = Vec::with_capacity(lvs.len());
    for (id, extents, max_extents, grow) in lvs.drain(..) {
        let req = if grow {
            let max_growth = if max_extents > extents { max_extents - extents } else { 0 };
            Request::growable(id, extents, max_growth)
        } else {
            Request::fixed(id, extents)
        };
        chunk.add_request(req);
        order.push(id);
    }
    Some((chunk, order))
}

/// Builds the [`Chunk`] representing a thin pool's growable capacity,
/// expressed in the owning VG's extents: its requests are the thin LVs
/// it backs (§4.5 "ThinPoolChunk": "length = pool.size / vg.pe_size
/// and requests are sub-LVs of the pool").
pub fn thin_pool_chunk(tree: &DeviceTree, pool: DeviceId, vg: DeviceId) -> Option<(Chunk, Vec<DeviceId>)> {
    let pool_device = tree.get(pool)?;
    let pe_size = tree.get(vg)?.kind.as_vg()?.pe_size.bytes().max(1);
    let length = pool_device.size.bytes() / pe_size;

    let mut lvs: Vec<(DeviceId, u64, u64, bool)> = tree
        .iter()
        .filter_map(|d| d.kind.as_lv().map(|lv| (d, lv)))
        .filter(|(_, lv)| lv.pool == Some(pool))
        .map(|(d, lv)| {
            let extents = lv.used_space.bytes() / pe_size;
            let max_extents = lv.req_max_size.map(|s| s.bytes() / pe_size).unwrap_or(0);
            (d.id, extents, max_extents, lv.req_grow)
        })
        .collect();
    sort_lv_requests(&mut lvs);

    let mut chunk = Chunk::new(length);
    let mut order = Vec::with_capacity(lvs.len());
    for (id, extents, max_extents, grow) in lvs.drain(..) {
        let req = if grow {
            let max_growth = if max_extents > extents { max_extents - extents } else { 0 };
            Request::growable(id, extents, max_growth)
        } else {
            Request::fixed(id, extents)
        };
        chunk.add_request(req);
        order.push(id);
    }
    Some((chunk, order))
}

/// Runs the grower over a disk's free capacity, reconciles any
/// registered size-set constraint touching this chunk (§4.5 step 3),
/// then repacks every partition sequentially from the disklabel's first
/// usable sector (§4.5 step 4): each start is aligned up to the
/// disklabel's grain, a logical partition's start is advanced one
/// further grain to leave room for its EBR, and each end is the aligned
/// length past that start. The extended partition's own extents (if
/// any) are not repacked in this pass; they are recomputed afterward
/// from the lowest and highest logical partition bounds (§4.5 step 5).
pub fn grow_partitions(tree: &mut DeviceTree, disk: DeviceId, ctx: &crate::context::Context) -> Option<()> {
    let (mut chunk, order) = disk_chunk(tree, disk)?;
    chunk.grow_requests();

    if !ctx.total_size_sets.is_empty() || !ctx.same_size_sets.is_empty() {
        let relevant_total: Vec<_> =
            ctx.total_size_sets.iter().filter(|s| s.members.iter().any(|m| order.contains(m))).cloned().collect();
        let relevant_same: Vec<_> =
            ctx.same_size_sets.iter().filter(|s| s.members.iter().any(|m| order.contains(m))).cloned().collect();
        if !relevant_total.is_empty() || !relevant_same.is_empty() {
            sizeset::manage_size_sets(
                &relevant_total,
                &relevant_same,
                |id| chunk.request_for(id).map(|r| r.final_size()),
                |id, size| {
                    if let Some(req) = chunk.requests.iter_mut().find(|r| r.device == id) {
                        req.growth = size.saturating_sub(req.base);
                    }
                },
            );
        }
    }

    let disklabel = tree.get(disk)?.format.disklabel()?.clone();
    let ext = super::extended_partition(tree, disk);

    let mut cursor = disklabel.first_usable;
    let mut logical_bounds: Option<(u64, u64)> = None;

    for id in &order {
        let id = *id;
        if Some(id) == ext {
            // recomputed below, once every logical partition it holds
            // has been placed.
            continue;
        }
        let req = chunk.request_for(id)?.clone();
        let part_type = tree.get(id)?.kind.as_partition()?.parted_partition?.part_type;

        let mut start = disklabel.alignment.align_up(cursor);
        if part_type == PartitionType::Logical {
            start = disklabel.alignment.align_up(start + disklabel.alignment.grain_size.max(1));
        }
        let end = (disklabel.alignment.align_up(start + req.final_size()).saturating_sub(1)).min(disklabel.max_end_sector);

        if let Some(data) = tree.get_mut(id)?.kind.as_partition_mut() {
            if let Some(pp) = data.parted_partition.as_mut() {
                pp.start_sector = start;
                pp.end_sector = end;
            }
        }

        if part_type == PartitionType::Logical {
            logical_bounds = Some(match logical_bounds {
                Some((lo, _)) => (lo.min(start), end),
                None => (start, end),
            });
        }

        cursor = end + 1;
    }

    if let (Some(ext_id), Some((logical_start, _))) = (ext, logical_bounds) {
        if let Some(data) = tree.get_mut(ext_id)?.kind.as_partition_mut() {
            if let Some(pp) = data.parted_partition.as_mut() {
                pp.start_sector = logical_start;
                pp.end_sector = disklabel.max_end_sector;
            }
        }
    }

    Some(())
}

/// Runs the grower over a volume group's free extents and writes each
/// growable LV's new extent count back as `used_space`. Thin pool
/// members grow here only if their pinned base itself increased (e.g.
/// more was provisioned into them); their own child LVs are grown
/// separately by [`grow_thin_pool`].
pub fn grow_volume_group(tree: &mut DeviceTree, vg: DeviceId) -> Option<()> {
    let (mut chunk, order) = vg_chunk(tree, vg)?;
    let pool_before = chunk.pool;
    chunk.grow_requests();
    let total_growth = pool_before - chunk.pool;

    let pe_size = tree.get(vg)?.kind.as_vg()?.pe_size.bytes();
    for id in order {
        let req = chunk.request_for(id)?.clone();
        let device = tree.get_mut(id)?;
        if let Some(lv) = device.kind.as_lv_mut() {
            if req.growth > 0 {
                lv.used_space = crate::size::Size(lv.used_space.bytes() + req.growth * pe_size);
            }
        } else if matches!(device.kind, DeviceKind::LvmThinPool(_)) {
            // `req.base` reflects the pinned floor (max of the pool's own
            // size and its children's provisioned total), which may
            // exceed the device's current size even with zero growth.
            device.size = crate::size::Size(req.final_size() * pe_size);
        }
    }
    let vg_device = tree.get_mut(vg)?;
    if let DeviceKind::LvmVolumeGroup(ref mut data) = vg_device.kind {
        data.free_extents = data.free_extents.saturating_sub(total_growth);
    }
    Some(())
}

/// Runs the grower over a thin pool's sub-LVs, writing each growable
/// thin LV's new extent count back as `used_space`.
pub fn grow_thin_pool(tree: &mut DeviceTree, pool: DeviceId, vg: DeviceId) -> Option<()> {
    let (mut chunk, order) = thin_pool_chunk(tree, pool, vg)?;
    chunk.grow_requests();

    let pe_size = tree.get(vg)?.kind.as_vg()?.pe_size.bytes();
    for id in order {
        let req = chunk.request_for(id)?.clone();
        if req.growth == 0 {
            continue;
        }
        let device = tree.get_mut(id)?;
        if let Some(lv) = device.kind.as_lv_mut() {
            lv.used_space = crate::size::Size(lv.used_space.bytes() + req.growth * pe_size);
        }
    }
    Some(())
}

/// Runs the full LVM grower pipeline for one volume group (§4.5 "LVM
/// grower"): resolve percentage-based LVs, grow ordinary members and
/// thin pool bases via the VG chunk, auto-tune each thin pool's
/// metadata reservation, then grow each thin pool's own sub-LVs.
pub fn grow_lvm(tree: &mut DeviceTree, vg: DeviceId) -> Result<(), PartitioningError> {
    resolve_percent_lvs(tree, vg)?;
    grow_volume_group(tree, vg);

    let pools: Vec<DeviceId> =
        tree.iter().filter(|d| matches!(d.kind, DeviceKind::LvmThinPool(_)) && d.parents.contains(&vg)).map(|d| d.id).collect();

    for &pool in &pools {
        tune_thin_pool_metadata(tree, pool, vg);
    }
    for pool in pools {
        grow_thin_pool(tree, pool, vg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, LogicalVolumeData, LvOrigin, SegType, ThinPoolData, VolumeGroupData};
    use crate::size::Size;

    fn id(n: u64) -> DeviceId { DeviceId(n) }

    fn lv(vg: DeviceId, pool: Option<DeviceId>, used_space_extents: u64, pe_size: u64) -> LogicalVolumeData {
        LogicalVolumeData {
            vg: Some(vg),
            pool,
            seg_type: SegType::Linear,
            req_percent: None,
            req_grow: false,
            req_max_size: None,
            cache_request: None,
            origin: LvOrigin::Plain,
            metadata_size: Size(0),
            used_space: Size(used_space_extents * pe_size),
        }
    }

    /// A 1000-extent VG with a percent-based LV requesting 20% and a
    /// fixed LV; the percent LV resolves before any proportional growth
    /// runs.
    #[test]
    fn resolve_percent_lvs_sizes_before_grow() {
        let pe_size = Size::from_mib(4).bytes();
        let mut tree = DeviceTree::new();
        let vg_id = tree.next_id();
        tree.add(Device::new(vg_id, "vg0", Size(0), DeviceKind::LvmVolumeGroup(VolumeGroupData {
            pe_size: Size(pe_size),
            extents: 1000,
            free_extents: 1000,
            reserved_space: Size(0),
            pmspare_size: Size(0),
        })))
        .unwrap();

        let lv_id = tree.next_id();
        let mut data = lv(vg_id, None, 0, pe_size);
        data.req_percent = Some(20);
        tree.add(Device::new(lv_id, "root", Size(0), DeviceKind::LvmLogicalVolume(data)).with_parent(vg_id)).unwrap();

        resolve_percent_lvs(&mut tree, vg_id).unwrap();

        let resolved = tree.get(lv_id).unwrap().kind.as_lv().unwrap();
        assert_eq!(resolved.used_space.bytes() / pe_size, 200);
        assert!(!resolved.req_grow);
        assert_eq!(tree.get(vg_id).unwrap().kind.as_vg().unwrap().free_extents, 800);
    }

    /// Two percent LVs summing above 100% are rejected.
    #[test]
    fn resolve_percent_lvs_rejects_overcommit() {
        let pe_size = Size::from_mib(4).bytes();
        let mut tree = DeviceTree::new();
        let vg_id = tree.next_id();
        tree.add(Device::new(vg_id, "vg0", Size(0), DeviceKind::LvmVolumeGroup(VolumeGroupData {
            pe_size: Size(pe_size),
            extents: 1000,
            free_extents: 1000,
            reserved_space: Size(0),
            pmspare_size: Size(0),
        })))
        .unwrap();

        for i in 0..2 {
            let lv_id = tree.next_id();
            let mut data = lv(vg_id, None, 0, pe_size);
            data.req_percent = Some(60);
            tree.add(Device::new(lv_id, format!("lv{i}"), Size(0), DeviceKind::LvmLogicalVolume(data)).with_parent(vg_id)).unwrap();
        }

        assert!(resolve_percent_lvs(&mut tree, vg_id).is_err());
    }

    /// A thin pool whose own declared size undershoots what its child
    /// already consumes is pinned up to the child's provisioned total
    /// in the VG chunk, and its child is excluded from the VG-level
    /// competition entirely.
    #[test]
    fn thin_pool_base_pinned_to_children() {
        let pe_size = Size::from_mib(4).bytes();
        let mut tree = DeviceTree::new();
        let vg_id = tree.next_id();
        tree.add(Device::new(vg_id, "vg0", Size(0), DeviceKind::LvmVolumeGroup(VolumeGroupData {
            pe_size: Size(pe_size),
            extents: 1000,
            free_extents: 1000,
            reserved_space: Size(0),
            pmspare_size: Size(0),
        })))
        .unwrap();

        let pool_id = tree.next_id();
        tree.add(
            Device::new(pool_id, "pool0", Size(10 * pe_size), DeviceKind::LvmThinPool(ThinPoolData { pe_size: Size(pe_size), pool_len: 10 }))
                .with_parent(vg_id),
        )
        .unwrap();

        let child_id = tree.next_id();
        let child = lv(vg_id, Some(pool_id), 50, pe_size);
        tree.add(Device::new(child_id, "thinlv", Size(0), DeviceKind::LvmLogicalVolume(child)).with_parent(pool_id)).unwrap();

        let (chunk, order) = vg_chunk(&tree, vg_id).unwrap();
        let pool_req = chunk.request_for(pool_id).unwrap();
        assert_eq!(pool_req.base, 50);
        assert!(order.contains(&pool_id));
        assert!(!order.contains(&child_id));
    }

    /// A thin pool with headroom between its declared size and its
    /// child's current usage lets the child grow via `grow_thin_pool`.
    #[test]
    fn thin_pool_child_grows_within_pool_headroom() {
        let pe_size = Size::from_mib(4).bytes();
        let mut tree = DeviceTree::new();
        let vg_id = tree.next_id();
        tree.add(Device::new(vg_id, "vg0", Size(0), DeviceKind::LvmVolumeGroup(VolumeGroupData {
            pe_size: Size(pe_size),
            extents: 1000,
            free_extents: 1000,
            reserved_space: Size(0),
            pmspare_size: Size(0),
        })))
        .unwrap();

        let pool_id = tree.next_id();
        tree.add(
            Device::new(pool_id, "pool0", Size(100 * pe_size), DeviceKind::LvmThinPool(ThinPoolData { pe_size: Size(pe_size), pool_len: 100 }))
                .with_parent(vg_id),
        )
        .unwrap();

        let child_id = tree.next_id();
        let mut child = lv(vg_id, Some(pool_id), 50, pe_size);
        child.req_grow = true;
        tree.add(Device::new(child_id, "thinlv", Size(0), DeviceKind::LvmLogicalVolume(child)).with_parent(pool_id)).unwrap();

        grow_lvm(&mut tree, vg_id).unwrap();

        let grown_child = tree.get(child_id).unwrap().kind.as_lv().unwrap();
        assert_eq!(grown_child.used_space.bytes() / pe_size, 100);
    }

    /// A 100 MiB chunk (204768 sectors) with a fixed 7 MiB request and
    /// four growable requests, two of them capped.
    #[test]
    fn disk_chunk_distributes_proportionally() {
        let mib = 2048u64;
        let mut chunk = Chunk::new(204768);
        chunk.add_request(Request::growable(id(1), 10 * mib, 0));
        chunk.add_request(Request::growable(id(2), 30 * mib, 0));
        chunk.add_request(Request::growable(id(3), 10 * mib, 2 * mib));
        chunk.add_request(Request::fixed(id(4), 7 * mib));
        chunk.add_request(Request::growable(id(5), 5 * mib, 1 * mib));

        chunk.grow_requests();

        assert_eq!(chunk.request_for(id(1)).unwrap().growth, 17912);
        assert_eq!(chunk.request_for(id(2)).unwrap().growth, 53736);
        assert_eq!(chunk.request_for(id(3)).unwrap().growth, 4096);
        assert_eq!(chunk.request_for(id(4)).unwrap().growth, 0);
        assert_eq!(chunk.request_for(id(5)).unwrap().growth, 2048);
    }

    /// A 40 GiB VG (10240 extents at 4 MiB/extent) with three LVs, one
    /// capped at 12 GiB.
    #[test]
    fn vg_chunk_distributes_proportionally() {
        let extent = 1u64; // extents are already the native unit
        let mut chunk = Chunk::new(10240 * extent);
        chunk.add_request(Request::growable(id(1), 256, 0));
        chunk.add_request(Request::growable(id(2), 2560, 0));
        chunk.add_request(Request::growable(id(3), 2560, 3072));

        chunk.grow_requests();

        assert_eq!(chunk.request_for(id(1)).unwrap().growth, 395);
        assert_eq!(chunk.request_for(id(2)).unwrap().growth, 3956);
        assert_eq!(chunk.request_for(id(3)).unwrap().growth, 512);
        // one extent of floor-rounding error is left unassigned rather
        // than force-fed to an arbitrary survivor.
        assert_eq!(chunk.pool, 1);
    }

    #[test]
    fn all_fixed_requests_leave_pool_untouched() {
        let mut chunk = Chunk::new(1000);
        chunk.add_request(Request::fixed(id(1), 400));
        chunk.add_request(Request::fixed(id(2), 400));
        chunk.grow_requests();
        assert_eq!(chunk.pool, 200);
        assert_eq!(chunk.request_for(id(1)).unwrap().growth, 0);
    }

    /// A zero-base growable request (e.g. a not-yet-percent-resolved
    /// LV) has no share of the pool by the base-proportional formula;
    /// once it is the sole survivor the residual step hands it the
    /// rest rather than stranding it at zero.
    #[test]
    fn sole_zero_base_survivor_absorbs_residual() {
        let mut chunk = Chunk::new(10);
        chunk.add_request(Request::fixed(id(1), 7));
        chunk.add_request(Request::growable(id(2), 0, 0));
        chunk.grow_requests();
        assert_eq!(chunk.request_for(id(2)).unwrap().growth, 3);
        assert_eq!(chunk.pool, 0);
    }
}
