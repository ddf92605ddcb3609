//! The device tree (§4.1): owns every `Device` currently modeled,
//! assigns ids, enforces the uniqueness/DAG invariants, and supports
//! hiding subtrees.

use std::collections::HashMap;

use log::{debug, info};

use super::{Device, DeviceId, DeviceKind};
use crate::error::TreeError;

/// An event the tree emits synchronously as `add`/`remove` run. Queued
/// on the tree and drained by the embedding caller with `take_events`
/// rather than invoked through a callback, so tree mutation stays
/// synchronous and side-effect free outside of this buffer.
#[derive(Debug, Clone)]
pub enum TreeEvent {
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
}

/// The device arena. Devices reference each other only by `DeviceId`;
/// the tree is the sole owner of `Device` values (§9 "Cyclic
/// references").
///
/// `Clone` is used by the allocator to run cheap, revertible "what if"
/// simulations (§4.4 step 3, §5 "every such simulation must remove its
/// temporary partition before returning control") without needing a
/// snapshot/undo log on the real tree.
#[derive(Clone)]
pub struct DeviceTree {
    devices:  HashMap<DeviceId, Device>,
    hidden:   HashMap<DeviceId, Device>,
    next_id:  u64,
    events:   Vec<TreeEvent>,
}

impl Default for DeviceTree {
    fn default() -> DeviceTree { DeviceTree::new() }
}

impl DeviceTree {
    pub fn new() -> DeviceTree {
        DeviceTree { devices: HashMap::new(), hidden: HashMap::new(), next_id: 1, events: Vec::new() }
    }

    /// Allocates the next process-wide unique device id.
    pub fn next_id(&mut self) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn take_events(&mut self) -> Vec<TreeEvent> { std::mem::take(&mut self.events) }

    pub fn get(&self, id: DeviceId) -> Option<&Device> { self.devices.get(&id) }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> { self.devices.get_mut(&id) }

    pub fn contains(&self, id: DeviceId) -> bool { self.devices.contains_key(&id) }

    pub fn iter(&self) -> impl Iterator<Item = &Device> { self.devices.values() }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> { self.devices.values_mut() }

    pub fn len(&self) -> usize { self.devices.len() }

    pub fn is_empty(&self) -> bool { self.devices.is_empty() }

    /// Inserts `device`. Fails on a duplicate uuid (excluding
    /// placeholder devices, i.e. those with `uuid = None`) or on a
    /// parent that is not already in the tree.
    pub fn add(&mut self, device: Device) -> Result<DeviceId, TreeError> {
        info!("adding device {:?} ({})", device.id, device.name);

        if let Some(ref uuid) = device.uuid {
            if let Some(existing) = self.devices.values().find(|d| d.uuid.as_deref() == Some(uuid.as_str())) {
                if existing.id != device.id {
                    return Err(TreeError::DuplicateUuid { id: device.id, uuid: uuid.clone() });
                }
            }
        }

        for &parent in &device.parents {
            if !self.devices.contains_key(&parent) {
                return Err(TreeError::ParentNotInTree { id: device.id, parent });
            }
        }

        let id = device.id;
        self.devices.insert(id, device);
        self.events.push(TreeEvent::DeviceAdded(id));
        Ok(id)
    }

    /// True iff no other tree device lists `id` in its `parents`.
    pub fn is_leaf(&self, id: DeviceId) -> bool {
        !self.devices.values().any(|d| d.parents.contains(&id))
    }

    fn children_of(&self, id: DeviceId) -> Vec<DeviceId> {
        self.devices.values().filter(|d| d.parents.contains(&id)).map(|d| d.id).collect()
    }

    /// Removes a leaf device (or any device if `force`). When
    /// `modparent` is set and `id` is a partition, sibling partitions on
    /// the same disk have their names refreshed to account for
    /// renumbering.
    pub fn remove(&mut self, id: DeviceId, force: bool, modparent: bool) -> Result<Device, TreeError> {
        info!("removing device {:?} (force={})", id, force);

        if !force && !self.is_leaf(id) {
            return Err(TreeError::NotALeaf { id });
        }

        let device = self.devices.remove(&id).ok_or(TreeError::NotInTree { id })?;
        self.events.push(TreeEvent::DeviceRemoved(id));

        if modparent {
            if let DeviceKind::Partition(ref data) = device.kind {
                if let Some(disk) = data.disk {
                    self.renumber_partitions(disk);
                }
            }
        }

        Ok(device)
    }

    /// Re-reads the canonical name for every partition of `disk`,
    /// accounting for a renumbering left by a prior removal. Mirrors
    /// the device hook `update_name()` (§6) but applied tree-wide.
    fn renumber_partitions(&mut self, disk: DeviceId) {
        let Some(disk_name) = self.get(disk).map(|d| d.name.clone()) else { return };
        let mut children: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| d.kind.as_partition().map(|p| p.disk) == Some(Some(disk)))
            .map(|d| d.id)
            .collect();
        children.sort_by_key(|&id| {
            self.get(id).and_then(|d| d.kind.as_partition()).and_then(|p| p.number).unwrap_or(u32::MAX)
        });
        for (idx, id) in children.into_iter().enumerate() {
            let number = (idx + 1) as u32;
            if let Some(device) = self.devices.get_mut(&id) {
                if let DeviceKind::Partition(ref mut data) = device.kind {
                    data.number = Some(number);
                }
                device.name = format!("{}{}", disk_name, number);
                debug!("renumbered {:?} to {}", id, device.name);
            }
        }
    }

    /// When `remove_device` is set, repeatedly peels and removes every
    /// descendant leaf of `id` (leaves first) until none remain. When
    /// unset, nothing is removed — the current leaf set under `id` is
    /// returned once so the caller can queue its own teardown actions
    /// and call again as those actions complete. When `id` names a
    /// disk, the disk's format is cleared but the disk device itself is
    /// retained.
    pub fn recursive_remove(&mut self, id: DeviceId, remove_device: bool) -> Result<Vec<DeviceId>, TreeError> {
        let mut removed = Vec::new();
        if remove_device {
            loop {
                let leaves: Vec<DeviceId> =
                    self.descendants(id).into_iter().filter(|&d| d != id && self.is_leaf(d)).collect();
                if leaves.is_empty() {
                    break;
                }
                for leaf in leaves {
                    self.remove(leaf, true, true)?;
                    removed.push(leaf);
                }
            }
        } else {
            removed = self.descendants(id).into_iter().filter(|&d| d != id && self.is_leaf(d)).collect();
        }

        if let Some(device) = self.devices.get_mut(&id) {
            if matches!(device.kind, DeviceKind::Disk) {
                device.format = super::format::DeviceFormat::none();
            } else if remove_device {
                self.remove(id, true, true)?;
                removed.push(id);
            }
        }

        Ok(removed)
    }

    /// `id` and every device reachable from it by following `parents`
    /// relations downward (i.e. every descendant, inclusive).
    pub fn descendants(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut seen = vec![id];
        let mut frontier = vec![id];
        while let Some(cur) = frontier.pop() {
            for child in self.children_of(cur) {
                if !seen.contains(&child) {
                    seen.push(child);
                    frontier.push(child);
                }
            }
        }
        seen
    }

    /// The reflexive-transitive closure of the parent relation: true if
    /// `other` is `id` or an ancestor of `id`.
    pub fn depends_on(&self, id: DeviceId, other: DeviceId) -> bool {
        if id == other {
            return true;
        }
        let Some(device) = self.get(id) else { return false };
        device.parents.iter().any(|&p| self.depends_on(p, other))
    }

    pub fn by_name(&self, name: &str) -> Option<&Device> { self.devices.values().find(|d| d.name == name) }

    pub fn by_uuid(&self, uuid: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.uuid.as_deref() == Some(uuid))
    }

    pub fn by_label(&self, label: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.format.common.label.as_deref() == Some(label))
    }

    pub fn by_id(&self, id: DeviceId) -> Option<&Device> { self.get(id) }

    /// Lookup by device-node path. When more than one device has the
    /// same path (shouldn't normally happen, but may transiently during
    /// a commit), a leaf is preferred over an interior node.
    pub fn by_path(&self, path: &std::path::Path) -> Option<&Device> {
        let mut matches: Vec<&Device> = self.devices.values().filter(|d| d.path.as_deref() == Some(path)).collect();
        matches.sort_by_key(|d| !self.is_leaf(d.id));
        matches.into_iter().next()
    }

    /// Parses a device specifier into a resolved device, per the forms
    /// listed in §4.1: `UUID=x`, `LABEL=x`, `/dev/name`, `0xNN[pM]`
    /// (BIOS drive+partnum — not resolvable without BIOS drive-order
    /// data, so returns `None`), bare name, `/dev/vg/lv`, DM/MD name,
    /// and Btrfs `subvol=`/`subvolid=` options (also unresolvable here;
    /// left to the population step that knows the subvolume table).
    pub fn resolve_device(&self, spec: &str) -> Option<&Device> {
        if let Some(uuid) = spec.strip_prefix("UUID=") {
            return self.by_uuid(uuid);
        }
        if let Some(label) = spec.strip_prefix("LABEL=") {
            return self.by_label(label);
        }
        if spec.starts_with("0x") {
            return None;
        }
        if let Some(rest) = spec.strip_prefix("/dev/") {
            if let Some(device) = self.by_path(std::path::Path::new(spec)) {
                return Some(device);
            }
            // `/dev/vg/lv` style paths: the name of the LV is the final
            // path component.
            if let Some(name) = rest.rsplit('/').next() {
                return self.by_name(name);
            }
            return None;
        }
        self.by_name(spec)
    }

    /// Moves `device` and every descendant (leaves first) to the hidden
    /// set. Does not cancel queued actions itself — the caller (the
    /// `ActionQueue`) must cancel actions touching the subtree first.
    pub fn hide(&mut self, id: DeviceId) -> Result<(), TreeError> {
        let mut order = self.descendants(id);
        // leaves first: a leaf's own descendant closure is just itself,
        // so the smallest closures sort earliest.
        order.sort_by_key(|&d| self.descendants(d).len());
        for d in order {
            if let Some(device) = self.devices.remove(&d) {
                self.hidden.insert(d, device);
            }
        }
        Ok(())
    }

    /// Reverses `hide` in leaves-first order. Does **not** re-queue any
    /// actions that were cancelled when the subtree was hidden (§4.1).
    pub fn unhide(&mut self, id: DeviceId) -> Result<(), TreeError> {
        let to_move: Vec<DeviceId> =
            self.hidden.keys().copied().filter(|&d| d == id || self.hidden_descendant_of(d, id)).collect();
        // leaves first: sort by how many other members of this subtree
        // are hidden-descendants of each candidate (0 for a leaf).
        let mut to_move = to_move;
        to_move.sort_by_key(|&d| to_move.iter().filter(|&&o| o != d && self.hidden_descendant_of(o, d)).count());
        for d in to_move {
            if let Some(device) = self.hidden.remove(&d) {
                self.devices.insert(d, device);
            }
        }
        Ok(())
    }

    fn hidden_descendant_of(&self, candidate: DeviceId, root: DeviceId) -> bool {
        let Some(device) = self.hidden.get(&candidate) else { return false };
        device.parents.iter().any(|&p| p == root || self.hidden_descendant_of(p, root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::Size;

    fn disk(tree: &mut DeviceTree) -> DeviceId {
        let id = tree.next_id();
        tree.add(Device::new(id, "sda", Size::from_gib(10), DeviceKind::Disk)).unwrap()
    }

    #[test]
    fn parent_must_be_in_tree_first() {
        let mut tree = DeviceTree::new();
        let missing = DeviceId(99);
        let id = tree.next_id();
        let part = Device::new(id, "sda1", Size::from_mib(100), DeviceKind::Partition(Default::default()))
            .with_parent(missing);
        assert!(matches!(tree.add(part), Err(TreeError::ParentNotInTree { .. })));
    }

    #[test]
    fn duplicate_uuid_rejected() {
        let mut tree = DeviceTree::new();
        let id1 = tree.next_id();
        tree.add(Device::new(id1, "sda", Size::from_gib(1), DeviceKind::Disk).with_uuid("abc")).unwrap();
        let id2 = tree.next_id();
        let res = tree.add(Device::new(id2, "sdb", Size::from_gib(1), DeviceKind::Disk).with_uuid("abc"));
        assert!(matches!(res, Err(TreeError::DuplicateUuid { .. })));
    }

    #[test]
    fn leaf_detection() {
        let mut tree = DeviceTree::new();
        let d = disk(&mut tree);
        assert!(tree.is_leaf(d));
        let p = tree.next_id();
        tree.add(
            Device::new(p, "sda1", Size::from_mib(100), DeviceKind::Partition(Default::default())).with_parent(d),
        )
        .unwrap();
        assert!(!tree.is_leaf(d));
        assert!(tree.is_leaf(p));
    }

    #[test]
    fn remove_non_leaf_without_force_fails() {
        let mut tree = DeviceTree::new();
        let d = disk(&mut tree);
        let p = tree.next_id();
        tree.add(
            Device::new(p, "sda1", Size::from_mib(100), DeviceKind::Partition(Default::default())).with_parent(d),
        )
        .unwrap();
        assert!(matches!(tree.remove(d, false, true), Err(TreeError::NotALeaf { .. })));
        assert!(tree.remove(d, true, true).is_ok());
    }

    #[test]
    fn add_then_remove_restores_tree() {
        let mut tree = DeviceTree::new();
        let d = disk(&mut tree);
        let before = tree.len();
        tree.remove(d, true, true).unwrap();
        assert_eq!(tree.len(), before - 1);
    }

    #[test]
    fn resolve_by_uuid_and_label() {
        let mut tree = DeviceTree::new();
        let id = tree.next_id();
        tree.add(Device::new(id, "sda", Size::from_gib(1), DeviceKind::Disk).with_uuid("beef")).unwrap();
        assert_eq!(tree.resolve_device("UUID=beef").map(|d| d.id), Some(id));
        assert_eq!(tree.resolve_device("sda").map(|d| d.id), Some(id));
    }

    #[test]
    fn events_emitted_on_add_and_remove() {
        let mut tree = DeviceTree::new();
        let d = disk(&mut tree);
        tree.remove(d, true, true).unwrap();
        let events = tree.take_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TreeEvent::DeviceAdded(_)));
        assert!(matches!(events[1], TreeEvent::DeviceRemoved(_)));
    }
}
