//! The action queue (§4.3): add/remove with tree side-effects, `find`,
//! `prune` (obsoletes collapsing), `sort` (requires-based topological
//! order), and `process` (the full pre-process/execute/post-process
//! commit pipeline).

use log::{debug, info, warn};

use super::{Action, ActionObject, ActionType};
use crate::{
    callbacks::Callbacks,
    context::Context,
    device::{tree::DeviceTree, DeviceId, DeviceKind},
    error::{StorageError, TreeError},
    partitioning::{allocator, grower},
};

/// An ordered list of pending [`Action`]s plus an append-only log of
/// actions that have successfully executed.
#[derive(Default)]
pub struct ActionQueue {
    actions:           Vec<Action>,
    completed_actions: Vec<Action>,
}

impl ActionQueue {
    pub fn new() -> ActionQueue { ActionQueue::default() }

    pub fn actions(&self) -> &[Action] { &self.actions }

    pub fn completed_actions(&self) -> &[Action] { &self.completed_actions }

    pub fn len(&self) -> usize { self.actions.len() }

    pub fn is_empty(&self) -> bool { self.actions.is_empty() }

    /// Registers `action`, running the domain checks of §4.3 and
    /// applying its tree side-effects synchronously so subsequent
    /// `add` calls see the new state.
    pub fn add(&mut self, action: Action, tree: &mut DeviceTree) -> Result<(), StorageError> {
        info!("queueing action {:?} ({:?} on {:?})", action.id(), action.action_type(), action.device());

        match action.action_type() {
            ActionType::Destroy if action.obj() == ActionObject::Device => {
                if !tree.is_leaf(action.device()) {
                    return Err(TreeError::DestroyNonLeaf { id: action.device() }.into());
                }
            }
            _ => {}
        }

        if !matches!(action, Action::CreateDevice(_)) && !tree.contains(action.device()) {
            return Err(TreeError::UnknownDeviceForAction { id: action.device() }.into());
        }

        if let Action::CreateFormat(ref cf) = action {
            if let Some(ref mp) = cf.new_fmt.common.mountpoint {
                let in_use = tree.iter().any(|d| d.format.common.mountpoint.as_deref() == Some(mp.as_str()));
                if in_use {
                    return Err(TreeError::MountpointInUse { mountpoint: mp.clone() }.into());
                }
            }
        }

        let mut action = action;
        action.apply(tree)?;
        self.actions.push(action);
        Ok(())
    }

    /// The exact inverse of `add`: cancels the action's tree side
    /// effects and drops it from the queue.
    pub fn remove(&mut self, id: super::ActionId, tree: &mut DeviceTree) -> Result<(), StorageError> {
        if let Some(pos) = self.actions.iter().position(|a| a.id() == id) {
            let mut action = self.actions.remove(pos);
            action.cancel(tree)?;
        }
        Ok(())
    }

    /// Returns every queued action matching the given (optional)
    /// filters.
    pub fn find(
        &self,
        device: Option<DeviceId>,
        action_type: Option<ActionType>,
        obj: Option<ActionObject>,
    ) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| device.map_or(true, |d| a.device() == d))
            .filter(|a| action_type.map_or(true, |t| a.action_type() == t))
            .filter(|a| obj.map_or(true, |o| a.obj() == o))
            .collect()
    }

    /// Collapses redundant actions via the `obsoletes` algebra (§4.3):
    /// iterating in reverse, any action an earlier one obsoletes is
    /// dropped; mutually-obsoleting pairs drop both.
    pub fn prune(&mut self, tree: &DeviceTree) {
        debug!("pruning action queue ({} actions)", self.actions.len());
        let mut keep = vec![true; self.actions.len()];

        for i in (0..self.actions.len()).rev() {
            if !keep[i] {
                continue;
            }
            for j in 0..self.actions.len() {
                if i == j || !keep[j] {
                    continue;
                }
                if self.actions[i].obsoletes(&self.actions[j], tree) {
                    keep[j] = false;
                    if self.actions[j].obsoletes(&self.actions[i], tree) {
                        keep[i] = false;
                    }
                }
            }
        }

        let mut idx = 0;
        self.actions.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
    }

    /// Topologically orders the queue by the `requires` relation,
    /// falling back to the generic type-rank edge (higher rank first)
    /// for non-container actions with no direct `requires` ordering.
    pub fn sort(&mut self, tree: &DeviceTree) {
        debug!("sorting action queue ({} actions)", self.actions.len());
        let n = self.actions.len();
        let mut edges = vec![vec![false; n]; n]; // edges[i][j] = i requires j (j before i)

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                if self.actions[i].requires(&self.actions[j], tree) {
                    edges[i][j] = true;
                } else if !is_container(&self.actions[i]) && !is_container(&self.actions[j]) {
                    let rank_i = self.actions[i].action_type().rank();
                    let rank_j = self.actions[j].action_type().rank();
                    if rank_i < rank_j {
                        edges[i][j] = true;
                    }
                }
            }
        }

        let order = topo_sort(n, &edges);
        let mut sorted = Vec::with_capacity(n);
        for idx in order {
            sorted.push(self.actions[idx].clone());
        }
        self.actions = sorted;
    }

    /// The full commit pipeline of §4.3: pre-process (prune, active-
    /// device check, implicit extended-partition creates, sort),
    /// execute loop (with one `DiskLabelCommitError` retry), and post-
    /// process (refresh parted state).
    pub fn process(
        &mut self,
        tree: &mut DeviceTree,
        ctx: &Context,
        dry_run: bool,
        callbacks: &mut Callbacks,
    ) -> Result<(), StorageError> {
        info!("processing action queue: {} actions pending", self.actions.len());
        self.pre_process(tree, ctx)?;

        if dry_run {
            info!("dry run: skipping execute loop");
            return Ok(());
        }

        let mut retried = false;
        let mut i = 0;
        while i < self.actions.len() {
            let result = self.actions[i].execute(tree, callbacks);
            match result {
                Ok(()) => {
                    let finished = self.actions.remove(i);
                    self.completed_actions.push(finished);
                }
                Err(err) if !retried && is_disklabel_commit_error(&err) => {
                    warn!("disklabel commit failed, retrying once: {}", err);
                    retried = true;
                    self.teardown_dependents_of_disk(tree, self.actions[i].device());
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        self.post_process(tree);
        Ok(())
    }

    fn pre_process(&mut self, tree: &mut DeviceTree, ctx: &Context) -> Result<(), StorageError> {
        debug!("pre-process: plan has {} actions", self.actions.len());
        self.prune(tree);

        self.check_active_devices(tree, ctx)?;

        // Any CreateDevice action on a partition that hasn't been given
        // concrete geometry yet is a pending allocation request; run the
        // allocator over all of them together so the specificity sort
        // and free-region scan see the whole batch at once rather than
        // one request at a time.
        let unplaced: Vec<DeviceId> = self
            .actions
            .iter()
            .filter(|a| matches!(a, Action::CreateDevice(_)))
            .map(|a| a.device())
            .filter(|&id| {
                tree.get(id)
                    .and_then(|d| d.kind.as_partition())
                    .is_some_and(|p| p.parted_partition.is_none())
            })
            .collect();

        if !unplaced.is_empty() {
            allocator::allocate_partitions(tree, unplaced, ctx).map_err(|err| StorageError {
                id:     self.actions.first().map(|a| a.device()).unwrap_or(DeviceId(0)),
                action: ActionType::Create,
                why:    err.to_string(),
            })?;
        }

        // Emit implicit CreateDevice actions for any extended partitions
        // auto-created by the allocator but not already scheduled. Per
        // §9 Open Question, these bypass `add`'s checks: apply first,
        // then push directly onto the internal vec.
        let already_scheduled: Vec<DeviceId> = self
            .actions
            .iter()
            .filter(|a| matches!(a, Action::CreateDevice(_)))
            .map(|a| a.device())
            .collect();

        let implicit_extended: Vec<DeviceId> = tree
            .iter()
            .filter(|d| {
                !d.exists
                    && matches!(
                        d.kind.as_partition().and_then(|p| p.parted_partition),
                        Some(p) if p.part_type == crate::device::PartitionType::Extended
                    )
                    && !already_scheduled.contains(&d.id)
            })
            .map(|d| d.id)
            .collect();

        for id in implicit_extended {
            let mut action = Action::CreateDevice(super::CreateDevice::new(tree, id)?);
            action.apply(tree)?;
            self.actions.push(action);
        }

        // Any CreateDevice action on an LV pulls its volume group's
        // proportional grower into play, the VG-side counterpart to the
        // partition allocator's own per-disk grow pass above.
        let pending_vgs: std::collections::HashSet<DeviceId> = self
            .actions
            .iter()
            .filter(|a| matches!(a, Action::CreateDevice(_)))
            .filter_map(|a| tree.get(a.device()).and_then(|d| d.kind.as_lv()).and_then(|lv| lv.vg))
            .collect();

        for vg in pending_vgs {
            grower::grow_lvm(tree, vg).map_err(|err| StorageError { id: vg, action: ActionType::Create, why: err.to_string() })?;
        }

        self.sort(tree);
        Ok(())
    }

    /// §4.3.1: computes the disks whose disklabels will be altered by
    /// this commit and checks for non-disk, non-partition devices
    /// currently active whose disk-set intersects. Installer mode tears
    /// them down best-effort; otherwise this is a hard error.
    fn check_active_devices(&self, tree: &mut DeviceTree, ctx: &Context) -> Result<(), StorageError> {
        let affected_disks: Vec<DeviceId> = self
            .actions
            .iter()
            .filter_map(|a| tree.get(a.device()))
            .filter_map(|d| d.kind.as_partition().and_then(|p| p.disk))
            .collect();

        if affected_disks.is_empty() {
            return Ok(());
        }

        let conflicts: Vec<DeviceId> = tree
            .iter()
            .filter(|d| d.exists && !matches!(d.kind, DeviceKind::Disk | DeviceKind::Partition(_)))
            .filter(|d| {
                d.parents
                    .iter()
                    .any(|&p| tree.get(p).and_then(|pd| pd.kind.as_partition()).and_then(|pd| pd.disk).is_some_and(|disk| affected_disks.contains(&disk)))
            })
            .map(|d| d.id)
            .collect();

        if conflicts.is_empty() {
            return Ok(());
        }

        if ctx.installer_mode {
            for id in conflicts {
                if tree.get(id).map(|d| d.protected).unwrap_or(true) {
                    continue;
                }
                warn!("installer mode: tearing down conflicting active device {:?}", id);
                let _ = tree.recursive_remove(id, true);
            }
            Ok(())
        } else {
            Err(StorageError {
                id:     affected_disks[0],
                action: ActionType::None,
                why:    format!("active devices conflict with planned disklabel changes: {:?}", conflicts),
            })
        }
    }

    fn teardown_dependents_of_disk(&self, tree: &mut DeviceTree, disk: DeviceId) {
        let dependents: Vec<DeviceId> =
            tree.iter().filter(|d| d.exists && tree.depends_on(d.id, disk) && d.id != disk).map(|d| d.id).collect();
        for id in dependents {
            let _ = tree.recursive_remove(id, true);
        }
    }

    fn post_process(&mut self, tree: &mut DeviceTree) {
        debug!("post-process: refreshing partitioned-disk state");
        for device in tree.iter_mut() {
            if matches!(device.kind, DeviceKind::Disk) {
                // Refreshing `parted_disk`/`parted_partition` against the
                // live host is a device-hook concern, out of this crate's
                // scope (§1); the in-memory geometry the allocator wrote
                // is already authoritative here.
            }
        }
    }
}

fn is_container(action: &Action) -> bool { matches!(action, Action::AddMember(_) | Action::RemoveMember(_)) }

fn is_disklabel_commit_error(err: &StorageError) -> bool { err.why.contains("disklabel") }

/// Kahn's algorithm over `edges[i][j] == true` meaning "i requires j"
/// (j must come before i). Returns an order where every `i` appears
/// after every `j` it requires.
fn topo_sort(n: usize, edges: &[Vec<bool>]) -> Vec<usize> {
    // A node can be placed once every node it requires has already been
    // placed.
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut progress = true;

    while order.len() < n && progress {
        progress = false;
        for i in 0..n {
            if placed[i] {
                continue;
            }
            let ready = (0..n).all(|j| !edges[i][j] || placed[j]);
            if ready {
                placed[i] = true;
                order.push(i);
                progress = true;
            }
        }
    }

    // Any remaining nodes form a cycle (shouldn't happen for a
    // well-formed action set); append them in original order rather
    // than panicking, since sort() must be total.
    for (i, &p) in placed.iter().enumerate() {
        if !p {
            order.push(i);
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::{Device, DeviceKind, PartitionData}, size::Size};

    fn tree_with_disk() -> (DeviceTree, DeviceId) {
        let mut tree = DeviceTree::new();
        let id = tree.next_id();
        tree.add(Device::new(id, "sda", Size::from_gib(1), DeviceKind::Disk)).unwrap();
        (tree, id)
    }

    #[test]
    fn add_applies_side_effects() {
        let (mut tree, id) = tree_with_disk();
        let mut queue = ActionQueue::new();
        let action = Action::CreateDevice(super::super::CreateDevice::new(&tree, id).unwrap());
        queue.add(action, &mut tree).unwrap();
        assert!(tree.get(id).unwrap().exists);
    }

    #[test]
    fn destroy_of_non_leaf_rejected() {
        let (mut tree, disk) = tree_with_disk();
        let part_id = tree.next_id();
        tree.add(
            Device::new(part_id, "sda1", Size::from_mib(100), DeviceKind::Partition(PartitionData {
                disk: Some(disk),
                ..Default::default()
            }))
            .with_parent(disk)
            .with_exists(true),
        )
        .unwrap();
        tree.get_mut(disk).unwrap().exists = true;

        let mut queue = ActionQueue::new();
        let destroy = Action::DestroyDevice(super::super::DestroyDevice::new(disk));
        assert!(queue.add(destroy, &mut tree).is_err());
    }

    #[test]
    fn sort_respects_requires() {
        let (mut tree, disk) = tree_with_disk();
        let p1 = tree.next_id();
        tree.add(
            Device::new(p1, "sda1", Size::from_mib(100), DeviceKind::Partition(PartitionData {
                disk: Some(disk),
                number: Some(1),
                ..Default::default()
            }))
            .with_parent(disk),
        )
        .unwrap();
        let p2 = tree.next_id();
        tree.add(
            Device::new(p2, "sda2", Size::from_mib(100), DeviceKind::Partition(PartitionData {
                disk: Some(disk),
                number: Some(2),
                ..Default::default()
            }))
            .with_parent(disk),
        )
        .unwrap();

        let mut queue = ActionQueue::new();
        // push p2's create before p1's; sort must put p1 (lower number)
        // first since CreateDevice.requires ascending-number order.
        let a2 = Action::CreateDevice(super::super::CreateDevice::new(&tree, p2).unwrap());
        let a1 = Action::CreateDevice(super::super::CreateDevice::new(&tree, p1).unwrap());
        queue.add(a2, &mut tree).unwrap();
        queue.add(a1, &mut tree).unwrap();
        queue.sort(&tree);

        assert_eq!(queue.actions()[0].device(), p1);
        assert_eq!(queue.actions()[1].device(), p2);
    }

    #[test]
    fn prune_is_idempotent() {
        let (mut tree, id) = tree_with_disk();
        let mut queue = ActionQueue::new();
        let a1 = Action::CreateDevice(super::super::CreateDevice::new(&tree, id).unwrap());
        queue.add(a1, &mut tree).unwrap();
        queue.prune(&tree);
        let len_once = queue.len();
        queue.prune(&tree);
        assert_eq!(queue.len(), len_once);
    }
}
