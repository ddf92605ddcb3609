//! The action model (§4.2): reified, reversible modifications to the
//! device tree, each with `requires`/`obsoletes` algebra used by the
//! queue to order and prune a pending commit.

pub mod queue;

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

pub use self::queue::ActionQueue;
use crate::{
    callbacks::Callbacks,
    device::{format::DeviceFormat, tree::DeviceTree, DeviceId, DeviceKind},
    error::{StorageError, TreeError},
    size::Size,
};

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide monotonic action id, assigned at construction.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct ActionId(pub u64);

fn next_action_id() -> ActionId { ActionId(NEXT_ACTION_ID.fetch_add(1, Ordering::SeqCst)) }

/// Ordering hint only: the generic "higher type value goes first" edge
/// used by `ActionQueue::sort` as a tie-break when no `requires`
/// relation orders two actions directly. Container actions (Add/
/// Remove) are excluded from this edge (§4.3); their orderings come
/// entirely from `requires`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ActionType {
    None,
    Configure,
    Add,
    Remove,
    Create,
    Resize,
    Destroy,
}

impl ActionType {
    fn rank(self) -> i32 {
        match self {
            ActionType::None => 0,
            ActionType::Configure => 1,
            ActionType::Add | ActionType::Remove => 2,
            ActionType::Create => 3,
            ActionType::Resize => 4,
            ActionType::Destroy => 5,
        }
    }
}

/// What an action's operand is: a format, a whole device, or a
/// container's membership.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ActionObject {
    None,
    Format,
    Device,
    Container,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ResizeDir {
    Shrink,
    Grow,
}

#[derive(Debug, Clone)]
pub struct CreateDevice {
    pub id:     ActionId,
    pub device: DeviceId,
    applied:    bool,
}

impl CreateDevice {
    pub fn new(tree: &DeviceTree, device: DeviceId) -> Result<CreateDevice, TreeError> {
        let d = tree.get(device).ok_or(TreeError::NotInTree { id: device })?;
        if d.exists {
            return Err(TreeError::DeviceAlreadyExists { id: device });
        }
        Ok(CreateDevice { id: next_action_id(), device, applied: false })
    }
}

#[derive(Debug, Clone)]
pub struct DestroyDevice {
    pub id:     ActionId,
    pub device: DeviceId,
    applied:    bool,
    /// Counter forcing activation during teardown. Guarded by
    /// `applied` so repeated `apply()` calls are idempotent (§9 Open
    /// Question, decided).
    pub ignore_skip_activation: u32,
}

impl DestroyDevice {
    pub fn new(device: DeviceId) -> DestroyDevice {
        DestroyDevice { id: next_action_id(), device, applied: false, ignore_skip_activation: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct CreateFormat {
    pub id:       ActionId,
    pub device:   DeviceId,
    pub new_fmt:  DeviceFormat,
    orig_fmt:     Option<DeviceFormat>,
    applied:      bool,
}

impl CreateFormat {
    pub fn new(device: DeviceId, new_fmt: DeviceFormat) -> CreateFormat {
        CreateFormat { id: next_action_id(), device, new_fmt, orig_fmt: None, applied: false }
    }
}

#[derive(Debug, Clone)]
pub struct DestroyFormat {
    pub id:     ActionId,
    pub device: DeviceId,
    /// Whether the format being destroyed already existed on the host
    /// at construction time (vs. a not-yet-committed planned format).
    pub fmt_existed: bool,
    orig_fmt:   Option<DeviceFormat>,
    applied:    bool,
}

impl DestroyFormat {
    pub fn new(tree: &DeviceTree, device: DeviceId) -> Result<DestroyFormat, TreeError> {
        let d = tree.get(device).ok_or(TreeError::NotInTree { id: device })?;
        Ok(DestroyFormat { id: next_action_id(), device, fmt_existed: d.format.common.exists, orig_fmt: None, applied: false })
    }
}

#[derive(Debug, Clone)]
pub struct ResizeDevice {
    pub id:       ActionId,
    pub device:   DeviceId,
    pub new_size: Size,
    orig_size:    Option<Size>,
    pub dir:      ResizeDir,
    applied:      bool,
}

impl ResizeDevice {
    pub fn new(tree: &DeviceTree, device: DeviceId, new_size: Size) -> Result<ResizeDevice, TreeError> {
        let d = tree.get(device).ok_or(TreeError::NotInTree { id: device })?;
        if !d.format.common.resizable && !matches!(d.kind, DeviceKind::Partition(_) | DeviceKind::LvmLogicalVolume(_)) {
            return Err(TreeError::NotResizable { id: device });
        }
        if new_size == d.size {
            return Err(TreeError::SizeUnchanged { id: device });
        }
        let dir = if new_size > d.size { ResizeDir::Grow } else { ResizeDir::Shrink };
        Ok(ResizeDevice { id: next_action_id(), device, new_size, orig_size: None, dir, applied: false })
    }
}

#[derive(Debug, Clone)]
pub struct ResizeFormat {
    pub id:       ActionId,
    pub device:   DeviceId,
    pub new_size: Size,
    orig_size:    Option<Size>,
    pub dir:      ResizeDir,
    applied:      bool,
}

impl ResizeFormat {
    pub fn new(tree: &DeviceTree, device: DeviceId, new_size: Size) -> Result<ResizeFormat, TreeError> {
        let d = tree.get(device).ok_or(TreeError::NotInTree { id: device })?;
        if !d.format.common.resizable {
            return Err(TreeError::NotResizable { id: device });
        }
        if new_size < d.format.common.min_size || d.format.common.max_size.is_some_and(|m| new_size > m) {
            return Err(TreeError::SizeOutOfBounds { id: device });
        }
        let dir = if new_size > d.format.common.current_size { ResizeDir::Grow } else { ResizeDir::Shrink };
        Ok(ResizeFormat { id: next_action_id(), device, new_size, orig_size: None, dir, applied: false })
    }
}

#[derive(Debug, Clone)]
pub struct AddMember {
    pub id:        ActionId,
    pub container: DeviceId,
    pub device:    DeviceId,
    applied:       bool,
}

impl AddMember {
    pub fn new(container: DeviceId, device: DeviceId) -> AddMember {
        AddMember { id: next_action_id(), container, device, applied: false }
    }
}

#[derive(Debug, Clone)]
pub struct RemoveMember {
    pub id:        ActionId,
    pub container: DeviceId,
    pub device:    DeviceId,
    orig_parents:  Option<Vec<DeviceId>>,
    applied:       bool,
}

impl RemoveMember {
    pub fn new(container: DeviceId, device: DeviceId) -> RemoveMember {
        RemoveMember { id: next_action_id(), container, device, orig_parents: None, applied: false }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigureDevice {
    pub id:        ActionId,
    pub device:    DeviceId,
    pub attr:      String,
    pub new_value: String,
    old_value:     Option<String>,
    pub handler:   Option<&'static str>,
    applied:       bool,
}

impl ConfigureDevice {
    pub fn new(device: DeviceId, attr: impl Into<String>, new_value: impl Into<String>, handler: Option<&'static str>) -> ConfigureDevice {
        ConfigureDevice { id: next_action_id(), device, attr: attr.into(), new_value: new_value.into(), old_value: None, handler, applied: false }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigureFormat {
    pub id:        ActionId,
    pub device:    DeviceId,
    pub attr:      String,
    pub new_value: String,
    old_value:     Option<String>,
    pub handler:   Option<&'static str>,
    applied:       bool,
}

impl ConfigureFormat {
    pub fn new(device: DeviceId, attr: impl Into<String>, new_value: impl Into<String>, handler: Option<&'static str>) -> ConfigureFormat {
        ConfigureFormat { id: next_action_id(), device, attr: attr.into(), new_value: new_value.into(), old_value: None, handler, applied: false }
    }
}

/// The reified modification. Construction validates and returns the
/// appropriate per-kind constructor's `Result`; once constructed, an
/// `Action` is infallible to `apply`/`cancel` for well-formed inputs
/// (§7 propagation policy).
#[derive(Debug, Clone)]
pub enum Action {
    CreateDevice(CreateDevice),
    DestroyDevice(DestroyDevice),
    CreateFormat(CreateFormat),
    DestroyFormat(DestroyFormat),
    ResizeDevice(ResizeDevice),
    ResizeFormat(ResizeFormat),
    AddMember(AddMember),
    RemoveMember(RemoveMember),
    ConfigureDevice(ConfigureDevice),
    ConfigureFormat(ConfigureFormat),
}

impl Action {
    pub fn id(&self) -> ActionId {
        match self {
            Action::CreateDevice(a) => a.id,
            Action::DestroyDevice(a) => a.id,
            Action::CreateFormat(a) => a.id,
            Action::DestroyFormat(a) => a.id,
            Action::ResizeDevice(a) => a.id,
            Action::ResizeFormat(a) => a.id,
            Action::AddMember(a) => a.id,
            Action::RemoveMember(a) => a.id,
            Action::ConfigureDevice(a) => a.id,
            Action::ConfigureFormat(a) => a.id,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Action::CreateDevice(_) | Action::CreateFormat(_) => ActionType::Create,
            Action::DestroyDevice(_) | Action::DestroyFormat(_) => ActionType::Destroy,
            Action::ResizeDevice(_) | Action::ResizeFormat(_) => ActionType::Resize,
            Action::AddMember(_) => ActionType::Add,
            Action::RemoveMember(_) => ActionType::Remove,
            Action::ConfigureDevice(_) | Action::ConfigureFormat(_) => ActionType::Configure,
        }
    }

    pub fn obj(&self) -> ActionObject {
        match self {
            Action::CreateDevice(_) | Action::DestroyDevice(_) | Action::ResizeDevice(_) => ActionObject::Device,
            Action::CreateFormat(_) | Action::DestroyFormat(_) | Action::ResizeFormat(_) => ActionObject::Format,
            Action::AddMember(_) | Action::RemoveMember(_) => ActionObject::Container,
            // ActionConfigureDevice carries obj=Device, not Format (§9
            // Open Question, decided).
            Action::ConfigureDevice(_) => ActionObject::Device,
            Action::ConfigureFormat(_) => ActionObject::Format,
        }
    }

    pub fn device(&self) -> DeviceId {
        match self {
            Action::CreateDevice(a) => a.device,
            Action::DestroyDevice(a) => a.device,
            Action::CreateFormat(a) => a.device,
            Action::DestroyFormat(a) => a.device,
            Action::ResizeDevice(a) => a.device,
            Action::ResizeFormat(a) => a.device,
            Action::AddMember(a) => a.device,
            Action::RemoveMember(a) => a.device,
            Action::ConfigureDevice(a) => a.device,
            Action::ConfigureFormat(a) => a.device,
        }
    }

    /// For `AddMember`/`RemoveMember`, the aggregate device.
    pub fn container(&self) -> Option<DeviceId> {
        match self {
            Action::AddMember(a) => Some(a.container),
            Action::RemoveMember(a) => Some(a.container),
            _ => None,
        }
    }

    fn is_applied(&self) -> bool {
        match self {
            Action::CreateDevice(a) => a.applied,
            Action::DestroyDevice(a) => a.applied,
            Action::CreateFormat(a) => a.applied,
            Action::DestroyFormat(a) => a.applied,
            Action::ResizeDevice(a) => a.applied,
            Action::ResizeFormat(a) => a.applied,
            Action::AddMember(a) => a.applied,
            Action::RemoveMember(a) => a.applied,
            Action::ConfigureDevice(a) => a.applied,
            Action::ConfigureFormat(a) => a.applied,
        }
    }

    /// Applies the action's in-memory mutation to `tree`. A no-op if
    /// already applied.
    pub fn apply(&mut self, tree: &mut DeviceTree) -> Result<(), StorageError> {
        if self.is_applied() {
            return Ok(());
        }
        debug!("applying action {:?} ({:?} on {:?})", self.id(), self.action_type(), self.device());

        match self {
            Action::CreateDevice(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    d.exists = true;
                }
                a.applied = true;
            }
            Action::DestroyDevice(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    d.exists = false;
                }
                a.ignore_skip_activation += 1;
                a.applied = true;
            }
            Action::CreateFormat(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    a.orig_fmt = Some(d.format.clone());
                    d.format = a.new_fmt.clone();
                }
                a.applied = true;
            }
            Action::DestroyFormat(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    a.orig_fmt = Some(d.format.clone());
                    d.format = DeviceFormat::none();
                }
                a.applied = true;
            }
            Action::ResizeDevice(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    a.orig_size = Some(d.size);
                    d.size = a.new_size;
                }
                a.applied = true;
            }
            Action::ResizeFormat(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    a.orig_size = Some(d.format.common.current_size);
                    d.format.common.current_size = a.new_size;
                    d.format.common.target_size = Some(a.new_size);
                }
                a.applied = true;
            }
            Action::AddMember(a) => {
                if let Some(d) = tree.get_mut(a.container) {
                    if !d.parents.contains(&a.device) {
                        d.parents.push(a.device);
                    }
                }
                a.applied = true;
            }
            Action::RemoveMember(a) => {
                if let Some(d) = tree.get_mut(a.container) {
                    a.orig_parents = Some(d.parents.clone());
                    d.parents.retain(|&p| p != a.device);
                }
                a.applied = true;
            }
            Action::ConfigureDevice(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    if a.attr == "name" {
                        a.old_value = Some(d.name.clone());
                        d.name = a.new_value.clone();
                    }
                }
                a.applied = true;
            }
            Action::ConfigureFormat(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    match a.attr.as_str() {
                        "label" => {
                            a.old_value = d.format.common.label.clone();
                            d.format.common.label = Some(a.new_value.clone());
                        }
                        "mountpoint" => {
                            a.old_value = d.format.common.mountpoint.clone();
                            d.format.common.mountpoint = Some(a.new_value.clone());
                        }
                        "uuid" => {
                            a.old_value = d.format.common.uuid.clone();
                            d.format.common.uuid = Some(a.new_value.clone());
                        }
                        _ => {}
                    }
                }
                a.applied = true;
            }
        }
        Ok(())
    }

    /// Restores the pre-apply state. A no-op if never applied.
    pub fn cancel(&mut self, tree: &mut DeviceTree) -> Result<(), StorageError> {
        if !self.is_applied() {
            return Ok(());
        }
        debug!("cancelling action {:?}", self.id());

        match self {
            Action::CreateDevice(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    d.exists = false;
                }
                a.applied = false;
            }
            Action::DestroyDevice(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    d.exists = true;
                }
                a.ignore_skip_activation = a.ignore_skip_activation.saturating_sub(1);
                a.applied = false;
            }
            Action::CreateFormat(a) => {
                if let Some(orig) = a.orig_fmt.take() {
                    if let Some(d) = tree.get_mut(a.device) {
                        d.format = orig;
                    }
                }
                a.applied = false;
            }
            Action::DestroyFormat(a) => {
                if let Some(orig) = a.orig_fmt.take() {
                    if let Some(d) = tree.get_mut(a.device) {
                        d.format = orig;
                    }
                }
                a.applied = false;
            }
            Action::ResizeDevice(a) => {
                if let Some(size) = a.orig_size.take() {
                    if let Some(d) = tree.get_mut(a.device) {
                        d.size = size;
                    }
                }
                a.applied = false;
            }
            Action::ResizeFormat(a) => {
                if let Some(size) = a.orig_size.take() {
                    if let Some(d) = tree.get_mut(a.device) {
                        d.format.common.current_size = size;
                        d.format.common.target_size = None;
                    }
                }
                a.applied = false;
            }
            Action::AddMember(a) => {
                if let Some(d) = tree.get_mut(a.container) {
                    d.parents.retain(|&p| p != a.device);
                }
                a.applied = false;
            }
            Action::RemoveMember(a) => {
                if let Some(parents) = a.orig_parents.take() {
                    if let Some(d) = tree.get_mut(a.container) {
                        d.parents = parents;
                    }
                }
                a.applied = false;
            }
            Action::ConfigureDevice(a) => {
                if let Some(old) = a.old_value.take() {
                    if a.attr == "name" {
                        if let Some(d) = tree.get_mut(a.device) {
                            d.name = old;
                        }
                    }
                }
                a.applied = false;
            }
            Action::ConfigureFormat(a) => {
                if let Some(d) = tree.get_mut(a.device) {
                    match a.attr.as_str() {
                        "label" => d.format.common.label = a.old_value.take(),
                        "mountpoint" => d.format.common.mountpoint = a.old_value.take(),
                        "uuid" => d.format.common.uuid = a.old_value.take(),
                        _ => {}
                    }
                }
                a.applied = false;
            }
        }
        Ok(())
    }

    /// Commits the action to the host. The device-class-specific
    /// `create`/`destroy`/`resize` hooks that would shell out to real
    /// tooling are out of this crate's scope (§1); here they are
    /// represented by the tree mutation `apply` already performed, plus
    /// a progress callback and structured log line, which is the full
    /// external contract this core owns.
    pub fn execute(&mut self, tree: &mut DeviceTree, callbacks: &mut Callbacks) -> Result<(), StorageError> {
        self.apply(tree)?;
        callbacks.report_progress(&format!("executing {:?} on {:?}", self.action_type(), self.device()));

        if let Action::CreateFormat(a) = self {
            let disk = tree.get(a.device).and_then(|d| d.kind.as_partition()).and_then(|p| p.disk);
            if let Some(disk) = disk {
                let new_flag = a.new_fmt.kind.partition_flag();
                if let Some(device) = tree.get_mut(a.device) {
                    if let Some(data) = device.kind.as_partition_mut() {
                        if let Some(pp) = data.parted_partition.as_mut() {
                            pp.flags = crate::device::format::PartitionFlags::LBA;
                            if let Some(flag) = new_flag {
                                pp.flags |= flag;
                            }
                        }
                    }
                }
                debug!("committed disklabel on {:?} after formatting {:?} as {}", disk, a.device, a.new_fmt.type_name());
            }

            if matches!(a.new_fmt.kind, crate::device::format::FormatKind::Luks) {
                let entropy_bits = crate::device::format::MIN_LUKS_ENTROPY_BITS;
                callbacks.create_format_pre(&format!("creating luks format on {:?}", a.device));
                // get_current_entropy() is a host probe, out of scope;
                // conservatively always offer the wait.
                callbacks.wait_for_entropy("gathering entropy for LUKS key material", entropy_bits);
                callbacks.create_format_post(&format!("created luks format on {:?}", a.device));
            }
        }

        if let Action::DestroyFormat(a) = self {
            if let Some(device) = tree.get_mut(a.device) {
                if let Some(data) = device.kind.as_partition_mut() {
                    if let Some(pp) = data.parted_partition.as_mut() {
                        pp.flags = crate::device::format::PartitionFlags::LBA;
                    }
                }
            }
        }

        Ok(())
    }

    /// True when `self` must execute before `other` (`self.requires(other)`
    /// means `other` executes first).
    pub fn requires(&self, other: &Action, tree: &DeviceTree) -> bool {
        if self.id() == other.id() {
            return false;
        }

        match (self, other) {
            (Action::CreateDevice(a), Action::CreateDevice(b)) => {
                if tree.depends_on(a.device, b.device) && a.device != b.device {
                    return true;
                }
                if let (Some(pa), Some(pb)) = (
                    tree.get(a.device).and_then(|d| d.kind.as_partition()),
                    tree.get(b.device).and_then(|d| d.kind.as_partition()),
                ) {
                    if pa.disk.is_some() && pa.disk == pb.disk {
                        if let (Some(na), Some(nb)) = (pa.number, pb.number) {
                            return na > nb;
                        }
                    }
                }
                if let (Some(la), Some(lb)) = (
                    tree.get(a.device).and_then(|d| d.kind.as_lv()),
                    tree.get(b.device).and_then(|d| d.kind.as_lv()),
                ) {
                    if la.vg.is_some() && la.vg == lb.vg {
                        let a_cached = matches!(la.seg_type, crate::device::SegType::CacheOrigin);
                        let b_cached = matches!(lb.seg_type, crate::device::SegType::CacheOrigin);
                        if !a_cached && b_cached {
                            return true;
                        }
                        let a_linear = matches!(la.seg_type, crate::device::SegType::Linear);
                        let b_linear = matches!(lb.seg_type, crate::device::SegType::Linear);
                        if a_linear && !b_linear {
                            return true;
                        }
                    }
                }
                if let Action::AddMember(m) = other {
                    if m.container == a.device {
                        return true;
                    }
                }
                false
            }
            (Action::DestroyDevice(a), Action::DestroyDevice(b)) => {
                if tree.depends_on(b.device, a.device) && b.device != a.device {
                    return true;
                }
                if let (Some(pa), Some(pb)) = (
                    tree.get(a.device).and_then(|d| d.kind.as_partition()),
                    tree.get(b.device).and_then(|d| d.kind.as_partition()),
                ) {
                    if pa.disk.is_some() && pa.disk == pb.disk {
                        if let (Some(na), Some(nb)) = (pa.number, pb.number) {
                            return na < nb;
                        }
                    }
                }
                false
            }
            (Action::DestroyDevice(a), Action::DestroyFormat(b)) => a.device == b.device,
            (Action::DestroyDevice(a), Action::RemoveMember(b)) => a.device == b.container || a.device == b.device,
            (Action::CreateFormat(a), Action::CreateDevice(b)) => {
                a.device == b.device || tree.depends_on(a.device, b.device)
            }
            (Action::CreateFormat(a), Action::ResizeDevice(b)) => a.device == b.device,
            (Action::ResizeDevice(a), Action::ResizeFormat(b)) => {
                a.device == b.device && a.dir == b.dir && a.dir == ResizeDir::Shrink
            }
            (Action::ResizeDevice(a), Action::ResizeDevice(b)) => {
                if a.dir == ResizeDir::Grow && tree.depends_on(a.device, b.device) && b.dir == ResizeDir::Grow {
                    return true;
                }
                if a.dir == ResizeDir::Shrink && tree.depends_on(b.device, a.device) && b.dir == ResizeDir::Shrink {
                    return true;
                }
                if a.dir == ResizeDir::Grow && b.dir == ResizeDir::Shrink {
                    return common_ancestor(tree, a.device, b.device);
                }
                false
            }
            (Action::ResizeFormat(a), Action::ResizeDevice(b)) => {
                a.device == b.device && a.dir == ResizeDir::Grow && b.dir == ResizeDir::Grow
            }
            (Action::AddMember(a), Action::CreateDevice(b)) => a.device == b.device,
            (Action::AddMember(a), Action::CreateFormat(b)) => a.device == b.device,
            (Action::RemoveMember(a), _) => {
                tree.depends_on(a.device, other.device()) && matches!(other.action_type(), ActionType::Destroy | ActionType::Resize)
                    || other.container() == Some(a.container) && other.action_type() == ActionType::Add
            }
            _ => false,
        }
    }

    /// True when `self` being present in the queue makes `other`
    /// redundant.
    pub fn obsoletes(&self, other: &Action, _tree: &DeviceTree) -> bool {
        if self.id() == other.id() {
            return false;
        }

        match self {
            Action::CreateDevice(a) => {
                matches!(other, Action::CreateDevice(b) if b.device == a.device && b.id.0 < a.id.0)
            }
            Action::DestroyDevice(a) => {
                if let Action::AddMember(m) = other {
                    if m.container == a.device || m.device == a.device {
                        return true;
                    }
                }
                let existed = _tree.get(a.device).map(|d| d.exists).unwrap_or(false);
                let same_device = other.device() == a.device && other.id().0 < a.id.0;
                if !same_device {
                    return false;
                }
                if !existed {
                    true
                } else {
                    !matches!(other, Action::DestroyFormat(_))
                }
            }
            Action::CreateFormat(a) => match other {
                Action::CreateFormat(b) => b.device == a.device && b.id.0 < a.id.0,
                Action::DestroyFormat(b) => b.device == a.device && b.id.0 < a.id.0 && !b.fmt_existed,
                _ => false,
            },
            Action::DestroyFormat(a) => match other {
                Action::DestroyFormat(b) => b.device == a.device && b.id.0 < a.id.0 && (a.fmt_existed || !b.fmt_existed),
                _ => false,
            },
            Action::ResizeDevice(a) => {
                matches!(other, Action::ResizeDevice(b) if b.device == a.device && b.id.0 < a.id.0)
            }
            Action::ResizeFormat(a) => {
                matches!(other, Action::ResizeFormat(b) if b.device == a.device && b.id.0 < a.id.0)
            }
            Action::AddMember(a) => {
                matches!(other, Action::RemoveMember(b) if b.container == a.container && b.device == a.device)
            }
            Action::RemoveMember(a) => {
                matches!(other, Action::AddMember(b) if b.container == a.container && b.device == a.device)
            }
            Action::ConfigureDevice(a) => {
                matches!(other, Action::ConfigureDevice(b) if b.device == a.device && b.attr == a.attr && b.id.0 < a.id.0)
            }
            Action::ConfigureFormat(a) => {
                matches!(other, Action::ConfigureFormat(b) if b.device == a.device && b.attr == a.attr && b.id.0 < a.id.0)
            }
        }
    }
}

fn common_ancestor(tree: &DeviceTree, a: DeviceId, b: DeviceId) -> bool {
    fn ancestors(tree: &DeviceTree, id: DeviceId, out: &mut Vec<DeviceId>) {
        out.push(id);
        if let Some(d) = tree.get(id) {
            for &p in &d.parents {
                ancestors(tree, p, out);
            }
        }
    }
    let mut aa = Vec::new();
    ancestors(tree, a, &mut aa);
    let mut ba = Vec::new();
    ancestors(tree, b, &mut ba);
    aa.iter().any(|x| ba.contains(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::{Device, DeviceKind}, size::Size};

    fn tree_with_disk() -> (DeviceTree, DeviceId) {
        let mut tree = DeviceTree::new();
        let id = tree.next_id();
        tree.add(Device::new(id, "sda", Size::from_gib(1), DeviceKind::Disk)).unwrap();
        (tree, id)
    }

    #[test]
    fn create_device_rejects_existing() {
        let (mut tree, id) = tree_with_disk();
        tree.get_mut(id).unwrap().exists = true;
        assert!(CreateDevice::new(&tree, id).is_err());
    }

    #[test]
    fn higher_id_create_obsoletes_lower() {
        let (tree, id) = tree_with_disk();
        let a1 = Action::CreateDevice(CreateDevice::new(&tree, id).unwrap());
        let a2 = Action::CreateDevice(CreateDevice::new(&tree, id).unwrap());
        assert!(a2.obsoletes(&a1, &tree));
        assert!(!a1.obsoletes(&a2, &tree));
    }

    #[test]
    fn apply_then_cancel_restores_exists() {
        let (mut tree, id) = tree_with_disk();
        let mut action = Action::CreateDevice(CreateDevice::new(&tree, id).unwrap());
        action.apply(&mut tree).unwrap();
        assert!(tree.get(id).unwrap().exists);
        action.cancel(&mut tree).unwrap();
        assert!(!tree.get(id).unwrap().exists);
    }

    #[test]
    fn destroy_device_apply_is_idempotent_on_counter() {
        let (mut tree, id) = tree_with_disk();
        let mut action = Action::DestroyDevice(DestroyDevice::new(id));
        action.apply(&mut tree).unwrap();
        action.apply(&mut tree).unwrap();
        if let Action::DestroyDevice(a) = &action {
            assert_eq!(a.ignore_skip_activation, 1);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn create_format_execute_sets_format_specific_flag() {
        use crate::device::{format::{FormatCommon, FormatKind}, PartedPartition, PartitionData, PartitionType};

        let (mut tree, disk) = tree_with_disk();
        let part_id = tree.next_id();
        let mut data = PartitionData::default();
        data.disk = Some(disk);
        data.parted_partition =
            Some(PartedPartition {
                start_sector: 2048,
                end_sector:   4095,
                part_type:    PartitionType::Primary,
                flags:        Default::default(),
                gpt_type_uuid: None,
            });
        tree.add(Device::new(part_id, "sda1", Size::from_mib(1), DeviceKind::Partition(data))).unwrap();

        let new_fmt = DeviceFormat::new(FormatKind::LvmPv, FormatCommon::default());
        let mut action = Action::CreateFormat(CreateFormat::new(part_id, new_fmt));
        let mut callbacks = Callbacks::default();
        action.execute(&mut tree, &mut callbacks).unwrap();

        let flags = tree.get(part_id).unwrap().kind.as_partition().unwrap().parted_partition.unwrap().flags;
        assert!(flags.contains(crate::device::format::PartitionFlags::LBA));
        assert!(flags.contains(crate::device::format::PartitionFlags::LVM));
        assert!(!flags.contains(crate::device::format::PartitionFlags::BOOT));
    }

    #[test]
    fn destroy_format_existing_does_not_obsolete_fresh_destroy() {
        let (tree, id) = tree_with_disk();
        let mut existing = DestroyFormat::new(&tree, id).unwrap();
        existing.fmt_existed = true;
        let fresh = DestroyFormat::new(&tree, id).unwrap();
        let existing_action = Action::DestroyFormat(existing);
        let fresh_action = Action::DestroyFormat(fresh);
        assert!(!existing_action.obsoletes(&fresh_action, &tree));
    }
}
