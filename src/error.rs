use crate::{action::ActionType, device::DeviceId};

/// Raised when an operation would leave the device tree in an
/// inconsistent state.
#[rustfmt::skip]
#[derive(Debug, Fail)]
pub enum TreeError {
    #[fail(display = "device {:?} already has a device in the tree with uuid {}", id, uuid)]
    DuplicateUuid { id: DeviceId, uuid: String },
    #[fail(display = "parent {:?} of device {:?} is not in the tree", parent, id)]
    ParentNotInTree { id: DeviceId, parent: DeviceId },
    #[fail(display = "device {:?} is not a leaf and force was not requested", id)]
    NotALeaf { id: DeviceId },
    #[fail(display = "device {:?} is not present in the tree", id)]
    NotInTree { id: DeviceId },
    #[fail(display = "mountpoint {} is already in use", mountpoint)]
    MountpointInUse { mountpoint: String },
    #[fail(display = "device {:?} is not in the tree; only CreateDevice may target it", id)]
    UnknownDeviceForAction { id: DeviceId },
    #[fail(display = "cannot destroy device {:?}: it is not a leaf", id)]
    DestroyNonLeaf { id: DeviceId },
    #[fail(display = "device {:?} already exists; cannot schedule a CreateDevice for it", id)]
    DeviceAlreadyExists { id: DeviceId },
    #[fail(display = "device {:?} is not resizable", id)]
    NotResizable { id: DeviceId },
    #[fail(display = "requested size for device {:?} equals its current size", id)]
    SizeUnchanged { id: DeviceId },
    #[fail(display = "requested size for device {:?} violates its min/max size", id)]
    SizeOutOfBounds { id: DeviceId },
}

/// Raised at action construction time when a device's external
/// dependencies are unavailable.
#[derive(Debug, Fail)]
#[fail(display = "device {:?} has unavailable dependencies: {:?}", id, missing)]
pub struct DependencyError {
    pub id:      DeviceId,
    pub missing: Vec<String>,
}

/// Raised by the partition allocator when a request cannot be placed.
#[rustfmt::skip]
#[derive(Debug, Fail)]
pub enum PartitioningError {
    #[fail(display = "no free region large enough for request on device {:?}", id)]
    NoFreeRegion { id: DeviceId },
    #[fail(display = "request for device {:?} exceeds the disklabel's maximum end sector", id)]
    ExceedsDisklabelMax { id: DeviceId },
    #[fail(display = "alignment could not be satisfied for device {:?}", id)]
    AlignmentUnsatisfiable { id: DeviceId },
    #[fail(display = "an extended partition could not be created on disk {:?}", disk)]
    ExtendedCreateFailed { disk: DeviceId },
    #[fail(display = "format on device {:?} would be smaller than its minimum size", id)]
    BelowFormatMinSize { id: DeviceId },
    #[fail(display = "format on device {:?} would exceed its maximum size", id)]
    AboveFormatMaxSize { id: DeviceId },
    #[fail(display = "no candidate disk accepted the request for device {:?}", id)]
    NoCandidateDisk { id: DeviceId },
    #[fail(display = "size set could not reach its target size")]
    SizeSetUnsatisfiable,
    #[fail(display = "volume group {:?} has insufficient free extents to satisfy its LVs", id)]
    VolumeGroupOverCommitted { id: DeviceId },
}

/// A disklabel write failed because the host activated dependent
/// devices (LVM/MD) during the commit. Recovered once by the queue.
#[derive(Debug, Fail)]
#[fail(display = "commit to disklabel on {:?} failed: dependent devices are active", disk)]
pub struct DiskLabelCommitError {
    pub disk: DeviceId,
}

/// Raised by the GPT type table for an unknown role or architecture.
#[derive(Debug, Fail)]
pub enum GptUuidError {
    #[fail(display = "no GPT partition type UUID is defined for role {:?}", role)]
    UnknownRole { role: String },
    #[fail(display = "role {:?} has no GPT partition type UUID for architecture {:?}", role, arch)]
    UnknownArch { role: String, arch: String },
}

/// A generic failure surfaced by a device or format hook during
/// `Action::execute`.
#[derive(Debug, Fail)]
#[fail(display = "storage error on device {:?} ({:?}): {}", id, action, why)]
pub struct StorageError {
    pub id:     DeviceId,
    pub action: ActionType,
    pub why:    String,
}

impl From<TreeError> for StorageError {
    fn from(why: TreeError) -> StorageError {
        StorageError { id: DeviceId(0), action: ActionType::None, why: why.to_string() }
    }
}
