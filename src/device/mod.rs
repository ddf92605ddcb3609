//! Device tree entities (§3, §4.1): the common `Device` attributes, the
//! tagged `DeviceKind` variant for per-class data the allocator and
//! grower need to inspect, and the `DeviceTree` arena itself.
//!
//! Devices are *not* an inheritance chain of trait objects: the source's
//! inheritance hierarchy is not semantic (see SPEC_FULL.md §9), so this
//! crate keeps one `Device` struct with a `DeviceKind` tag, and models
//! parent/child and LV-built-from relationships as `DeviceId` back-
//! references into the tree's arena rather than as owned cycles.

pub mod format;
pub mod tree;

use std::{
    collections::HashSet,
    path::PathBuf,
};

pub use self::{format::DeviceFormat, tree::DeviceTree};
use crate::size::Size;

/// A process-wide unique, monotonically increasing device id.
///
/// Assigned by [`DeviceTree::next_id`] at construction; stable for the
/// process lifetime even across renumbering of partition names.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct DeviceId(pub u64);

/// Primary/Extended/Logical, as selected by the allocator (§4.4).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum PartitionType {
    Primary,
    Extended,
    Logical,
}

/// The role an LVM logical volume plays, needed by the grower to decide
/// sort order and chunk membership (§4.5).
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum SegType {
    Linear,
    Thin,
    ThinPool,
    Raid(&'static str),
    Vdo,
    VdoPool,
    CacheOrigin,
}

/// An LV is either a plain volume or "built from" other LVs (a RAID or
/// cache LV whose legs are themselves LVs). While the composite LV is
/// in the tree its source LVs are logically owned by it and are not
/// independently reachable; destroying the composite returns them.
#[derive(Debug, Clone)]
pub enum LvOrigin {
    Plain,
    FromLvs(Vec<DeviceId>),
}

/// The allocator's geometry handle for a placed (or simulated)
/// partition. Populated by [`crate::partitioning::allocator`] and
/// nowhere else — "the allocator is the sole writer of
/// `PartitionDevice.parted_partition` for new partitions" (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartedPartition {
    pub start_sector: u64,
    pub end_sector:   u64,
    pub part_type:    PartitionType,
    /// Disklabel attribute bits, maintained by `CreateFormat::execute`
    /// (§4.2: "clears all flags except LBA; sets the format-specific
    /// flag") rather than by the allocator.
    pub flags:        format::PartitionFlags,
    /// The GPT partition-type UUID stamped at creation when
    /// `Context::gpt_discoverable_partitions` is set (§4.6). `None` on
    /// every non-GPT disklabel and on a GPT disklabel when the flag is
    /// off or the partition's mountpoint has no well-known role.
    pub gpt_type_uuid: Option<&'static str>,
}

impl PartedPartition {
    pub fn length(&self) -> u64 { self.end_sector - self.start_sector + 1 }
}

/// Request/geometry attributes the allocator needs from a not-yet-
/// placed (or already placed) partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionData {
    /// The disk this partition is (or will be) a child of.
    pub disk:             Option<DeviceId>,
    /// 1-based partition number, assigned once placed.
    pub number:           Option<u32>,
    pub req_disks:        Vec<DeviceId>,
    pub req_disk_tags:    Vec<String>,
    pub req_size:         Option<Size>,
    pub req_base_size:    Size,
    pub req_max_size:     Option<Size>,
    pub req_grow:         bool,
    pub req_primary:      bool,
    pub req_part_type:    Option<PartitionType>,
    pub req_start_sector: Option<u64>,
    pub req_end_sector:   Option<u64>,
    pub req_bootable:     bool,
    pub weight:           i32,
    pub parted_partition: Option<PartedPartition>,
}

/// LVM volume group attributes (§3).
#[derive(Debug, Clone)]
pub struct VolumeGroupData {
    pub pe_size:        Size,
    pub extents:        u64,
    pub free_extents:   u64,
    pub reserved_space: Size,
    pub pmspare_size:   Size,
}

/// LVM logical volume attributes (§3).
#[derive(Debug, Clone)]
pub struct LogicalVolumeData {
    pub vg:            Option<DeviceId>,
    /// The thin pool this LV is a sub-LV of, if any (§4.5 "ThinPoolChunk
    /// ... requests are sub-LVs of the pool"). `None` for a plain LV or
    /// for the thin pool device itself.
    pub pool:          Option<DeviceId>,
    pub seg_type:      SegType,
    pub req_percent:   Option<u8>,
    pub req_grow:      bool,
    pub req_max_size:  Option<Size>,
    pub cache_request: Option<Size>,
    pub origin:        LvOrigin,
    pub metadata_size: Size,
    pub used_space:    Size,
}

/// Thin-pool-specific attributes layered on top of an LV that is itself
/// a thin pool (holds its thin LVs the way a VG holds its LVs).
#[derive(Debug, Clone)]
pub struct ThinPoolData {
    pub pe_size:  Size,
    pub pool_len: u64,
}

/// The tagged variant distinguishing concrete device classes. Only the
/// fields the allocator/grower/action layer actually inspect by kind
/// are modeled; everything else lives on the common [`Device`].
#[derive(Debug, Clone)]
pub enum DeviceKind {
    Disk,
    DiskFile { backing_file: PathBuf },
    Partition(PartitionData),
    DmDevice,
    LuksDevice { header_size: Size },
    MdRaidArray { level: String },
    LvmPhysicalVolume,
    LvmVolumeGroup(VolumeGroupData),
    LvmLogicalVolume(LogicalVolumeData),
    LvmThinPool(ThinPoolData),
    BtrfsVolume,
    BtrfsSubVolume,
    TmpFs,
    NoDevice,
}

impl DeviceKind {
    pub fn is_partition(&self) -> bool { matches!(self, DeviceKind::Partition(_)) }

    pub fn as_partition(&self) -> Option<&PartitionData> {
        match self {
            DeviceKind::Partition(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_partition_mut(&mut self) -> Option<&mut PartitionData> {
        match self {
            DeviceKind::Partition(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_vg(&self) -> Option<&VolumeGroupData> {
        match self {
            DeviceKind::LvmVolumeGroup(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_vg_mut(&mut self) -> Option<&mut VolumeGroupData> {
        match self {
            DeviceKind::LvmVolumeGroup(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_lv(&self) -> Option<&LogicalVolumeData> {
        match self {
            DeviceKind::LvmLogicalVolume(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_lv_mut(&mut self) -> Option<&mut LogicalVolumeData> {
        match self {
            DeviceKind::LvmLogicalVolume(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            DeviceKind::LvmVolumeGroup(_) | DeviceKind::MdRaidArray { .. } | DeviceKind::BtrfsVolume
        )
    }
}

/// Common attributes carried by every tree entity, independent of kind
/// (§3 "Device (abstract)").
#[derive(Debug, Clone)]
pub struct Device {
    pub id:        DeviceId,
    pub name:      String,
    pub uuid:      Option<String>,
    pub path:      Option<PathBuf>,
    pub size:      Size,
    pub parents:   Vec<DeviceId>,
    pub format:    DeviceFormat,
    pub exists:    bool,
    pub protected: bool,
    pub tags:      HashSet<String>,
    pub kind:      DeviceKind,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, size: Size, kind: DeviceKind) -> Device {
        Device {
            id,
            name: name.into(),
            uuid: None,
            path: None,
            size,
            parents: Vec::new(),
            format: DeviceFormat::none(),
            exists: false,
            protected: false,
            tags: HashSet::new(),
            kind,
        }
    }

    pub fn with_exists(mut self, exists: bool) -> Device {
        self.exists = exists;
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> Device {
        self.path = Some(path);
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Device {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_parent(mut self, parent: DeviceId) -> Device {
        self.parents.push(parent);
        self
    }
}
