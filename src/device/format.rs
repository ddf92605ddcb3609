//! `DeviceFormat`: the "interpretation" placed on a device — a
//! filesystem, an LVM PV, an MD member, LUKS, a disklabel, or nothing
//! (a null-type placeholder, `FormatKind::None`).

use bitflags::bitflags;

use crate::size::Size;

bitflags! {
    /// Parted-style partition attribute flags. `CreateFormat::execute`
    /// clears every flag but `LBA` and then sets the flag
    /// `FormatKind::partition_flag` returns for the new format, mirroring
    /// a real disklabel commit (§4.2 `CreateFormat`).
    #[derive(Default)]
    pub struct PartitionFlags: u32 {
        const LBA  = 0b0000_0001;
        const BOOT = 0b0000_0010;
        const ESP  = 0b0000_0100;
        const SWAP = 0b0000_1000;
        const LVM  = 0b0001_0000;
        const RAID = 0b0010_0000;
    }
}

/// Minimum entropy, in bits, the source requires from
/// `get_current_entropy()` before creating a LUKS format without
/// prompting via `wait_for_entropy` (§4.2 `CreateFormat`).
pub const MIN_LUKS_ENTROPY_BITS: u32 = 256;

/// A disklabel partition-table kind.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum DisklabelType {
    Msdos,
    Gpt,
    Mac,
}

impl DisklabelType {
    /// Maximum number of primary partition slots, msdos only; gpt/mac
    /// are bounded instead by the partition-entry-array size, modeled
    /// here as the same field for uniformity.
    pub fn max_primary(self) -> u32 {
        match self {
            DisklabelType::Msdos => 4,
            DisklabelType::Gpt => 128,
            DisklabelType::Mac => 64,
        }
    }

    pub fn supports_extended(self) -> bool { self == DisklabelType::Msdos }
}

/// A (grain size, offset) pair sector numbers are rounded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub grain_size: u64,
    pub offset:     u64,
}

impl Alignment {
    pub fn new(grain_size: u64, offset: u64) -> Alignment { Alignment { grain_size, offset } }

    pub fn is_aligned(&self, sector: u64) -> bool {
        sector >= self.offset && (sector - self.offset) % self.grain_size == 0
    }

    /// Rounds `sector` up to the next sector satisfying `is_aligned`.
    pub fn align_up(&self, sector: u64) -> u64 {
        if sector <= self.offset {
            return self.offset;
        }
        let delta = sector - self.offset;
        let rem = delta % self.grain_size;
        if rem == 0 { sector } else { sector + (self.grain_size - rem) }
    }

    /// Rounds `sector` down to the previous sector satisfying `is_aligned`.
    pub fn align_down(&self, sector: u64) -> u64 {
        if sector <= self.offset {
            return self.offset;
        }
        let delta = sector - self.offset;
        sector - (delta % self.grain_size)
    }
}

/// Two TiB, in bytes: the legacy BIOS-boot partition end-sector cap
/// enforced by `get_best_free_space_region` for bootable requests.
pub const TWO_TIB: u64 = 2 * Size::TIB;

/// A disklabel: the partition table format placed on a `Disk` device.
/// Carries alignment and geometry maxima the allocator consults; the
/// free-region scan itself is computed on demand from the tree's
/// partition children (see `partitioning::allocator::free_regions`)
/// rather than cached here, mirroring how a live disklabel is queried.
#[derive(Debug, Clone)]
pub struct Disklabel {
    pub table_type:       DisklabelType,
    pub sector_size:      u64,
    pub alignment:        Alignment,
    /// Sectors reserved at the front of the disk (e.g. for the MBR/GPT
    /// header); no partition may start before this.
    pub first_usable:     u64,
    /// Last sector a partition may legally end on.
    pub max_end_sector:   u64,
    /// Last sector a partition may legally *start* on.
    pub max_start_sector: u64,
    pub primary_count:    u32,
    pub has_extended:     bool,
}

impl Disklabel {
    pub fn new(table_type: DisklabelType, sector_size: u64, total_sectors: u64) -> Disklabel {
        Disklabel {
            table_type,
            sector_size,
            alignment: Alignment::new(2048, 0),
            first_usable: 2048,
            max_end_sector: total_sectors.saturating_sub(1),
            max_start_sector: total_sectors.saturating_sub(1),
            primary_count: 0,
            has_extended: false,
        }
    }

    pub fn max_primary(&self) -> u32 { self.table_type.max_primary() }
}

/// Attributes common to every format, independent of kind (§3
/// "DeviceFormat (abstract)").
#[derive(Debug, Clone)]
pub struct FormatCommon {
    pub uuid:         Option<String>,
    pub label:        Option<String>,
    pub mountpoint:   Option<String>,
    pub exists:       bool,
    pub supported:    bool,
    pub formattable:  bool,
    pub resizable:    bool,
    pub destroyable:  bool,
    pub min_size:     Size,
    pub max_size:     Option<Size>,
    pub current_size: Size,
    pub target_size:  Option<Size>,
}

impl Default for FormatCommon {
    fn default() -> FormatCommon {
        FormatCommon {
            uuid:         None,
            label:        None,
            mountpoint:   None,
            exists:       false,
            supported:    true,
            formattable:  true,
            resizable:    false,
            destroyable:  true,
            min_size:     Size(0),
            max_size:     None,
            current_size: Size(0),
            target_size:  None,
        }
    }
}

/// The format subtype tag.
#[derive(Debug, Clone)]
pub enum FormatKind {
    /// Null-type placeholder: "no format", used for freshly-created
    /// devices that have not yet been given a format.
    None,
    Filesystem(&'static str),
    Swap,
    Disklabel(Disklabel),
    LvmPv,
    MdMember,
    Luks,
    Btrfs,
}

impl FormatKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FormatKind::None => "none",
            FormatKind::Filesystem(name) => name,
            FormatKind::Swap => "swap",
            FormatKind::Disklabel(_) => "disklabel",
            FormatKind::LvmPv => "lvmpv",
            FormatKind::MdMember => "mdmember",
            FormatKind::Luks => "luks",
            FormatKind::Btrfs => "btrfs",
        }
    }

    /// The disklabel partition flag a `CreateFormat` of this kind sets,
    /// beyond the `LBA` flag every partition keeps (§4.2 `CreateFormat`
    /// execute: "sets the format-specific flag"). `None` for kinds with
    /// no dedicated disklabel flag (plain filesystems, MD members).
    pub fn partition_flag(&self) -> Option<PartitionFlags> {
        match self {
            FormatKind::Swap => Some(PartitionFlags::SWAP),
            FormatKind::LvmPv => Some(PartitionFlags::LVM),
            FormatKind::Filesystem(name) if *name == "vfat" || *name == "fat32" => Some(PartitionFlags::ESP),
            _ => None,
        }
    }
}

/// A `Device`'s format: common attributes plus a kind tag.
#[derive(Debug, Clone)]
pub struct DeviceFormat {
    pub common: FormatCommon,
    pub kind:   FormatKind,
}

impl DeviceFormat {
    /// The null-type placeholder format every freshly-constructed
    /// `Device` starts with.
    pub fn none() -> DeviceFormat {
        DeviceFormat { common: FormatCommon { formattable: false, destroyable: false, ..FormatCommon::default() }, kind: FormatKind::None }
    }

    pub fn new(kind: FormatKind, common: FormatCommon) -> DeviceFormat { DeviceFormat { common, kind } }

    pub fn type_name(&self) -> &'static str { self.kind.type_name() }

    pub fn is_none(&self) -> bool { matches!(self.kind, FormatKind::None) }

    pub fn disklabel(&self) -> Option<&Disklabel> {
        match &self.kind {
            FormatKind::Disklabel(dl) => Some(dl),
            _ => None,
        }
    }

    pub fn disklabel_mut(&mut self) -> Option<&mut Disklabel> {
        match &mut self.kind {
            FormatKind::Disklabel(dl) => Some(dl),
            _ => None,
        }
    }

    /// Maps a reconfigurable attribute name to its handler: `None` if
    /// the attribute has no reconfigure support, `Some(None)` if
    /// setting it is apply-only (no external call), `Some(Some(name))`
    /// if `name` must be invoked on the format to take effect.
    pub fn config_actions_map(&self, attr: &str) -> Option<Option<&'static str>> {
        match (attr, &self.kind) {
            ("label", FormatKind::Filesystem(_)) | ("label", FormatKind::Btrfs) => {
                Some(Some("write_label"))
            }
            ("mountpoint", _) => Some(None),
            ("uuid", FormatKind::LvmPv) => Some(Some("write_uuid")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_up_to_grain() {
        let a = Alignment::new(2048, 0);
        assert_eq!(a.align_up(1), 2048);
        assert_eq!(a.align_up(2048), 2048);
        assert_eq!(a.align_up(2049), 4096);
    }

    #[test]
    fn alignment_rounds_down_to_grain() {
        let a = Alignment::new(2048, 0);
        assert_eq!(a.align_down(4095), 2048);
        assert_eq!(a.align_down(4096), 4096);
    }

    #[test]
    fn none_format_is_not_formattable() {
        let f = DeviceFormat::none();
        assert!(f.is_none());
        assert!(!f.common.formattable);
    }
}
