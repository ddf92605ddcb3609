//! Process-wide configuration threaded explicitly through the tree and
//! queue, replacing the module-level globals (`flags`, the LVM
//! command-cache filter) that the source keeps as singletons.

use crate::{device::DeviceId, gpt::Arch, partitioning::sizeset::{SameSizeSet, TotalSizeSet}};

/// Feature flags and shared mutable state consumed by the core.
///
/// A caller constructs one `Context` at process start and passes it by
/// reference into [`crate::device::DeviceTree`] and
/// [`crate::action::ActionQueue::process`].
#[derive(Debug, Clone)]
pub struct Context {
    /// Enables best-effort teardown of conflicting active devices and
    /// other installer-specific fixups during `ActionQueue::process`.
    pub installer_mode: bool,
    /// If false, an extended partition with no logical partitions is
    /// removed automatically by `update_extended_partitions`.
    pub keep_empty_ext_partitions: bool,
    /// If true, newly created partitions on a GPT disklabel receive a
    /// partition-type UUID from the table in [`crate::gpt`], resolved
    /// from the partition's target mountpoint and `arch`.
    pub gpt_discoverable_partitions: bool,
    /// Target architecture used to resolve architecture-qualified GPT
    /// roles (`root`, `usr`, ...) when `gpt_discoverable_partitions` is
    /// set. Ignored otherwise.
    pub arch: Arch,
    /// Device names for which the LVM command cache's reject filter
    /// should be temporarily cleared while a commit touches them.
    pub lvm_filter_removals: Vec<String>,
    /// The disk the running host booted from, if known. The allocator
    /// moves this disk to the head of a request's candidate-disk list
    /// (§4.4 main loop, step 1) so a loosely-specified request prefers
    /// the boot disk over other candidates, all else equal.
    pub boot_disk: Option<DeviceId>,
    /// Cross-chunk "must sum to a fixed total" constraints the grower
    /// reconciles once a disk's chunk has grown (§4.5.1 `TotalSizeSet`).
    pub total_size_sets: Vec<TotalSizeSet>,
    /// Cross-chunk "must all finish the same size" constraints (§4.5.1
    /// `SameSizeSet`), e.g. a root partition and its verity partner.
    pub same_size_sets: Vec<SameSizeSet>,
}

impl Default for Context {
    fn default() -> Context {
        Context {
            installer_mode:              false,
            keep_empty_ext_partitions:   true,
            gpt_discoverable_partitions: false,
            arch:                        "x86_64",
            lvm_filter_removals:         Vec::new(),
            boot_disk:                   None,
            total_size_sets:             Vec::new(),
            same_size_sets:              Vec::new(),
        }
    }
}

impl Context {
    pub fn new() -> Context { Context::default() }

    /// Marks `name` to have its LVM filter entry removed for the
    /// duration of the next commit.
    pub fn lvm_cc_remove_filter_reject_regexp(&mut self, name: String) {
        if !self.lvm_filter_removals.contains(&name) {
            self.lvm_filter_removals.push(name);
        }
    }
}
