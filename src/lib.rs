//! Core of a declarative block-storage configuration engine.
//!
//! Owns an in-memory device tree (disks, partitions, RAID, LVM, Btrfs,
//! LUKS, filesystem formats), a queue of reified modifications to that
//! tree, a disk-geometry-aware partition allocator and grower, and a
//! static GPT partition-type discovery table. Population of the tree
//! from a running host, the device-class shell-outs that actually
//! create/destroy/resize a device, CLI/config loading, fstab/crypttab
//! persistence, bootloader integration and D-Bus bindings are external
//! collaborators and live outside this crate.

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;

pub mod action;
pub mod callbacks;
pub mod context;
pub mod device;
pub mod error;
pub mod gpt;
pub mod partitioning;
pub mod size;

pub use self::{
    action::{Action, ActionObject, ActionQueue, ActionType},
    callbacks::Callbacks,
    context::Context,
    device::{Device, DeviceFormat, DeviceId, DeviceKind, DeviceTree},
    error::{
        DependencyError, DiskLabelCommitError, GptUuidError, PartitioningError, StorageError,
        TreeError,
    },
    size::Size,
};
