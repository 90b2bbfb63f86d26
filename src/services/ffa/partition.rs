// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Secure partitions and their execution contexts.

use super::{
    abi::{INVALID_PARTITION_ID, SP_ID_BASE, SPMC_ID, SPMD_ID, is_secure_id},
    mailbox::Mailbox,
    mem_perm::{MemoryRegion, MemoryRegions},
    runtime::ExecutionContext,
};
use crate::{
    context::PerCoreState,
    platform::{Platform, PlatformImpl, exception_free},
};
use arm_ffa::{Version, partition_info};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, Ordering},
};
use percore::{ExceptionLock, PerCore};
use spin::mutex::SpinMutex;
use uuid::Uuid;

/// Maximum number of secure partitions.
pub const MAX_PARTITIONS: usize = 8;

bitflags! {
    /// Messaging capabilities advertised in FFA_PARTITION_INFO_GET.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PartitionProperties: u32 {
        /// Can receive direct requests.
        const DIRECT_REQ_RECV = 1 << 0;
        /// Can send direct requests.
        const DIRECT_REQ_SEND = 1 << 1;
        /// Supports indirect messaging.
        const INDIRECT_MSG = 1 << 2;
        /// Supports receipt of notifications.
        const NOTIFICATIONS = 1 << 3;
        /// Runs in the AArch64 execution state.
        const AARCH64 = 1 << 8;
    }
}

impl From<PartitionProperties> for partition_info::PartitionProperties {
    fn from(properties: PartitionProperties) -> Self {
        Self {
            support_direct_req_rec: properties.contains(PartitionProperties::DIRECT_REQ_RECV),
            support_direct_req_send: properties.contains(PartitionProperties::DIRECT_REQ_SEND),
            support_indirect_msg: properties.contains(PartitionProperties::INDIRECT_MSG),
            support_notif_rec: properties.contains(PartitionProperties::NOTIFICATIONS),
            is_aarch64: properties.contains(PartitionProperties::AARCH64),
            ..Default::default()
        }
    }
}

bitflags! {
    /// Power management events a partition subscribes to.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PmMessages: u32 {
        /// The partition's core is being turned off.
        const CPU_OFF = 1 << 0;
        /// The partition's core is entering a power down suspend state.
        const CPU_SUSPEND = 1 << 1;
        /// The partition's core resumed from a power down suspend state.
        const CPU_SUSPEND_RESUME = 1 << 2;
    }
}

/// Exception level a secure partition runs at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeEl {
    /// S-EL1, with its own exception vectors.
    SEl1,
    /// S-EL0, with page tables managed on its behalf.
    SEl0,
}

/// How many execution contexts a partition has.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContextShape {
    /// One execution context pinned to each core.
    PerCore,
    /// A single execution context which migrates between cores.
    Single,
}

/// Static description of a secure partition.
#[derive(Clone, Debug)]
pub struct PartitionManifest {
    /// Fixed endpoint ID, or `None` to assign one at boot.
    pub id: Option<u16>,
    /// Partition UUID, with its bytes in the order they are passed in registers.
    pub uuid: Uuid,
    /// Exception level the partition runs at.
    pub runtime_el: RuntimeEl,
    /// FF-A version the partition implements.
    pub ffa_version: Version,
    /// Messaging capabilities, other than the execution state which is implied.
    pub properties: PartitionProperties,
    /// Power management subscriptions.
    pub pm_messages: PmMessages,
    /// Entry point on the primary core.
    pub entry_point: usize,
    /// Number of execution contexts.
    pub execution_contexts: ContextShape,
    /// Memory regions whose permissions the partition may query and change. Only used for S-EL0
    /// partitions.
    pub memory_regions: &'static [MemoryRegion],
}

/// The execution contexts of a partition.
pub enum ExecutionContexts {
    /// One context per core, only ever touched by its own core.
    PerCore(PerCoreState<ExecutionContext>),
    /// A single context shared by all cores.
    Single(SpinMutex<ExecutionContext>),
}

impl ExecutionContexts {
    fn new(shape: ContextShape) -> Self {
        match shape {
            ContextShape::PerCore => Self::PerCore(PerCore::new(
                [const { ExceptionLock::new(RefCell::new(ExecutionContext::new())) };
                    PlatformImpl::CORE_COUNT],
            )),
            ContextShape::Single => Self::Single(SpinMutex::new(ExecutionContext::new())),
        }
    }

    /// Runs `f` on the context that belongs to the current core.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        match self {
            Self::PerCore(contexts) => {
                exception_free(|token| f(&mut contexts.get().borrow_mut(token)))
            }
            Self::Single(context) => f(&mut context.lock()),
        }
    }

    /// Returns the vCPU index of the context used on the current core.
    pub fn current_index(&self) -> u16 {
        match self {
            Self::PerCore(_) => PlatformImpl::core_position() as u16,
            Self::Single(_) => 0,
        }
    }

    /// Returns the number of contexts.
    pub fn count(&self) -> u16 {
        match self {
            Self::PerCore(_) => PlatformImpl::CORE_COUNT as u16,
            Self::Single(_) => 1,
        }
    }

    /// Returns whether there is a context per core.
    pub fn is_per_core(&self) -> bool {
        matches!(self, Self::PerCore(_))
    }
}

/// Runtime state of a secure partition.
pub struct SecurePartition {
    /// Endpoint ID.
    pub id: u16,
    /// Partition UUID.
    pub uuid: Uuid,
    /// Exception level the partition runs at.
    pub runtime_el: RuntimeEl,
    /// FF-A version the partition implements.
    pub ffa_version: Version,
    /// Messaging capabilities, including the execution state.
    pub properties: PartitionProperties,
    /// Power management subscriptions.
    pub pm_messages: PmMessages,
    /// Entry point on the primary core.
    pub entry_point: usize,
    /// Entry point on secondary cores, registered during initialisation.
    pub secondary_ep: SpinMutex<Option<usize>>,
    /// Whether a v1.0 partition asked for the NS bit in retrieve responses.
    pub ns_bit_requested: AtomicBool,
    failed: AtomicBool,
    /// RX/TX buffers.
    pub mailbox: Mailbox,
    /// Execution contexts.
    pub contexts: ExecutionContexts,
    /// Memory regions of an S-EL0 partition.
    pub memory_regions: SpinMutex<MemoryRegions>,
}

impl SecurePartition {
    /// Creates the runtime state of a partition with an assigned ID.
    pub fn new(manifest: &PartitionManifest, id: u16) -> Self {
        Self {
            id,
            uuid: manifest.uuid,
            runtime_el: manifest.runtime_el,
            ffa_version: manifest.ffa_version,
            properties: manifest.properties | PartitionProperties::AARCH64,
            pm_messages: manifest.pm_messages,
            entry_point: manifest.entry_point,
            secondary_ep: SpinMutex::new(None),
            ns_bit_requested: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            mailbox: Mailbox::new(),
            contexts: ExecutionContexts::new(manifest.execution_contexts),
            memory_regions: SpinMutex::new(MemoryRegions::new(manifest.memory_regions)),
        }
    }

    /// Records that the partition reported an error instead of finishing its initialisation.
    ///
    /// A failed partition is never entered again and isn't reported to other endpoints.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    /// Returns whether the partition failed to initialise.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Returns whether `id` can't be given to a partition.
pub fn is_reserved_id(id: u16) -> bool {
    !is_secure_id(id) || id == SPMC_ID || id == SPMD_ID || id == INVALID_PARTITION_ID
}

/// Picks an endpoint ID for each manifest.
///
/// Fixed IDs are kept; the others are `SP_ID_BASE + index`, moved up past any ID already taken
/// or reserved.
///
/// # Panics
///
/// Panics if there are more than `MAX_PARTITIONS` manifests, a fixed ID is reserved or
/// duplicated, or the ID space runs out.
pub fn assign_ids(manifests: &[PartitionManifest]) -> ArrayVec<u16, MAX_PARTITIONS> {
    assert!(
        manifests.len() <= MAX_PARTITIONS,
        "Too many secure partitions: {}",
        manifests.len()
    );

    let fixed = |id: u16| manifests.iter().any(|manifest| manifest.id == Some(id));
    let mut ids = ArrayVec::new();
    for (index, manifest) in manifests.iter().enumerate() {
        let id = match manifest.id {
            Some(id) => {
                assert!(!is_reserved_id(id), "Reserved partition ID {id:#x}");
                assert!(!ids.contains(&id), "Duplicate partition ID {id:#x}");
                id
            }
            None => {
                let mut candidate = SP_ID_BASE.checked_add(index as u16);
                while let Some(id) = candidate
                    && (is_reserved_id(id) || ids.contains(&id) || fixed(id))
                {
                    candidate = id.checked_add(1);
                }
                let Some(id) = candidate else {
                    panic!("Partition ID space exhausted");
                };
                id
            }
        };
        ids.push(id);
    }
    ids
}
