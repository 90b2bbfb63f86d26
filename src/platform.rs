// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Compile-time platform selection and the hooks every platform implements.

macro_rules! select_platform {
    (platform = $condition:literal, $mod:ident::$plat_impl:ident) => {
        #[cfg(platform = $condition)]
        mod $mod;

        #[cfg(platform = $condition)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    (test, $mod:ident::$plat_impl:ident) => {
        #[cfg(test)]
        pub(crate) mod $mod;

        #[cfg(test)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
}

select_platform!(platform = "fvp", fvp::Fvp);
select_platform!(test, test::TestPlatform);

use crate::{
    context::WorldSwitch,
    logger::LogSink,
    services::ffa::{
        LogicalPartition, MemTransaction, PartitionManifest, RxTxBuffers, TransactionType,
        mem_perm::MemPermissions,
    },
};
use arm_ffa::FfaError;
#[cfg(not(test))]
pub use percore::exception_free;
#[cfg(test)]
pub use test::exception_free;

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

/// The world switch implementation of the selected platform.
pub type WorldSwitchImpl = <PlatformImpl as Platform>::WorldSwitchImpl;

/// The hooks implemented by all platforms.
///
/// # Safety
///
/// `core_position` must never return the same index for two different cores, and must never
/// return a value greater than or equal to `CORE_COUNT`.
///
/// The buffers returned by `map_rxtx` must be valid for reads and writes for their whole length,
/// must not be accessed by anything else at EL3 while they are mapped, and must not overlap any
/// memory owned by the SPMC.
pub unsafe trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// The size in bytes of the arena backing in-flight memory sharing transactions.
    const SHMEM_DATASTORE_SIZE: usize;

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Mechanism for entering lower EL contexts.
    type WorldSwitchImpl: WorldSwitch;

    /// Initialises the logger and anything else the platform needs.
    ///
    /// Any logs sent before this is called will be ignored.
    fn init();

    /// Returns the linear index of the current core.
    fn core_position() -> usize;

    /// Returns the index of the primary core, on which secure partitions are booted.
    fn primary_core() -> usize {
        0
    }

    /// Returns the manifests of the secure partitions to load.
    fn secure_partitions() -> &'static [PartitionManifest];

    /// Returns the logical partitions built into the firmware.
    fn logical_partitions() -> &'static [&'static dyn LogicalPartition];

    /// Creates the world switch used to enter partitions and the normal world.
    fn create_world_switch() -> Self::WorldSwitchImpl;

    /// Maps an RX/TX buffer pair of `page_count` pages each into the SPMC's address space.
    fn map_rxtx(tx_address: u64, rx_address: u64, page_count: usize)
    -> Result<RxTxBuffers, FfaError>;

    /// Unmaps an RX/TX buffer pair previously returned by `map_rxtx`.
    fn unmap_rxtx(buffers: RxTxBuffers);

    /// Called once a share or lend transaction has been fully received and validated.
    ///
    /// An error aborts the transaction.
    fn shmem_begin(_transaction: &MemTransaction, _kind: TransactionType) -> Result<(), FfaError> {
        Ok(())
    }

    /// Called before a reclaimed transaction is freed.
    fn shmem_reclaim(_transaction: &MemTransaction) -> Result<(), FfaError> {
        Ok(())
    }

    /// Applies new permissions to a range of an S-EL0 partition's address space.
    fn update_mem_perm(
        partition_id: u16,
        base_address: u64,
        page_count: u32,
        permissions: MemPermissions,
    ) -> Result<(), FfaError>;
}
