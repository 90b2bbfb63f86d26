// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Arm Fixed Virtual Platform.

use super::Platform;
use crate::{
    context::{RunResult, Target, WorldSwitch},
    logger::{self, LockedWriter},
    services::ffa::{
        LogicalPartition, PartitionManifest, RxTxBuffers,
        abi::SPMC_VERSION,
        descriptor::PAGE_SIZE,
        mem_perm::MemPermissions,
        partition::{ContextShape, PartitionProperties, PmMessages, RuntimeEl},
    },
    smccc::SmcReturn,
};
use arm_ffa::FfaError;
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use arm_sysregs::{MpidrEl1, read_mpidr_el1};
use core::{ptr::NonNull, slice};
use uuid::uuid;

const FVP_CLUSTER_COUNT: usize = 2;
const FVP_MAX_CPUS_PER_CLUSTER: usize = 4;
const FVP_MAX_PE_PER_CPU: usize = 1;

// Base address of the primary PL011 UART.
const PL011_BASE_ADDRESS: *mut PL011Registers = 0x1C09_0000 as _;

/// Non-secure DRAM which the normal world may use for its RX/TX buffers.
const NS_DRAM_BASE: u64 = 0x8000_0000;
const NS_DRAM_SIZE: u64 = 0x7F00_0000;

/// Secure DRAM, holding the partitions and their buffers.
const SECURE_DRAM_BASE: u64 = 0x0600_0000;
const SECURE_DRAM_SIZE: u64 = 0x0200_0000;

static SECURE_PARTITIONS: [PartitionManifest; 1] = [PartitionManifest {
    id: Some(0x8001),
    uuid: uuid!("a8f4d3b1-5a2e-4b8c-9f6d-0e1c2b3a4d5f"),
    runtime_el: RuntimeEl::SEl1,
    ffa_version: SPMC_VERSION,
    properties: PartitionProperties::DIRECT_REQ_RECV.union(PartitionProperties::DIRECT_REQ_SEND),
    pm_messages: PmMessages::CPU_OFF,
    entry_point: 0x0600_0000,
    execution_contexts: ContextShape::PerCore,
    memory_regions: &[],
}];

unsafe extern "C" {
    /// Saves the EL3 state, restores the lower EL context described by `args` on the current
    /// core and returns to it.
    ///
    /// Returns 0 once the lower EL executes an SMC, having written its x0-x17 to `out`, or 1 when
    /// an interrupt routed to EL3 was taken instead.
    fn fvp_enter_lower_el(args: *const WorldSwitchArgs, out: *mut [u64; 18]) -> u64;
}

/// The layout passed to `fvp_enter_lower_el`.
#[repr(C)]
struct WorldSwitchArgs {
    /// 0 for the normal world, 1 for a secure partition.
    secure: u64,
    partition_id: u64,
    /// Address to start the context from, or 0 to resume it.
    entry_point: u64,
    /// Number of valid entries in `regs`.
    regs_used: u64,
    regs: [u64; 18],
}

/// Fixed Virtual Platform
pub struct Fvp;

// SAFETY: `core_position` derives a unique index below `CORE_COUNT` from the affinity fields of
// MPIDR_EL1, as the FVP topology is fixed. `map_rxtx` only returns buffers inside DRAM ranges
// identity mapped for EL3 which hold no SPMC state.
unsafe impl Platform for Fvp {
    const CORE_COUNT: usize = FVP_CLUSTER_COUNT * FVP_MAX_CPUS_PER_CLUSTER * FVP_MAX_PE_PER_CPU;
    const SHMEM_DATASTORE_SIZE: usize = 0x8000;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type WorldSwitchImpl = FvpWorldSwitch;

    fn init() {
        let Some(base) = NonNull::new(PL011_BASE_ADDRESS) else {
            return;
        };
        // SAFETY: `PL011_BASE_ADDRESS` is the base address of a PL011 device, and nothing else
        // accesses that address range.
        let uart_pointer = unsafe { UniqueMmioPointer::new(base) };
        if logger::init(LockedWriter::new(Uart::new(uart_pointer))).is_err() {
            panic!("Failed to initialise logger");
        }
    }

    fn core_position() -> usize {
        let mpidr = read_mpidr_el1();
        let (cluster, cpu, pe) = if mpidr.contains(MpidrEl1::MT) {
            (mpidr.aff2(), mpidr.aff1(), mpidr.aff0())
        } else {
            (mpidr.aff1(), mpidr.aff0(), 0)
        };
        assert!(usize::from(cluster) < FVP_CLUSTER_COUNT);
        assert!(usize::from(cpu) < FVP_MAX_CPUS_PER_CLUSTER);
        assert!(usize::from(pe) < FVP_MAX_PE_PER_CPU);

        (usize::from(cluster) * FVP_MAX_CPUS_PER_CLUSTER + usize::from(cpu)) * FVP_MAX_PE_PER_CPU
            + usize::from(pe)
    }

    fn secure_partitions() -> &'static [PartitionManifest] {
        &SECURE_PARTITIONS
    }

    fn logical_partitions() -> &'static [&'static dyn LogicalPartition] {
        &[]
    }

    fn create_world_switch() -> FvpWorldSwitch {
        FvpWorldSwitch
    }

    fn map_rxtx(
        tx_address: u64,
        rx_address: u64,
        page_count: usize,
    ) -> Result<RxTxBuffers, FfaError> {
        let size = page_count
            .checked_mul(PAGE_SIZE)
            .ok_or(FfaError::InvalidParameters)?;
        let tx = dram_slice(tx_address, size)?;
        let rx = dram_slice(rx_address, size)?;
        if tx_address < rx_address + size as u64 && rx_address < tx_address + size as u64 {
            return Err(FfaError::InvalidParameters);
        }
        Ok(RxTxBuffers::new(tx_address, rx_address, tx, rx))
    }

    fn unmap_rxtx(_buffers: RxTxBuffers) {
        // DRAM stays identity mapped, so dropping the slices is enough.
    }

    fn update_mem_perm(
        _partition_id: u16,
        _base_address: u64,
        _page_count: u32,
        _permissions: MemPermissions,
    ) -> Result<(), FfaError> {
        // No S-EL0 partitions are loaded on FVP.
        Err(FfaError::NotSupported)
    }
}

/// Returns the identity mapping of `size` bytes at `address`, which must lie entirely within one
/// of the DRAM ranges.
fn dram_slice(address: u64, size: usize) -> Result<&'static mut [u8], FfaError> {
    let end = address
        .checked_add(size as u64)
        .ok_or(FfaError::InvalidParameters)?;
    let in_range = |base: u64, length: u64| address >= base && end <= base + length;
    if size == 0
        || address % PAGE_SIZE as u64 != 0
        || !(in_range(NS_DRAM_BASE, NS_DRAM_SIZE) || in_range(SECURE_DRAM_BASE, SECURE_DRAM_SIZE))
    {
        return Err(FfaError::InvalidParameters);
    }
    // SAFETY: The range was checked to be within DRAM which is identity mapped at EL3, and the
    // mailbox keeps at most one mapping of each registered buffer.
    Ok(unsafe { slice::from_raw_parts_mut(address as *mut u8, size) })
}

/// Enters lower ELs through the context management code linked into the EL3 image.
pub struct FvpWorldSwitch;

impl WorldSwitch for FvpWorldSwitch {
    fn enter(&self, target: Target, regs: &SmcReturn) -> RunResult {
        let values = regs.values();
        let mut args = WorldSwitchArgs {
            secure: 0,
            partition_id: 0,
            entry_point: 0,
            regs_used: values.len() as u64,
            regs: [0; 18],
        };
        args.regs[..values.len()].copy_from_slice(values);
        if let Target::Partition { id, entry_point } = target {
            args.secure = 1;
            args.partition_id = id.into();
            args.entry_point = entry_point.unwrap_or(0) as u64;
        }

        let mut out = [0; 18];
        // SAFETY: `args` and `out` are valid for the duration of the call, and the routine only
        // touches the lower EL state of the current core.
        match unsafe { fvp_enter_lower_el(&args, &mut out) } {
            0 => RunResult::Smc { regs: out },
            _ => RunResult::Interrupt,
        }
    }
}
