// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Secure Partition Manager Core, defined by Arm Firmware Framework for A-Profile (FF-A).
//!
//! The SPMC runs at EL3 alongside the rest of the firmware. Calls from the normal world and from
//! secure partitions arrive through [`Service`], are decoded into an [`Interface`] and dispatched
//! to the handlers in the submodules. A handler either answers the caller directly, or asks for the
//! other world to be entered with the registers it built.

pub mod abi;
pub mod descriptor;
mod discovery;
pub mod logical;
pub mod mailbox;
pub mod mem_perm;
mod memory;
mod messaging;
pub mod partition;
pub mod pm;
pub mod runtime;
pub mod shmem;

pub use self::{
    descriptor::{MemTransaction, TransactionType},
    logical::LogicalPartition,
    mailbox::RxTxBuffers,
    partition::PartitionManifest,
    pm::PsciSpmInterface,
};

use self::{
    abi::{NWD_ID, SPMC_ID, SPMC_VERSION, decode, success, success_with},
    logical::{MAX_LOGICAL_PARTITIONS, init_logical_partitions},
    mailbox::Mailbox,
    partition::{MAX_PARTITIONS, SecurePartition, assign_ids},
    runtime::ExecutionContext,
    shmem::ShmemStore,
};
use crate::{
    context::{PerCoreState, RunResult, Target, World, WorldSwitch},
    platform::{Platform, PlatformImpl, WorldSwitchImpl, exception_free},
    services::{Service, owns},
    smccc::{FunctionId, OwningEntityNumber, SmcReturn},
};
use arm_ffa::{
    FfaError, Interface, Version, VersionOut,
    interface_args::{RxTxAddr, SecondaryEpRegisterAddr, SuccessArgsIdGet, SuccessArgsSpmIdGet},
};
use arrayvec::ArrayVec;
use core::cell::RefCell;
use log::{debug, error, info, warn};
use percore::{ExceptionLock, PerCore};
use spin::mutex::SpinMutex;

const FUNCTION_NUMBER_MIN: u16 = 0x0060;
const FUNCTION_NUMBER_MAX: u16 = 0x00EF;

/// Maximum number of endpoints reported by FFA_PARTITION_INFO_GET.
const MAX_ENDPOINTS: usize = MAX_PARTITIONS + MAX_LOGICAL_PARTITIONS;

/// Who made an FF-A call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Caller {
    /// The hypervisor or OS kernel.
    NormalWorld,
    /// The secure partition with the given index, running on the current core.
    Partition(usize),
}

/// What to do once a call has been handled.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Outcome {
    /// Return to the caller with these registers.
    Return(SmcReturn),
    /// Enter the other world with these registers.
    Switch(SmcReturn),
    /// End the synchronous entry of the calling partition, handing these registers to the SPMC.
    SyncExit(SmcReturn),
}

/// The normal world as an FF-A endpoint.
struct NormalWorld {
    version: SpinMutex<Version>,
    mailbox: Mailbox,
}

/// Core-local state of the SPMC.
struct SpmcLocal {
    /// Index of the partition whose execution context is scheduled on this core.
    current: Option<usize>,
}

impl SpmcLocal {
    const fn new() -> Self {
        Self { current: None }
    }
}

/// Secure Partition Manager Core.
pub struct Spmc {
    partitions: ArrayVec<SecurePartition, MAX_PARTITIONS>,
    logical_partitions: &'static [&'static dyn LogicalPartition],
    normal_world: NormalWorld,
    shmem: SpinMutex<ShmemStore>,
    core_local: PerCoreState<SpmcLocal>,
    world: WorldSwitchImpl,
}

impl Service for Spmc {
    owns!(
        OwningEntityNumber::STANDARD_SECURE,
        FUNCTION_NUMBER_MIN..=FUNCTION_NUMBER_MAX
    );

    fn handle_non_secure_smc(&self, regs: &[u64; 18]) -> (SmcReturn, World) {
        match self.handle_call(Caller::NormalWorld, regs) {
            Outcome::Return(out_regs) => (out_regs, World::NonSecure),
            Outcome::Switch(out_regs) => (out_regs, World::Secure),
            Outcome::SyncExit(out_regs) => {
                error!("Synchronous exit requested by the normal world: {out_regs:?}");
                (FfaError::Denied.into(), World::NonSecure)
            }
        }
    }

    fn handle_secure_smc(&self, regs: &[u64; 18]) -> (SmcReturn, World) {
        let Some(index) = self.current_partition() else {
            panic!("FF-A call from the secure world with no partition scheduled");
        };

        match self.handle_call(Caller::Partition(index), regs) {
            Outcome::Return(out_regs) => (out_regs, World::Secure),
            Outcome::Switch(out_regs) => {
                self.set_current_partition(None);
                (out_regs, World::NonSecure)
            }
            Outcome::SyncExit(out_regs) => {
                error!("Synchronous exit outside of a synchronous entry: {out_regs:?}");
                (FfaError::Denied.into(), World::Secure)
            }
        }
    }
}

impl Spmc {
    /// Creates the SPMC state for the given partitions.
    ///
    /// Endpoint IDs are assigned to the secure partitions and the logical partitions are
    /// initialised. The secure partitions are not entered until [`Spmc::boot_partitions`].
    pub fn new(
        manifests: &[PartitionManifest],
        logical_partitions: &'static [&'static dyn LogicalPartition],
        world: WorldSwitchImpl,
    ) -> Self {
        info!(
            "Initializing SPMC with {} secure and {} logical partitions",
            manifests.len(),
            logical_partitions.len()
        );

        let ids = assign_ids(manifests);
        let partitions = manifests
            .iter()
            .zip(&ids)
            .map(|(manifest, id)| SecurePartition::new(manifest, *id))
            .collect();
        init_logical_partitions(logical_partitions, &ids);

        Self {
            partitions,
            logical_partitions,
            normal_world: NormalWorld {
                version: SpinMutex::new(SPMC_VERSION),
                mailbox: Mailbox::new(),
            },
            shmem: SpinMutex::new(ShmemStore::new()),
            core_local: PerCore::new(
                [const { ExceptionLock::new(RefCell::new(SpmcLocal::new())) };
                    PlatformImpl::CORE_COUNT],
            ),
            world,
        }
    }

    /// Runs the initialisation of every secure partition on the current core, in order.
    ///
    /// A partition which reports an error is marked as failed and refuses all further work, but
    /// doesn't stop the others from booting.
    pub fn boot_partitions(&self) {
        for (index, partition) in self.partitions.iter().enumerate() {
            info!("Booting secure partition {:#x}", partition.id);
            if !self.init_context(index, partition.entry_point) {
                partition.mark_failed();
            }
        }
    }

    /// Initialises the current core's execution context of partition `index` from
    /// `entry_point`. Returns whether the partition reached FFA_MSG_WAIT.
    fn init_context(&self, index: usize, entry_point: usize) -> bool {
        let id = self.partitions[index].id;
        self.with_context(index, ExecutionContext::begin_init);

        let exit = self.sync_entry(index, Some(entry_point), SmcReturn::EMPTY);
        if let Ok(Interface::MsgWait { .. }) = decode(&exit.to_regs()) {
            info!("Secure partition {id:#x} initialised");
            true
        } else {
            error!("Secure partition {id:#x} failed to initialise: {exit:?}");
            false
        }
    }

    /// Enters `world` on the current core with the given registers.
    ///
    /// The secure world means the partition execution context currently scheduled on this core.
    pub fn enter_world(&self, regs: &SmcReturn, world: World) -> RunResult {
        let target = match world {
            World::NonSecure => Target::NormalWorld,
            World::Secure => {
                let Some(index) = self.current_partition() else {
                    panic!("No partition scheduled to run on this core");
                };
                Target::Partition {
                    id: self.partitions[index].id,
                    entry_point: None,
                }
            }
        };
        self.world.enter(target, regs)
    }

    /// Enters the execution context of partition `index` on the current core and handles its
    /// calls until it hands control back to the SPMC.
    ///
    /// Calls which would switch to the normal world are refused while the entry lasts.
    fn sync_entry(&self, index: usize, entry_point: Option<usize>, regs: SmcReturn) -> SmcReturn {
        let id = self.partitions[index].id;
        let previous = self.set_current_partition(Some(index));

        let mut target = Target::Partition { id, entry_point };
        let mut regs = regs;
        let exit = loop {
            match self.world.enter(target, &regs) {
                RunResult::Smc { regs: call } => {
                    match self.handle_call(Caller::Partition(index), &call) {
                        Outcome::Return(out_regs) => regs = out_regs,
                        Outcome::Switch(out_regs) => {
                            warn!(
                                "Partition {id:#x} can't leave a synchronous entry with {out_regs:?}"
                            );
                            regs = FfaError::Denied.into();
                        }
                        Outcome::SyncExit(out_regs) => break out_regs,
                    }
                }
                RunResult::Interrupt => {
                    panic!("Interrupt taken during synchronous entry of partition {id:#x}")
                }
            }
            target = Target::Partition {
                id,
                entry_point: None,
            };
        };

        self.set_current_partition(previous);
        exit
    }

    /// Decodes and handles a single FF-A call.
    fn handle_call(&self, caller: Caller, regs: &[u64; 18]) -> Outcome {
        let mut function = FunctionId(regs[0] as u32);
        function.clear_sve_hint();
        let mut regs = *regs;
        regs[0] = function.0.into();

        let message = match decode(&regs) {
            Ok(message) => message,
            Err(arm_ffa::Error::InvalidVersion(version)) => {
                warn!("Invalid version {version:#x} in {function} from {caller:?}");
                return Outcome::Return(
                    Interface::VersionOut {
                        output_version: VersionOut::NotSupported,
                    }
                    .into(),
                );
            }
            Err(error) => {
                warn!("Invalid FF-A call {function} from {caller:?}: {error}");
                return Outcome::Return(FfaError::from(error).into());
            }
        };
        debug!("Handle {message:x?} from {caller:?}");

        self.dispatch(caller, message, &regs).unwrap_or_else(|error| {
            debug!("{function} from {caller:?} failed: {error:?}");
            Outcome::Return(error.into())
        })
    }

    fn dispatch(
        &self,
        caller: Caller,
        message: Interface,
        regs: &[u64; 18],
    ) -> Result<Outcome, FfaError> {
        match message {
            Interface::Version { input_version, .. } => {
                Ok(Outcome::Return(self.version(caller, input_version)))
            }
            Interface::Features {
                feat_id,
                input_properties,
            } => self.features(caller, feat_id, input_properties),
            Interface::IdGet => Ok(Outcome::Return(success_with(SuccessArgsIdGet {
                id: self.caller_id(caller),
            }))),
            Interface::SpmIdGet => Ok(Outcome::Return(success_with(SuccessArgsSpmIdGet {
                id: SPMC_ID,
            }))),
            Interface::PartitionInfoGet { uuid, flags } => {
                self.partition_info_get(caller, uuid, flags.count_only)
            }
            Interface::RxTxMap { addr, page_cnt } => {
                let (tx, rx) = match addr {
                    RxTxAddr::Addr32 { rx, tx } => (tx.into(), rx.into()),
                    RxTxAddr::Addr64 { rx, tx } => (tx, rx),
                };
                self.caller_mailbox(caller).map(tx, rx, page_cnt)?;
                Ok(Outcome::Return(success()))
            }
            Interface::RxTxUnmap { id } => {
                self.caller_mailbox(caller).unmap(id)?;
                Ok(Outcome::Return(success()))
            }
            Interface::RxRelease { .. } => {
                self.caller_mailbox(caller).release()?;
                Ok(Outcome::Return(success()))
            }
            Interface::MsgSendDirectReq {
                src_id,
                dst_id,
                args,
            } => self.direct_request(caller, src_id, dst_id, args),
            Interface::MsgSendDirectResp {
                src_id,
                dst_id,
                args,
            } => self.direct_response(caller, src_id, dst_id, args),
            Interface::MsgWait { .. } => self.msg_wait(caller, message),
            Interface::Error { error_code, .. } => self.partition_error(caller, error_code),
            Interface::Yield { .. } => self.yield_cpu(caller, regs),
            Interface::Run { target_info, .. } => self.run(caller, target_info),
            Interface::MemShare {
                total_len,
                frag_len,
                buf,
            } => self.mem_send(TransactionType::Share, caller, total_len, frag_len, buf),
            Interface::MemLend {
                total_len,
                frag_len,
                buf,
            } => self.mem_send(TransactionType::Lend, caller, total_len, frag_len, buf),
            Interface::MemFragTx {
                handle,
                frag_len,
                endpoint_id,
            } => self.mem_frag_tx(caller, handle, frag_len, endpoint_id),
            Interface::MemRetrieveReq {
                total_len,
                frag_len,
                buf,
            } => self.mem_retrieve_req(caller, total_len, frag_len, buf),
            Interface::MemFragRx {
                handle,
                frag_offset,
                endpoint_id,
            } => self.mem_frag_rx(caller, handle, frag_offset, endpoint_id),
            Interface::MemRelinquish => self.mem_relinquish(caller),
            Interface::MemReclaim { handle, flags } => self.mem_reclaim(caller, handle, flags),
            Interface::MemPermGet { addr, page_cnt } => {
                self.mem_perm_get(caller, addr.address(), page_cnt)
            }
            Interface::MemPermSet {
                addr,
                page_cnt,
                mem_perm,
            } => self.mem_perm_set(caller, addr.address(), page_cnt, mem_perm),
            Interface::SecondaryEpRegister { entrypoint } => {
                let entry_point = match entrypoint {
                    SecondaryEpRegisterAddr::Addr32(address) => address.into(),
                    SecondaryEpRegisterAddr::Addr64(address) => address,
                };
                self.secondary_ep_register(caller, entry_point)
            }
            // Secure interrupts are handled to completion before the normal world resumes.
            Interface::NormalWorldResume { .. } => Err(FfaError::Denied),
            _ => {
                warn!("Unsupported FF-A call {message:x?} from {caller:?}");
                Err(FfaError::NotSupported)
            }
        }
    }

    /// Returns the index of the secure partition with the given ID.
    fn find_partition(&self, id: u16) -> Option<usize> {
        self.partitions
            .iter()
            .position(|partition| partition.id == id)
    }

    fn find_logical_partition(&self, id: u16) -> Option<&'static dyn LogicalPartition> {
        self.logical_partitions
            .iter()
            .find(|partition| partition.id() == id)
            .copied()
    }

    fn caller_id(&self, caller: Caller) -> u16 {
        match caller {
            Caller::NormalWorld => NWD_ID,
            Caller::Partition(index) => self.partitions[index].id,
        }
    }

    fn caller_version(&self, caller: Caller) -> Version {
        match caller {
            Caller::NormalWorld => *self.normal_world.version.lock(),
            Caller::Partition(index) => self.partitions[index].ffa_version,
        }
    }

    fn caller_mailbox(&self, caller: Caller) -> &Mailbox {
        match caller {
            Caller::NormalWorld => &self.normal_world.mailbox,
            Caller::Partition(index) => &self.partitions[index].mailbox,
        }
    }

    /// Returns the index of the partition scheduled on the current core.
    fn current_partition(&self) -> Option<usize> {
        exception_free(|token| self.core_local.get().borrow(token).borrow().current)
    }

    /// Schedules a partition on the current core, returning the one scheduled before.
    fn set_current_partition(&self, index: Option<usize>) -> Option<usize> {
        exception_free(|token| {
            let current = &mut self.core_local.get().borrow_mut(token).current;
            core::mem::replace(current, index)
        })
    }

    /// Runs `f` on the current core's execution context of partition `index`.
    fn with_context<R>(&self, index: usize, f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        self.partitions[index].contexts.with_current(f)
    }
}

/// Pads `values` with zeroes to a full register set.
#[cfg(test)]
fn regs(values: &[u64]) -> [u64; 18] {
    let mut regs = [0; 18];
    regs[..values.len()].copy_from_slice(values);
    regs
}

#[cfg(test)]
impl Spmc {
    /// Makes a call as `caller` with the given registers.
    fn call(&self, caller: Caller, values: &[u64]) -> Outcome {
        self.handle_call(caller, &regs(values))
    }

    /// Makes the given FF-A call as `caller`.
    fn send(&self, caller: Caller, message: Interface) -> Outcome {
        self.handle_call(caller, &SmcReturn::from(message).to_regs())
    }

    /// Returns the world switch, to script partition and normal world exits.
    pub(crate) fn world(&self) -> &WorldSwitchImpl {
        &self.world
    }

    /// Creates an SPMC with one S-EL1 partition per manifest and no logical partitions.
    fn with_partitions(manifests: &[PartitionManifest]) -> Self {
        Self::new(
            manifests,
            &[],
            crate::platform::test::TestWorldSwitch::new(),
        )
    }
}
