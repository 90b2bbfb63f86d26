// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Power management events, delivered to secure partitions as framework direct requests.

use super::{
    Caller, Outcome, Spmc,
    abi::{SPMC_ID, decode, success},
    partition::{PmMessages, RuntimeEl},
    runtime::{ExecutionContext, PendingRequest, RequestKind, RuntimeModel},
};
use crate::{
    platform::{Platform, PlatformImpl},
    smccc::SmcReturn,
};
use arm_ffa::{
    FfaError, Interface,
    interface_args::{DirectMsgArgs, WarmBootType},
};
use arm_psci::{ErrorCode, Function};
use log::{debug, info, warn};

const PSCI_SUCCESS: u64 = 0;

/// PSCI SPM interface.
///
/// Contains the callbacks that the PSCI implementation uses to inform the Secure World about power
/// management events.
pub trait PsciSpmInterface {
    /// Forward a PSCI request to the SPM, returning the PSCI status of the secure world.
    fn forward_psci_request(&self, psci_request: &[u64; 4]) -> u64;

    /// Notify the SPM about a CPU_OFF event.
    ///
    /// The PSCI service has received a CPU_OFF request, so the current core will be turned off.
    /// Before calling this function, the PSCI request itself should be forwarded to SWd using
    /// forward_psci_request()
    fn notify_cpu_off(&self);
}

impl PsciSpmInterface for Spmc {
    fn forward_psci_request(&self, psci_request: &[u64; 4]) -> u64 {
        let function = match Function::try_from(psci_request) {
            Ok(function) => function,
            Err(error) => {
                warn!("Invalid PSCI request {psci_request:#x?}: {error:?}");
                return ErrorCode::InvalidParameters.into();
            }
        };
        let subscription = match function {
            Function::CpuOff => PmMessages::CPU_OFF,
            Function::CpuSuspend { .. } => PmMessages::CPU_SUSPEND,
            _ => {
                debug!("No secure partition handles {function:?}");
                return PSCI_SUCCESS;
            }
        };

        // PM messages use the SMC32 convention, so only the low halves are passed on.
        let params = psci_request.map(|param| param as u32);
        self.send_pm_message(subscription, DirectMsgArgs::PowerPsciReq32 { params })
    }

    fn notify_cpu_off(&self) {
        for partition in &self.partitions {
            if partition.contexts.is_per_core() {
                partition.contexts.with_current(ExecutionContext::reset);
            }
        }
        self.set_current_partition(None);
        info!("Core {} off", PlatformImpl::core_position());
    }
}

impl Spmc {
    /// Initialises the per-core partitions on a core which has just been turned on.
    ///
    /// Only S-EL1 partitions which booted and registered a secondary entry point are entered.
    pub fn cpu_on_finish(&self) {
        for (index, partition) in self.partitions.iter().enumerate() {
            if partition.runtime_el != RuntimeEl::SEl1 || !partition.contexts.is_per_core() {
                continue;
            }
            if partition.has_failed() {
                debug!("Not entering failed partition {:#x}", partition.id);
                continue;
            }
            let Some(entry_point) = *partition.secondary_ep.lock() else {
                debug!("Partition {:#x} has no secondary entry point", partition.id);
                continue;
            };
            self.init_context(index, entry_point);
        }
    }

    /// Tells the subscribed partitions that the current core resumed from suspend.
    pub fn suspend_finish(&self) {
        let status = self.send_pm_message(
            PmMessages::CPU_SUSPEND_RESUME,
            DirectMsgArgs::PowerWarmBootReq {
                boot_type: WarmBootType::ExitFromLowPower,
            },
        );
        if status != PSCI_SUCCESS {
            warn!("Secure partitions returned {status:#x} on resume from suspend");
        }
    }

    /// Sends a framework message to every S-EL1 partition subscribed to `subscription`, and
    /// returns the first non-zero status.
    ///
    /// Partitions which failed to boot are skipped.
    fn send_pm_message(&self, subscription: PmMessages, args: DirectMsgArgs) -> u64 {
        let mut status = PSCI_SUCCESS;
        for (index, partition) in self.partitions.iter().enumerate() {
            if partition.runtime_el != RuntimeEl::SEl1
                || !partition.pm_messages.contains(subscription)
                || partition.has_failed()
            {
                continue;
            }
            let partition_status = self.pm_request(index, args);
            if status == PSCI_SUCCESS {
                status = partition_status;
            }
        }
        status
    }

    /// Sends a single framework request to partition `index` and waits for its response.
    fn pm_request(&self, index: usize, args: DirectMsgArgs) -> u64 {
        let id = self.partitions[index].id;
        let accepted = self.with_context(index, |context| {
            context.begin_direct_request(PendingRequest {
                origin: SPMC_ID,
                kind: RequestKind::PowerManagement,
            })
        });
        if let Err(error) = accepted {
            warn!("Partition {id:#x} can't take power management message: {error:?}");
            return ErrorCode::Denied.into();
        }

        let request = Interface::MsgSendDirectReq {
            src_id: SPMC_ID,
            dst_id: id,
            args,
        };
        let exit = self.sync_entry(index, None, SmcReturn::from(request));
        match decode(&exit.to_regs()) {
            Ok(Interface::MsgSendDirectResp {
                args: DirectMsgArgs::PowerPsciResp { psci_status },
                ..
            }) => psci_status as u64,
            _ => {
                warn!("Partition {id:#x} failed power management message: {exit:?}");
                ErrorCode::Denied.into()
            }
        }
    }

    /// Handles FFA_SECONDARY_EP_REGISTER, which S-EL1 partitions call while initialising.
    pub(super) fn secondary_ep_register(
        &self,
        caller: Caller,
        entry_point: u64,
    ) -> Result<Outcome, FfaError> {
        let Caller::Partition(index) = caller else {
            return Err(FfaError::NotSupported);
        };
        let partition = &self.partitions[index];
        if partition.runtime_el != RuntimeEl::SEl1 {
            return Err(FfaError::Denied);
        }
        if self.with_context(index, |context| context.model()) != RuntimeModel::Init {
            warn!(
                "Partition {:#x} registered a secondary entry point after initialisation",
                partition.id
            );
            return Err(FfaError::Denied);
        }

        if partition.mailbox.contains(entry_point) {
            warn!("Secondary entry point {entry_point:#x} is in the RX/TX buffers");
            return Err(FfaError::InvalidParameters);
        }
        *partition.secondary_ep.lock() = Some(entry_point as usize);
        debug!(
            "Partition {:#x} secondary entry point {entry_point:#x}",
            partition.id
        );
        Ok(Outcome::Return(success()))
    }
}
