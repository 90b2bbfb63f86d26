// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Direct messaging and scheduling of partition execution contexts.

use super::{
    Caller, Outcome, Spmc,
    abi::{SPMC_ID, is_secure_id, success},
    partition::{PartitionProperties, RuntimeEl},
    runtime::{ExecutionContext, PendingRequest, RequestKind, RuntimeModel, RuntimeState},
};
use crate::smccc::SmcReturn;
use arm_ffa::{
    FfaError, Interface,
    interface_args::{DirectMsgArgs, TargetInfo},
};
use log::{debug, warn};

/// Returns whether `args` carry an implementation defined partition message rather than a
/// framework message.
fn is_partition_message(args: &DirectMsgArgs) -> bool {
    matches!(args, DirectMsgArgs::Args32(_) | DirectMsgArgs::Args64(_))
}

impl Spmc {
    /// Handles FFA_MSG_SEND_DIRECT_REQ.
    ///
    /// Requests to a logical partition are answered immediately. Otherwise only the normal world
    /// may send a request, which schedules the destination partition on the current core.
    pub(super) fn direct_request(
        &self,
        caller: Caller,
        src_id: u16,
        dst_id: u16,
        args: DirectMsgArgs,
    ) -> Result<Outcome, FfaError> {
        if let Some(partition) = self.find_logical_partition(dst_id) {
            let valid_source = match caller {
                Caller::NormalWorld => !is_secure_id(src_id),
                Caller::Partition(index) => src_id == self.partitions[index].id,
            };
            if !valid_source || !is_partition_message(&args) {
                warn!("Invalid direct request from {src_id:#x} to logical partition {dst_id:#x}");
                return Err(FfaError::InvalidParameters);
            }
            let response = Interface::MsgSendDirectResp {
                src_id: dst_id,
                dst_id: src_id,
                args: partition.handle_direct_request(src_id, args),
            };
            return Ok(Outcome::Return(response.into()));
        }

        if caller != Caller::NormalWorld {
            warn!("Direct requests between secure partitions are not supported");
            return Err(FfaError::InvalidParameters);
        }
        if !is_partition_message(&args) || is_secure_id(src_id) {
            warn!("Invalid direct request from the normal world: {args:x?}");
            return Err(FfaError::InvalidParameters);
        }

        let index = self
            .find_partition(dst_id)
            .ok_or(FfaError::InvalidParameters)?;
        let partition = &self.partitions[index];
        if partition.has_failed() {
            debug!("Direct request to failed partition {dst_id:#x}");
            return Err(FfaError::Denied);
        }
        if !partition
            .properties
            .contains(PartitionProperties::DIRECT_REQ_RECV)
        {
            return Err(FfaError::Denied);
        }

        self.with_context(index, |context| {
            context.begin_direct_request(PendingRequest {
                origin: src_id,
                kind: RequestKind::Partition,
            })
        })?;
        self.set_current_partition(Some(index));

        Ok(Outcome::Switch(
            Interface::MsgSendDirectReq {
                src_id,
                dst_id,
                args,
            }
            .into(),
        ))
    }

    /// Handles FFA_MSG_SEND_DIRECT_RESP.
    pub(super) fn direct_response(
        &self,
        caller: Caller,
        src_id: u16,
        dst_id: u16,
        args: DirectMsgArgs,
    ) -> Result<Outcome, FfaError> {
        let Caller::Partition(index) = caller else {
            return Err(FfaError::InvalidParameters);
        };
        if src_id != self.partitions[index].id || (is_secure_id(dst_id) && dst_id != SPMC_ID) {
            warn!("Invalid direct response from {src_id:#x} to {dst_id:#x}");
            return Err(FfaError::InvalidParameters);
        }

        let kind = match args {
            DirectMsgArgs::Args32(_) | DirectMsgArgs::Args64(_) => RequestKind::Partition,
            DirectMsgArgs::PowerPsciResp { .. } => RequestKind::PowerManagement,
            _ => {
                warn!("Unexpected framework message in direct response: {args:x?}");
                return Err(FfaError::Denied);
            }
        };
        self.with_context(index, |context| {
            context.complete_direct_request(dst_id, kind)
        })?;

        let out_regs = Interface::MsgSendDirectResp {
            src_id,
            dst_id,
            args,
        }
        .into();
        if dst_id == SPMC_ID {
            Ok(Outcome::SyncExit(out_regs))
        } else {
            Ok(Outcome::Switch(out_regs))
        }
    }

    /// Handles FFA_MSG_WAIT.
    pub(super) fn msg_wait(&self, caller: Caller, message: Interface) -> Result<Outcome, FfaError> {
        let Caller::Partition(index) = caller else {
            return Err(FfaError::NotSupported);
        };

        match self.with_context(index, ExecutionContext::wait)? {
            RuntimeModel::Init => Ok(Outcome::SyncExit(message.into())),
            // The normal world resumes where the secure interrupt preempted it.
            RuntimeModel::Interrupt => Ok(Outcome::Switch(SmcReturn::EMPTY)),
            RuntimeModel::Run => Ok(Outcome::Switch(message.into())),
            RuntimeModel::DirectRequest => Err(FfaError::Denied),
        }
    }

    /// Handles FFA_ERROR from a partition, which reports a failed initialisation or abandons a
    /// direct request.
    pub(super) fn partition_error(
        &self,
        caller: Caller,
        error_code: FfaError,
    ) -> Result<Outcome, FfaError> {
        let Caller::Partition(index) = caller else {
            return Err(FfaError::NotSupported);
        };
        let id = self.partitions[index].id;

        let (model, aborted) = self.with_context(index, |context| {
            (context.model(), context.abort_direct_request())
        });
        let out_regs = Interface::error(error_code, true).into();
        match (model, aborted) {
            (RuntimeModel::Init, _) => {
                warn!("Partition {id:#x} reported {error_code:?} during initialisation");
                Ok(Outcome::SyncExit(out_regs))
            }
            (RuntimeModel::DirectRequest, Some(request)) => {
                debug!("Partition {id:#x} abandoned {request:?} with {error_code:?}");
                if request.origin == SPMC_ID {
                    Ok(Outcome::SyncExit(out_regs))
                } else {
                    Ok(Outcome::Switch(out_regs))
                }
            }
            _ => Err(FfaError::NotSupported),
        }
    }

    /// Handles FFA_YIELD, giving the CPU cycles of the caller back to the normal world.
    ///
    /// The timeout in w2 and w3 is passed on unchanged.
    pub(super) fn yield_cpu(&self, caller: Caller, regs: &[u64; 18]) -> Result<Outcome, FfaError> {
        let Caller::Partition(index) = caller else {
            return Err(FfaError::NotSupported);
        };
        let partition = &self.partitions[index];

        self.with_context(index, |context| {
            if context
                .pending_request()
                .is_some_and(|request| request.origin == SPMC_ID)
            {
                return Err(FfaError::Denied);
            }
            context.yield_cpu()
        })?;

        let mut out_regs = SmcReturn::from(Interface::Yield { is_32bit: true });
        let target = TargetInfo {
            endpoint_id: partition.id,
            vcpu_id: partition.contexts.current_index(),
        };
        let values = out_regs.values_mut();
        values[1] = u32::from(target).into();
        values[2..4].copy_from_slice(&regs[2..4]);
        Ok(Outcome::Switch(out_regs))
    }

    /// Handles FFA_RUN, which resumes a partition execution context on the current core.
    pub(super) fn run(&self, caller: Caller, target_info: TargetInfo) -> Result<Outcome, FfaError> {
        if caller != Caller::NormalWorld {
            return Err(FfaError::InvalidParameters);
        }
        let TargetInfo {
            endpoint_id: id,
            vcpu_id: vcpu,
        } = target_info;
        if !is_secure_id(id) {
            return Err(FfaError::InvalidParameters);
        }
        let index = self.find_partition(id).ok_or(FfaError::InvalidParameters)?;
        let partition = &self.partitions[index];
        if vcpu != partition.contexts.current_index() {
            warn!("FFA_RUN of {id:#x} vCPU {vcpu} on the wrong core");
            return Err(FfaError::InvalidParameters);
        }
        if partition.has_failed() {
            debug!("FFA_RUN of failed partition {id:#x}");
            return Err(FfaError::Denied);
        }

        let out_regs = match self.with_context(index, ExecutionContext::run)? {
            RuntimeState::Waiting => Interface::Run {
                target_info,
                is_32bit: true,
            }
            .into(),
            RuntimeState::Preempted => SmcReturn::EMPTY,
            RuntimeState::Blocked => success(),
            RuntimeState::Running => return Err(FfaError::Busy),
        };
        self.set_current_partition(Some(index));
        Ok(Outcome::Switch(out_regs))
    }

    /// Hands a secure interrupt taken in the normal world to the first S-EL1 partition.
    ///
    /// Returns the registers to enter the secure world with.
    ///
    /// # Panics
    ///
    /// Panics if there is no S-EL1 partition, or its execution context on this core is not
    /// waiting.
    pub fn handle_secure_interrupt(&self) -> SmcReturn {
        let Some(index) = self.partitions.iter().position(|partition| {
            partition.runtime_el == RuntimeEl::SEl1 && !partition.has_failed()
        }) else {
            panic!("No S-EL1 partition to handle a secure interrupt");
        };

        self.with_context(index, ExecutionContext::begin_interrupt);
        self.set_current_partition(Some(index));
        Interface::Interrupt {
            target_info: TargetInfo::default(),
            interrupt_id: 0,
            is_32bit: true,
        }
        .into()
    }

    /// Preempts the partition running on this core for a non-secure interrupt.
    ///
    /// Returns the registers to enter the normal world with.
    ///
    /// # Panics
    ///
    /// Panics if no partition is scheduled on this core.
    pub fn handle_non_secure_interrupt(&self) -> SmcReturn {
        let Some(index) = self.set_current_partition(None) else {
            panic!("Non-secure interrupt taken with no partition scheduled");
        };
        let partition = &self.partitions[index];

        self.with_context(index, ExecutionContext::preempt);
        Interface::Interrupt {
            target_info: TargetInfo {
                endpoint_id: partition.id,
                vcpu_id: partition.contexts.current_index(),
            },
            interrupt_id: 0,
            is_32bit: true,
        }
        .into()
    }
}
