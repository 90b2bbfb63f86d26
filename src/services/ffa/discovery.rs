// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! FFA_VERSION, FFA_FEATURES and FFA_PARTITION_INFO_GET.

use super::{
    Caller, MAX_ENDPOINTS, Outcome, Spmc,
    abi::{SPMC_VERSION, VERSION_1_0, success, success_with},
    mailbox::RxState,
    partition::PartitionProperties,
};
use crate::{
    platform::{Platform, PlatformImpl},
    smccc::SmcReturn,
};
use arm_ffa::{
    FfaError, FuncId, Interface, Version, VersionOut,
    interface_args::{Feature, SuccessArgsFeatures},
    partition_info::{PartitionIdType, PartitionInfo, SuccessArgsPartitionInfoGet},
};
use arrayvec::ArrayVec;
use core::sync::atomic::Ordering;
use log::{debug, warn};
use uuid::Uuid;

/// Input and interface property of FFA_MEM_RETRIEVE_REQ in FFA_FEATURES: the NS bit is used in
/// memory attributes.
const FEATURES_RETRIEVE_NS_BIT: u32 = 1 << 1;

/// Size of an FF-A v1.0 partition information descriptor, which has no UUID.
const PARTITION_INFO_V1_0_SIZE: usize = 8;

/// Functions which both worlds may call.
const COMMON_FUNCTIONS: &[FuncId] = &[
    FuncId::Error32,
    FuncId::Success32,
    FuncId::Success64,
    FuncId::Interrupt32,
    FuncId::SpmIdGet,
    FuncId::IdGet,
    FuncId::Features,
    FuncId::Version,
    FuncId::RxRelease,
    FuncId::MsgSendDirectReq32,
    FuncId::MsgSendDirectReq64,
    FuncId::PartitionInfoGet,
    FuncId::RxTxMap32,
    FuncId::RxTxMap64,
    FuncId::RxTxUnmap,
    FuncId::MemFragTx,
    FuncId::MemFragRx,
    FuncId::Run32,
];

/// Functions only secure partitions may call.
const SECURE_FUNCTIONS: &[FuncId] = &[
    FuncId::SecondaryEpRegister32,
    FuncId::SecondaryEpRegister64,
    FuncId::MsgSendDirectResp32,
    FuncId::MsgSendDirectResp64,
    FuncId::MemRelinquish,
    FuncId::MsgWait32,
    FuncId::Yield32,
    FuncId::NormalWorldResume32,
    FuncId::MemRetrieveReq32,
    FuncId::MemRetrieveReq64,
    FuncId::MemPermGet32,
    FuncId::MemPermGet64,
    FuncId::MemPermSet32,
    FuncId::MemPermSet64,
];

/// Functions only the normal world may call.
const NON_SECURE_FUNCTIONS: &[FuncId] = &[
    FuncId::MemShare32,
    FuncId::MemShare64,
    FuncId::MemLend32,
    FuncId::MemLend64,
    FuncId::MemReclaim,
];

/// Returns whether FFA_FEATURES reports `func` as implemented for `caller`.
fn is_supported(func: FuncId, caller: Caller) -> bool {
    COMMON_FUNCTIONS.contains(&func)
        || match caller {
            Caller::NormalWorld => NON_SECURE_FUNCTIONS.contains(&func),
            Caller::Partition(_) => SECURE_FUNCTIONS.contains(&func),
        }
}

impl Spmc {
    /// Handles FFA_VERSION, which returns the version in w0 rather than with FFA_SUCCESS.
    pub(super) fn version(&self, caller: Caller, input_version: Version) -> SmcReturn {
        match caller {
            Caller::Partition(index) => {
                let partition = &self.partitions[index];
                if input_version != partition.ffa_version {
                    warn!(
                        "Partition {:#x} requested version {input_version}, manifest says {}",
                        partition.id, partition.ffa_version
                    );
                    return Interface::VersionOut {
                        output_version: VersionOut::NotSupported,
                    }
                    .into();
                }
            }
            Caller::NormalWorld => {
                if input_version.0 == SPMC_VERSION.0 {
                    let negotiated = input_version.min(SPMC_VERSION);
                    debug!("Normal world uses FF-A {negotiated}");
                    *self.normal_world.version.lock() = negotiated;
                }
            }
        }

        Interface::VersionOut {
            output_version: VersionOut::Version(SPMC_VERSION),
        }
        .into()
    }

    /// Handles FFA_FEATURES.
    pub(super) fn features(
        &self,
        caller: Caller,
        feat_id: Feature,
        input_properties: u32,
    ) -> Result<Outcome, FfaError> {
        // Feature IDs, such as the notification interrupts, aren't implemented.
        let Feature::FuncId(func) = feat_id else {
            return Err(FfaError::NotSupported);
        };

        match func {
            FuncId::MemRetrieveReq32 | FuncId::MemRetrieveReq64 => {
                self.retrieve_features(caller, input_properties)
            }
            _ if input_properties != 0 || !is_supported(func, caller) => {
                Err(FfaError::NotSupported)
            }
            _ => Ok(Outcome::Return(success())),
        }
    }

    fn retrieve_features(
        &self,
        caller: Caller,
        input_properties: u32,
    ) -> Result<Outcome, FfaError> {
        let ns_bit = input_properties & FEATURES_RETRIEVE_NS_BIT != 0;
        match caller {
            Caller::NormalWorld if ns_bit => Err(FfaError::NotSupported),
            Caller::NormalWorld => Ok(Outcome::Return(success())),
            Caller::Partition(index) => {
                let partition = &self.partitions[index];
                if partition.ffa_version > VERSION_1_0 {
                    if !ns_bit {
                        return Err(FfaError::NotSupported);
                    }
                } else {
                    partition.ns_bit_requested.store(ns_bit, Ordering::Relaxed);
                    if !ns_bit {
                        return Ok(Outcome::Return(success()));
                    }
                }
                Ok(Outcome::Return(success_with(SuccessArgsFeatures {
                    properties: [FEATURES_RETRIEVE_NS_BIT, 0],
                })))
            }
        }
    }

    /// Handles FFA_PARTITION_INFO_GET.
    pub(super) fn partition_info_get(
        &self,
        caller: Caller,
        uuid: Uuid,
        count_only: bool,
    ) -> Result<Outcome, FfaError> {
        let records = self.collect_partition_info(uuid);
        if records.is_empty() {
            debug!("No partition matches {uuid}");
            return Err(FfaError::InvalidParameters);
        }
        let count = records.len() as u32;
        if count_only {
            return Ok(Outcome::Return(success_with(SuccessArgsPartitionInfoGet {
                count,
                size: None,
            })));
        }

        let mut packed = [0; MAX_ENDPOINTS * PartitionInfo::DESC_SIZE];
        PartitionInfo::pack(SPMC_VERSION, &records, &mut packed, uuid.is_nil());
        let record_size = if self.caller_version(caller) == VERSION_1_0 {
            PARTITION_INFO_V1_0_SIZE
        } else {
            PartitionInfo::DESC_SIZE
        };

        let mut mailbox = self.caller_mailbox(caller).lock();
        let buffer_size = mailbox.buffers().map_err(|_| FfaError::Busy)?.size();
        if mailbox.rx_state() == RxState::Full {
            return Err(FfaError::Busy);
        }
        if records.len() * record_size > buffer_size {
            warn!("{count} partition info records don't fit in {buffer_size:#x} bytes");
            return Err(FfaError::NoMemory);
        }

        let rx = mailbox.acquire_rx(FfaError::Busy)?;
        rx.fill(0);
        for (chunk, record) in rx
            .chunks_exact_mut(record_size)
            .zip(packed.chunks_exact(PartitionInfo::DESC_SIZE).take(records.len()))
        {
            chunk.copy_from_slice(&record[..record_size]);
        }

        Ok(Outcome::Return(success_with(SuccessArgsPartitionInfoGet {
            count,
            size: Some(record_size as u32),
        })))
    }

    /// Returns the partitions matching `uuid`, or all of them for the nil UUID. Logical
    /// partitions come first, and secure partitions which failed to boot are left out.
    fn collect_partition_info(&self, uuid: Uuid) -> ArrayVec<PartitionInfo, MAX_ENDPOINTS> {
        let logical = self.logical_partitions.iter().map(|partition| PartitionInfo {
            uuid: partition.uuid(),
            partition_id: partition.id(),
            partition_id_type: PartitionIdType::PeEndpoint {
                execution_ctx_count: PlatformImpl::CORE_COUNT as u16,
            },
            props: (partition.properties() | PartitionProperties::AARCH64).into(),
        });
        let secure = self
            .partitions
            .iter()
            .filter(|partition| !partition.has_failed())
            .map(|partition| PartitionInfo {
                uuid: partition.uuid,
                partition_id: partition.id,
                partition_id_type: PartitionIdType::PeEndpoint {
                    execution_ctx_count: partition.contexts.count(),
                },
                props: partition.properties.into(),
            });

        logical
            .chain(secure)
            .filter(|info| uuid.is_nil() || info.uuid == uuid)
            .collect()
    }
}
