// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Memory sharing calls and memory permission management.
//!
//! The store lock is always taken before any mailbox lock.

use super::{
    Caller, Outcome, Spmc,
    abi::{VERSION_1_0, success, success_with},
    descriptor::{
        MemTransaction, RelinquishRequest, RetrieveRequest, TransactionType,
        check_declared_counts, is_non_secure,
    },
    mailbox::RxState,
    mem_perm::MemPermissions,
    partition::{RuntimeEl, SecurePartition},
    runtime::RuntimeModel,
    shmem::{FillStatus, ShmemStore},
};
use crate::platform::{Platform, PlatformImpl};
use arm_ffa::{
    FfaError, Interface,
    interface_args::MemOpBuf,
    memory_management::{
        Handle, MemPermissionsGetSet, MemReclaimFlags, MemRegionSecurity, SuccessArgsMemOp,
        SuccessArgsMemPermGet,
    },
};
use core::sync::atomic::Ordering;
use log::{debug, warn};

impl Spmc {
    /// Handles FFA_MEM_SHARE and FFA_MEM_LEND from the normal world.
    pub(super) fn mem_send(
        &self,
        transaction_type: TransactionType,
        caller: Caller,
        total_length: u32,
        fragment_length: u32,
        buffer: Option<MemOpBuf>,
    ) -> Result<Outcome, FfaError> {
        if caller != Caller::NormalWorld {
            warn!("Memory can only be shared or lent by the normal world");
            return Err(FfaError::InvalidParameters);
        }
        if buffer.is_some() {
            warn!("Descriptors outside the TX buffer are not supported");
            return Err(FfaError::InvalidParameters);
        }
        if total_length == 0 || fragment_length > total_length {
            return Err(FfaError::InvalidParameters);
        }
        let version = *self.normal_world.version.lock();

        let mut store = self.shmem.lock();
        let mailbox = self.normal_world.mailbox.lock();
        let fragment = mailbox.tx(fragment_length as usize)?;
        check_declared_counts(fragment, version)?;

        let handle = store.allocate(total_length as usize, transaction_type, version)?;
        let status = store.append_fragment(handle, fragment, |id| {
            self.find_partition(id).is_some()
        })?;
        drop(mailbox);
        self.finish_fragment(&mut store, handle, status)
    }

    /// Handles FFA_MEM_FRAG_TX, the continuation of a fragmented share or lend.
    pub(super) fn mem_frag_tx(
        &self,
        caller: Caller,
        handle: Handle,
        fragment_length: u32,
        sender_id: u16,
    ) -> Result<Outcome, FfaError> {
        if caller != Caller::NormalWorld {
            return Err(FfaError::InvalidParameters);
        }

        let mut store = self.shmem.lock();
        let info = store.lookup(handle).ok_or(FfaError::InvalidParameters)?;
        if sender_id != info.sender_id {
            warn!("FFA_MEM_FRAG_TX sender {sender_id:#x} doesn't match {handle:?}");
            return Err(FfaError::InvalidParameters);
        }

        let mailbox = self.normal_world.mailbox.lock();
        let fragment = mailbox.tx(fragment_length as usize)?;
        let status = store.append_fragment(handle, fragment, |id| {
            self.find_partition(id).is_some()
        })?;
        drop(mailbox);
        self.finish_fragment(&mut store, handle, status)
    }

    /// Asks for the next fragment, or hands a complete transaction to the platform.
    fn finish_fragment(
        &self,
        store: &mut ShmemStore,
        handle: Handle,
        status: FillStatus,
    ) -> Result<Outcome, FfaError> {
        let info = store.lookup(handle).ok_or(FfaError::InvalidParameters)?;
        match status {
            FillStatus::MoreFragmentsNeeded { filled } => Ok(Outcome::Return(
                Interface::MemFragRx {
                    handle,
                    frag_offset: filled as u32,
                    endpoint_id: info.sender_id,
                }
                .into(),
            )),
            FillStatus::Complete => {
                let transaction = store.transaction(handle)?;
                if let Err(error) = PlatformImpl::shmem_begin(&transaction, info.transaction_type)
                {
                    warn!("Platform rejected {handle:?}: {error:?}");
                    store.free(handle)?;
                    return Err(error);
                }
                Ok(Outcome::Return(success_with(SuccessArgsMemOp { handle })))
            }
        }
    }

    /// Handles FFA_MEM_RETRIEVE_REQ from a receiver.
    ///
    /// The response is written to the caller's RX buffer in its own descriptor layout. If it
    /// doesn't fit, the rest is fetched with FFA_MEM_FRAG_RX.
    pub(super) fn mem_retrieve_req(
        &self,
        caller: Caller,
        total_length: u32,
        fragment_length: u32,
        buffer: Option<MemOpBuf>,
    ) -> Result<Outcome, FfaError> {
        let Caller::Partition(index) = caller else {
            warn!("Retrieve requests from the normal world are not supported");
            return Err(FfaError::InvalidParameters);
        };
        let partition = &self.partitions[index];
        if buffer.is_some() {
            return Err(FfaError::InvalidParameters);
        }

        let mut store = self.shmem.lock();
        let mut mailbox = partition.mailbox.lock();
        mailbox.buffers()?;
        if mailbox.rx_state() == RxState::Full {
            warn!("RX buffer of {:#x} is full", partition.id);
            return Err(FfaError::Denied);
        }
        if fragment_length != total_length {
            warn!("Fragmented retrieve requests are not supported");
            return Err(FfaError::InvalidParameters);
        }
        let request = RetrieveRequest::parse(
            mailbox.tx(total_length as usize)?,
            partition.ffa_version,
        )?;
        let handle = request.desc.handle;

        let info = store.lookup(handle).ok_or(FfaError::InvalidParameters)?;
        if !info.is_complete() {
            warn!("{handle:?} is still being transmitted");
            return Err(FfaError::InvalidParameters);
        }
        let transaction = retrieve_response(&store, handle, partition)?;
        if request.desc.sender_id != transaction.desc.sender_id
            || request.desc.tag != transaction.desc.tag
            || request.receivers.len() != transaction.receivers.len()
        {
            warn!("Retrieve request doesn't match {handle:?}");
            return Err(FfaError::InvalidParameters);
        }
        if is_non_secure(&request.desc) {
            warn!("NS bit set in retrieve request");
            return Err(FfaError::InvalidParameters);
        }
        if !info.transaction_type.accepts(request.desc.flags) {
            warn!("Invalid retrieve flags {:#x}", request.desc.flags.0);
            return Err(FfaError::InvalidParameters);
        }
        if transaction.receiver(partition.id).is_none()
            || request
                .receivers
                .iter()
                .any(|receiver| transaction.receiver(receiver.endpoint_id).is_none())
        {
            warn!("Partition {:#x} is not a receiver of {handle:?}", partition.id);
            return Err(FfaError::InvalidParameters);
        }

        store.acquire(handle)?;
        let rx = mailbox.acquire_rx(FfaError::Denied)?;
        let copied = transaction.write_window(partition.ffa_version, 0, rx);
        let total = transaction.serialized_size(partition.ffa_version);
        debug!(
            "Partition {:#x} retrieved {handle:?}: {copied:#x} of {total:#x} bytes",
            partition.id
        );

        Ok(Outcome::Return(
            Interface::MemRetrieveResp {
                total_len: total as u32,
                frag_len: copied as u32,
            }
            .into(),
        ))
    }

    /// Handles FFA_MEM_FRAG_RX, which fetches the retrieve response from `offset` onwards.
    pub(super) fn mem_frag_rx(
        &self,
        caller: Caller,
        handle: Handle,
        offset: u32,
        sender_id: u16,
    ) -> Result<Outcome, FfaError> {
        let Caller::Partition(index) = caller else {
            return Err(FfaError::InvalidParameters);
        };
        let partition = &self.partitions[index];

        let store = self.shmem.lock();
        let info = store.lookup(handle).ok_or(FfaError::InvalidParameters)?;
        if sender_id != 0 && sender_id != info.sender_id {
            return Err(FfaError::InvalidParameters);
        }
        let transaction = retrieve_response(&store, handle, partition)?;
        if transaction.receiver(partition.id).is_none() {
            return Err(FfaError::InvalidParameters);
        }
        let offset = offset as usize;
        if offset >= transaction.serialized_size(partition.ffa_version) {
            warn!("Fragment offset {offset:#x} past the end of {handle:?}");
            return Err(FfaError::InvalidParameters);
        }

        let mut mailbox = partition.mailbox.lock();
        mailbox.buffers()?;
        let rx = mailbox.acquire_rx(FfaError::Denied)?;
        let copied = transaction.write_window(partition.ffa_version, offset, rx);

        Ok(Outcome::Return(
            Interface::MemFragTx {
                handle,
                frag_len: copied as u32,
                endpoint_id: sender_id,
            }
            .into(),
        ))
    }

    /// Handles FFA_MEM_RELINQUISH, which undoes one retrieve by the caller.
    pub(super) fn mem_relinquish(&self, caller: Caller) -> Result<Outcome, FfaError> {
        let Caller::Partition(index) = caller else {
            return Err(FfaError::InvalidParameters);
        };
        let partition = &self.partitions[index];

        let mut store = self.shmem.lock();
        let mailbox = partition.mailbox.lock();
        let request = RelinquishRequest::parse(mailbox.tx(mailbox.buffers()?.size())?)?;
        if request.desc.flags != 0 || request.endpoints.as_slice() != [partition.id] {
            warn!("Invalid relinquish request {request:?}");
            return Err(FfaError::InvalidParameters);
        }
        let handle = request.desc.handle;
        let transaction = store.transaction(handle)?;
        if transaction.receiver(partition.id).is_none() {
            return Err(FfaError::InvalidParameters);
        }
        let in_use = store.release(handle)?;
        debug!(
            "Partition {:#x} relinquished {handle:?}, {in_use} retrieves left",
            partition.id
        );
        Ok(Outcome::Return(success()))
    }

    /// Handles FFA_MEM_RECLAIM, which ends a transaction once no receiver holds it.
    pub(super) fn mem_reclaim(
        &self,
        caller: Caller,
        handle: Handle,
        flags: MemReclaimFlags,
    ) -> Result<Outcome, FfaError> {
        if caller != Caller::NormalWorld {
            return Err(FfaError::InvalidParameters);
        }
        if flags != MemReclaimFlags::default() {
            warn!("Unsupported reclaim flags {flags:?}");
            return Err(FfaError::InvalidParameters);
        }

        let mut store = self.shmem.lock();
        let info = store.lookup(handle).ok_or(FfaError::InvalidParameters)?;
        if info.in_use != 0 {
            warn!("{handle:?} is still retrieved {} times", info.in_use);
            return Err(FfaError::Denied);
        }
        let transaction = store.transaction(handle)?;
        PlatformImpl::shmem_reclaim(&transaction)?;
        store.free(handle)?;
        Ok(Outcome::Return(success()))
    }

    /// Handles FFA_MEM_PERM_GET.
    pub(super) fn mem_perm_get(
        &self,
        caller: Caller,
        address: u64,
        page_count: u32,
    ) -> Result<Outcome, FfaError> {
        let partition = self.sel0_partition(caller)?;
        if page_count != 1 {
            return Err(FfaError::InvalidParameters);
        }
        let permissions = partition.memory_regions.lock().permissions(address)?;
        Ok(Outcome::Return(success_with(SuccessArgsMemPermGet {
            perm: permissions.into(),
            page_cnt: 1,
        })))
    }

    /// Handles FFA_MEM_PERM_SET, which is only allowed during initialisation.
    pub(super) fn mem_perm_set(
        &self,
        caller: Caller,
        base_address: u64,
        page_count: u32,
        permissions: MemPermissionsGetSet,
    ) -> Result<Outcome, FfaError> {
        let partition = self.sel0_partition(caller)?;
        if partition.contexts.with_current(|context| context.model()) != RuntimeModel::Init {
            warn!(
                "Partition {:#x} changed memory permissions after initialisation",
                partition.id
            );
            return Err(FfaError::Denied);
        }
        let permissions = MemPermissions::try_from(permissions)?;

        partition.memory_regions.lock().set_permissions(
            base_address,
            page_count,
            permissions,
            || PlatformImpl::update_mem_perm(partition.id, base_address, page_count, permissions),
        )?;
        Ok(Outcome::Return(success()))
    }

    fn sel0_partition(&self, caller: Caller) -> Result<&SecurePartition, FfaError> {
        match caller {
            Caller::Partition(index) if self.partitions[index].runtime_el == RuntimeEl::SEl0 => {
                Ok(&self.partitions[index])
            }
            _ => Err(FfaError::Denied),
        }
    }
}

/// Returns the complete transaction as it is presented to `partition`.
///
/// The NS bit is set in the memory attributes unless the receiver implements v1.0 and hasn't
/// asked for it.
fn retrieve_response(
    store: &ShmemStore,
    handle: Handle,
    partition: &SecurePartition,
) -> Result<MemTransaction, FfaError> {
    let mut transaction = store.transaction(handle)?;
    if partition.ffa_version > VERSION_1_0 || partition.ns_bit_requested.load(Ordering::Relaxed) {
        transaction.desc.mem_region_attr.security = MemRegionSecurity::NonSecure;
    }
    Ok(transaction)
}

#[cfg(test)]
mod tests {
    use super::{
        super::{
            abi::SPMC_VERSION,
            descriptor::{
                PAGE_SIZE,
                testing::{encode, patch_u32, relinquish, retrieve_request, transaction},
            },
            mem_perm::MemoryRegion,
            partition::PartitionManifest,
        },
        *,
    };
    use crate::platform::test::{
        REJECTED_TAG, TX_BASE, mem_perm_updates, set_current_core, sp_manifest,
    };
    use arm_ffa::{
        FuncId, Version,
        interface_args::MemAddr,
        memory_management::{
            DataAccessPermGetSet, InstructionAccessPermGetSet, MemTransactionFlags,
        },
    };

    const FIRST_HANDLE: Handle = Handle(0xffff_ffc0);
    const HEADER_SIZE: usize = 48;

    fn setup(manifests: &[PartitionManifest]) -> Spmc {
        set_current_core(0);
        let spmc = Spmc::with_partitions(manifests);
        spmc.normal_world
            .mailbox
            .map(TX_BASE, TX_BASE + PAGE_SIZE as u64, 1)
            .unwrap();
        for (index, partition) in spmc.partitions.iter().enumerate() {
            let base = TX_BASE + 0x10_0000 * (index as u64 + 1);
            partition
                .mailbox
                .map(base, base + PAGE_SIZE as u64, 1)
                .unwrap();
        }
        spmc
    }

    /// Sends `bytes` from the normal world as the first fragment of a share.
    fn share_bytes(spmc: &Spmc, bytes: &[u8], total_len: usize) -> Outcome {
        spmc.normal_world.mailbox.write_tx(bytes);
        spmc.send(
            Caller::NormalWorld,
            Interface::MemShare {
                total_len: total_len as u32,
                frag_len: bytes.len() as u32,
                buf: None,
            },
        )
    }

    /// Shares `transaction` from the normal world in a single fragment.
    fn share(spmc: &Spmc, transaction: &MemTransaction) -> Outcome {
        let bytes = encode(transaction, SPMC_VERSION);
        share_bytes(spmc, &bytes, bytes.len())
    }

    /// Sends a retrieve request on behalf of partition `index`.
    fn retrieve(
        spmc: &Spmc,
        index: usize,
        transaction: &MemTransaction,
        handle: Handle,
        version: Version,
    ) -> Outcome {
        let bytes = retrieve_request(transaction, handle, version);
        spmc.partitions[index].mailbox.write_tx(&bytes);
        spmc.send(
            Caller::Partition(index),
            Interface::MemRetrieveReq {
                total_len: bytes.len() as u32,
                frag_len: bytes.len() as u32,
                buf: None,
            },
        )
    }

    fn retrieved(size: usize) -> Outcome {
        Outcome::Return(
            Interface::MemRetrieveResp {
                total_len: size as u32,
                frag_len: size as u32,
            }
            .into(),
        )
    }

    fn handle_returned(handle: Handle) -> Outcome {
        Outcome::Return(success_with(SuccessArgsMemOp { handle }))
    }

    fn error(error: FfaError) -> Outcome {
        Outcome::Return(error.into())
    }

    #[test]
    fn share_retrieve_relinquish_reclaim() {
        let spmc = setup(&[sp_manifest(None)]);
        let shared = transaction(0, &[0x8001], &[(0x8800_0000, 2)]);
        assert_eq!(share(&spmc, &shared), handle_returned(FIRST_HANDLE));

        let size = shared.serialized_size(SPMC_VERSION);
        assert_eq!(
            retrieve(&spmc, 0, &shared, FIRST_HANDLE, SPMC_VERSION),
            retrieved(size)
        );
        let response =
            MemTransaction::parse(&spmc.partitions[0].mailbox.read_rx(size), SPMC_VERSION)
                .unwrap();
        assert_eq!(response.desc.handle, FIRST_HANDLE);
        assert_eq!(response.desc.flags, MemTransactionFlags(MemTransactionFlags::TYPE_SHARE));
        assert!(is_non_secure(&response.desc));
        assert_eq!(
            response.desc.mem_region_attr.mem_type,
            shared.desc.mem_region_attr.mem_type
        );
        assert_eq!(response.ranges, shared.ranges);

        let reclaim = Interface::MemReclaim {
            handle: FIRST_HANDLE,
            flags: MemReclaimFlags::default(),
        };
        assert_eq!(
            spmc.send(Caller::NormalWorld, reclaim),
            error(FfaError::Denied)
        );

        spmc.partitions[0]
            .mailbox
            .write_tx(&relinquish(FIRST_HANDLE, 0, &[0x8001]));
        assert_eq!(
            spmc.send(Caller::Partition(0), Interface::MemRelinquish),
            Outcome::Return(success())
        );
        assert_eq!(
            spmc.send(Caller::Partition(0), Interface::MemRelinquish),
            error(FfaError::InvalidParameters)
        );

        assert_eq!(
            spmc.send(Caller::NormalWorld, reclaim),
            Outcome::Return(success())
        );
        assert!(spmc.shmem.lock().is_empty());
        assert_eq!(
            spmc.send(Caller::NormalWorld, reclaim),
            error(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn reclaim_flags_rejected() {
        let spmc = setup(&[sp_manifest(None)]);
        share(&spmc, &transaction(0, &[0x8001], &[(0x8800_0000, 1)]));
        assert_eq!(
            spmc.send(
                Caller::NormalWorld,
                Interface::MemReclaim {
                    handle: FIRST_HANDLE,
                    flags: MemReclaimFlags {
                        zero_memory: true,
                        time_slicing: false,
                    },
                }
            ),
            error(FfaError::InvalidParameters)
        );
        assert_eq!(spmc.shmem.lock().len(), 1);
    }

    #[test]
    fn fragmented_share() {
        let spmc = setup(&[sp_manifest(None)]);
        let shared = transaction(0, &[0x8001], &[(0x8800_0000, 1), (0x8900_0000, 3)]);
        let bytes = encode(&shared, SPMC_VERSION);
        let total = bytes.len() as u32;

        spmc.normal_world.mailbox.write_tx(&bytes[..HEADER_SIZE]);
        assert_eq!(
            spmc.send(
                Caller::NormalWorld,
                Interface::MemLend {
                    total_len: total,
                    frag_len: HEADER_SIZE as u32,
                    buf: None,
                }
            ),
            Outcome::Return(
                Interface::MemFragRx {
                    handle: FIRST_HANDLE,
                    frag_offset: HEADER_SIZE as u32,
                    endpoint_id: 0,
                }
                .into()
            )
        );

        let rest = &bytes[HEADER_SIZE..];
        spmc.normal_world.mailbox.write_tx(rest);
        let frag_tx = |endpoint_id: u16| {
            spmc.send(
                Caller::NormalWorld,
                Interface::MemFragTx {
                    handle: FIRST_HANDLE,
                    frag_len: rest.len() as u32,
                    endpoint_id,
                },
            )
        };
        assert_eq!(frag_tx(1), error(FfaError::InvalidParameters));
        assert_eq!(frag_tx(0), handle_returned(FIRST_HANDLE));
        assert_eq!(frag_tx(0), error(FfaError::InvalidParameters));

        let stored = spmc.shmem.lock().transaction(FIRST_HANDLE).unwrap();
        assert_eq!(stored.desc.flags, MemTransactionFlags(MemTransactionFlags::TYPE_LEND));
        assert_eq!(stored.ranges, shared.ranges);
    }

    #[test]
    fn invalid_share_arguments() {
        let spmc = setup(&[sp_manifest(None)]);
        let bytes = encode(&transaction(0, &[0x8001], &[(0x8800_0000, 1)]), SPMC_VERSION);
        spmc.normal_world.mailbox.write_tx(&bytes);
        let length = bytes.len() as u64;

        for regs in [
            [FuncId::MemShare32 as u64, length, length, 0x1000, 1],
            [FuncId::MemShare32 as u64, length, length + 1, 0, 0],
            [FuncId::MemShare32 as u64, 0, 0, 0, 0],
            [
                FuncId::MemShare32 as u64,
                2 * PAGE_SIZE as u64,
                PAGE_SIZE as u64 + 1,
                0,
                0,
            ],
        ] {
            assert_eq!(
                spmc.call(Caller::NormalWorld, &regs),
                error(FfaError::InvalidParameters)
            );
        }
        assert_eq!(
            spmc.call(
                Caller::Partition(0),
                &[FuncId::MemShare32 as u64, length, length]
            ),
            error(FfaError::InvalidParameters)
        );
        assert!(spmc.shmem.lock().is_empty());
    }

    #[test]
    fn declared_counts_checked_before_allocation() {
        let spmc = setup(&[sp_manifest(None)]);
        let shared = transaction(0, &[0x8001], &[(0x8800_0000, 1)]);

        // Receiver count of the header.
        let mut too_many_receivers = encode(&shared, SPMC_VERSION)[..HEADER_SIZE].to_vec();
        patch_u32(&mut too_many_receivers, 28, 9);
        assert_eq!(
            share_bytes(&spmc, &too_many_receivers, 0x400),
            error(FfaError::NoMemory)
        );
        assert!(spmc.shmem.lock().is_empty());

        let mut too_many_ranges = encode(&shared, SPMC_VERSION);
        let composite = HEADER_SIZE + 16;
        patch_u32(&mut too_many_ranges, composite + 4, 65);
        assert_eq!(
            share_bytes(&spmc, &too_many_ranges[..composite + 16], 0x800),
            error(FfaError::NoMemory)
        );
        assert!(spmc.shmem.lock().is_empty());

        // No handle was consumed by the rejected shares.
        assert_eq!(share(&spmc, &shared), handle_returned(FIRST_HANDLE));
    }

    #[test]
    fn overlapping_share_rejected() {
        let spmc = setup(&[sp_manifest(None)]);
        assert_eq!(
            share(&spmc, &transaction(0, &[0x8001], &[(0x8800_0000, 4)])),
            handle_returned(FIRST_HANDLE)
        );
        assert_eq!(
            share(&spmc, &transaction(0, &[0x8001], &[(0x8800_3000, 1)])),
            error(FfaError::InvalidParameters)
        );
        assert_eq!(
            share(&spmc, &transaction(0, &[0x8001], &[(0x8800_4000, 1)])),
            handle_returned(Handle(FIRST_HANDLE.0 + 2))
        );
        assert_eq!(spmc.shmem.lock().len(), 2);
    }

    #[test]
    fn platform_can_reject_share() {
        let spmc = setup(&[sp_manifest(None)]);
        let mut shared = transaction(0, &[0x8001], &[(0x8800_0000, 1)]);
        shared.desc.tag = REJECTED_TAG;
        assert_eq!(share(&spmc, &shared), error(FfaError::Denied));
        assert!(spmc.shmem.lock().is_empty());
    }

    #[test]
    fn invalid_retrieve_requests() {
        let spmc = setup(&[sp_manifest(None), sp_manifest(None)]);
        let shared = transaction(0, &[0x8001], &[(0x8800_0000, 1)]);
        assert_eq!(share(&spmc, &shared), handle_returned(FIRST_HANDLE));

        // Unknown handle.
        assert_eq!(
            retrieve(&spmc, 0, &shared, Handle(1), SPMC_VERSION),
            error(FfaError::InvalidParameters)
        );
        // Not a receiver.
        assert_eq!(
            retrieve(&spmc, 1, &shared, FIRST_HANDLE, SPMC_VERSION),
            error(FfaError::InvalidParameters)
        );

        // Wrong tag, NS bit, wrong type, wrong receiver count.
        let mut wrong_tag = shared.clone();
        wrong_tag.desc.tag = 1;
        let mut ns_bit = shared.clone();
        ns_bit.desc.mem_region_attr.security = MemRegionSecurity::NonSecure;
        let mut lend = shared.clone();
        lend.desc.flags = MemTransactionFlags(MemTransactionFlags::TYPE_LEND);
        let extra_receiver = transaction(0, &[0x8001, 0x8002], &[(0x8800_0000, 1)]);
        for request in [wrong_tag, ns_bit, lend, extra_receiver] {
            assert_eq!(
                retrieve(&spmc, 0, &request, FIRST_HANDLE, SPMC_VERSION),
                error(FfaError::InvalidParameters)
            );
        }

        // Fragmented request.
        let bytes = retrieve_request(&shared, FIRST_HANDLE, SPMC_VERSION);
        spmc.partitions[0].mailbox.write_tx(&bytes);
        assert_eq!(
            spmc.send(
                Caller::Partition(0),
                Interface::MemRetrieveReq {
                    total_len: bytes.len() as u32,
                    frag_len: HEADER_SIZE as u32,
                    buf: None,
                }
            ),
            error(FfaError::InvalidParameters)
        );

        // The explicit type flag is accepted.
        let mut share_flag = shared.clone();
        share_flag.desc.flags = MemTransactionFlags(MemTransactionFlags::TYPE_SHARE);
        assert_eq!(
            retrieve(&spmc, 0, &share_flag, FIRST_HANDLE, SPMC_VERSION),
            retrieved(shared.serialized_size(SPMC_VERSION))
        );

        // The RX buffer is still owned by the partition.
        assert_eq!(
            retrieve(&spmc, 0, &shared, FIRST_HANDLE, SPMC_VERSION),
            error(FfaError::Denied)
        );
        assert_eq!(spmc.shmem.lock().lookup(FIRST_HANDLE).unwrap().in_use, 1);
    }

    #[test]
    fn retrieve_from_normal_world_rejected() {
        let spmc = setup(&[sp_manifest(None)]);
        assert_eq!(
            spmc.send(
                Caller::NormalWorld,
                Interface::MemRetrieveReq {
                    total_len: 48,
                    frag_len: 48,
                    buf: None,
                }
            ),
            error(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn frag_rx_continues_response() {
        let spmc = setup(&[sp_manifest(None)]);
        let shared = transaction(0, &[0x8001], &[(0x8800_0000, 1), (0x8a00_0000, 2)]);
        share(&spmc, &shared);
        retrieve(&spmc, 0, &shared, FIRST_HANDLE, SPMC_VERSION);
        let size = shared.serialized_size(SPMC_VERSION);
        let full = spmc.partitions[0].mailbox.read_rx(size);

        let frag_rx = |frag_offset: u32, endpoint_id: u16| {
            spmc.send(
                Caller::Partition(0),
                Interface::MemFragRx {
                    handle: FIRST_HANDLE,
                    frag_offset,
                    endpoint_id,
                },
            )
        };
        assert_eq!(frag_rx(0x40, 0), error(FfaError::Denied));

        spmc.partitions[0].mailbox.release().unwrap();
        assert_eq!(
            frag_rx(0x40, 0),
            Outcome::Return(
                Interface::MemFragTx {
                    handle: FIRST_HANDLE,
                    frag_len: (size - 0x40) as u32,
                    endpoint_id: 0,
                }
                .into()
            )
        );
        assert_eq!(
            spmc.partitions[0].mailbox.read_rx(size - 0x40),
            full[0x40..]
        );

        spmc.partitions[0].mailbox.release().unwrap();
        assert_eq!(frag_rx(size as u32, 0), error(FfaError::InvalidParameters));
        assert_eq!(frag_rx(0, 5), error(FfaError::InvalidParameters));
    }

    #[test]
    fn ns_bit_for_v1_0_receivers() {
        let mut manifest = sp_manifest(None);
        manifest.ffa_version = VERSION_1_0;
        let spmc = setup(&[manifest]);
        let shared = transaction(0, &[0x8001], &[(0x8800_0000, 1)]);
        share(&spmc, &shared);
        let size = shared.serialized_size(VERSION_1_0);

        assert_eq!(
            retrieve(&spmc, 0, &shared, FIRST_HANDLE, VERSION_1_0),
            retrieved(size)
        );
        let response =
            MemTransaction::parse(&spmc.partitions[0].mailbox.read_rx(size), VERSION_1_0).unwrap();
        assert!(!is_non_secure(&response.desc));

        spmc.partitions[0].mailbox.release().unwrap();
        spmc.partitions[0]
            .ns_bit_requested
            .store(true, Ordering::Relaxed);
        retrieve(&spmc, 0, &shared, FIRST_HANDLE, VERSION_1_0);
        let response =
            MemTransaction::parse(&spmc.partitions[0].mailbox.read_rx(size), VERSION_1_0).unwrap();
        assert!(is_non_secure(&response.desc));
        assert_eq!(spmc.shmem.lock().lookup(FIRST_HANDLE).unwrap().in_use, 2);
    }

    #[test]
    fn relinquish_checks_endpoints() {
        let spmc = setup(&[sp_manifest(None), sp_manifest(None)]);
        let shared = transaction(0, &[0x8001, 0x8002], &[(0x8800_0000, 1)]);
        assert_eq!(share(&spmc, &shared), handle_returned(FIRST_HANDLE));

        // A retrieve request has to list every receiver of the transaction.
        let one_receiver = transaction(0, &[0x8001], &[(0x8800_0000, 1)]);
        assert_eq!(
            retrieve(&spmc, 0, &one_receiver, FIRST_HANDLE, SPMC_VERSION),
            error(FfaError::InvalidParameters)
        );
        assert_eq!(
            retrieve(&spmc, 0, &shared, FIRST_HANDLE, SPMC_VERSION),
            retrieved(shared.serialized_size(SPMC_VERSION))
        );
        assert_eq!(spmc.shmem.lock().lookup(FIRST_HANDLE).unwrap().in_use, 1);

        let flagged = relinquish(FIRST_HANDLE, 1, &[0x8001]);
        for bytes in [
            flagged,
            relinquish(FIRST_HANDLE, 0, &[0x8002]),
            relinquish(FIRST_HANDLE, 0, &[0x8001, 0x8002]),
            relinquish(Handle(5), 0, &[0x8001]),
        ] {
            spmc.partitions[0].mailbox.write_tx(&bytes);
            assert_eq!(
                spmc.send(Caller::Partition(0), Interface::MemRelinquish),
                error(FfaError::InvalidParameters)
            );
        }

        // Retrieves are counted per transaction rather than per receiver.
        spmc.partitions[1]
            .mailbox
            .write_tx(&relinquish(FIRST_HANDLE, 0, &[0x8002]));
        assert_eq!(
            spmc.send(Caller::Partition(1), Interface::MemRelinquish),
            Outcome::Return(success())
        );
        assert_eq!(spmc.shmem.lock().lookup(FIRST_HANDLE).unwrap().in_use, 0);
    }

    static REGIONS: [MemoryRegion; 1] = [MemoryRegion {
        base_address: 0x40_0000,
        page_count: 4,
        permissions: MemPermissions::ReadWrite,
    }];

    fn sel0_manifest() -> PartitionManifest {
        PartitionManifest {
            runtime_el: RuntimeEl::SEl0,
            memory_regions: &REGIONS,
            ..sp_manifest(None)
        }
    }

    fn perm_get(spmc: &Spmc, caller: Caller, addr: MemAddr) -> Outcome {
        spmc.send(caller, Interface::MemPermGet { addr, page_cnt: 1 })
    }

    fn perm_set(spmc: &Spmc, addr: MemAddr, mem_perm: MemPermissionsGetSet) -> Outcome {
        spmc.send(
            Caller::Partition(0),
            Interface::MemPermSet {
                addr,
                page_cnt: 1,
                mem_perm,
            },
        )
    }

    fn permissions(
        data_access: DataAccessPermGetSet,
        instr_access: InstructionAccessPermGetSet,
    ) -> MemPermissionsGetSet {
        MemPermissionsGetSet {
            data_access,
            instr_access,
        }
    }

    #[test]
    fn memory_permissions() {
        let spmc = setup(&[sel0_manifest(), sp_manifest(None)]);
        spmc.with_context(0, |context| context.begin_init());
        let read_write = permissions(
            DataAccessPermGetSet::ReadWrite,
            InstructionAccessPermGetSet::NonExecutable,
        );
        let read_only = permissions(
            DataAccessPermGetSet::ReadOnly,
            InstructionAccessPermGetSet::NonExecutable,
        );
        let reply = |perm| {
            Outcome::Return(success_with(SuccessArgsMemPermGet { perm, page_cnt: 1 }))
        };

        assert_eq!(
            perm_get(&spmc, Caller::Partition(0), MemAddr::Addr32(0x40_1000)),
            reply(read_write)
        );
        assert_eq!(
            perm_set(&spmc, MemAddr::Addr32(0x40_1000), read_only),
            Outcome::Return(success())
        );
        assert_eq!(
            mem_perm_updates(),
            [(0x8001, 0x40_1000, 1, MemPermissions::ReadOnly)]
        );
        assert_eq!(
            perm_get(&spmc, Caller::Partition(0), MemAddr::Addr64(0x40_1fff)),
            reply(read_only)
        );
        assert_eq!(
            perm_set(
                &spmc,
                MemAddr::Addr32(0x40_1000),
                permissions(
                    DataAccessPermGetSet::ReadWrite,
                    InstructionAccessPermGetSet::Executable,
                )
            ),
            error(FfaError::InvalidParameters)
        );

        // S-EL1 partitions and the normal world can't use these calls.
        for caller in [Caller::Partition(1), Caller::NormalWorld] {
            assert_eq!(
                perm_get(&spmc, caller, MemAddr::Addr32(0x40_1000)),
                error(FfaError::Denied)
            );
        }

        spmc.with_context(0, |context| {
            context.wait().unwrap();
            context.run().unwrap();
        });
        assert_eq!(
            perm_set(&spmc, MemAddr::Addr64(0x40_0000), read_only),
            error(FfaError::Denied)
        );
    }
}
