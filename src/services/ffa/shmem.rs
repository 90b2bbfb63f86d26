// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Store of in-flight memory sharing transactions.
//!
//! Descriptors are kept in a single arena, packed at the front in allocation order. Freeing an
//! object moves every later object down to close the gap, so objects are only ever referred to by
//! handle from outside the store.

use super::{
    abi::is_secure_id,
    descriptor::{MemTransaction, PAGE_SIZE, TransactionType, is_non_secure, parse_header},
};
use crate::platform::{Platform, PlatformImpl};
use arm_ffa::{
    FfaError, Version,
    memory_management::{ConstituentMemRegion, Handle, MemTransactionDesc},
};
use arrayvec::ArrayVec;
use core::ptr;
use log::{debug, warn};

/// Maximum number of objects the store can track.
pub const MAX_OBJECTS: usize = 32;

/// First handle handed out. Handles are never reused.
const HANDLE_SEED: u64 = 0xffff_ffc0;

const ARENA_SIZE: usize = PlatformImpl::SHMEM_DATASTORE_SIZE;

/// Progress of a transaction after a fragment was appended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FillStatus {
    /// More fragments are expected; `filled` bytes have been received so far.
    MoreFragmentsNeeded {
        /// Bytes of the descriptor received so far.
        filled: usize,
    },
    /// The whole descriptor was received and validated.
    Complete,
}

/// Bookkeeping for one transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ObjectInfo {
    /// The transaction's handle.
    pub handle: Handle,
    /// Total size of the descriptor in bytes.
    pub size: usize,
    /// Bytes of the descriptor received so far.
    pub filled: usize,
    /// Number of retrieves not yet matched by a relinquish.
    pub in_use: u32,
    /// Sender of the transaction, known once the first fragment has arrived.
    pub sender_id: u16,
    /// Share or lend.
    pub transaction_type: TransactionType,
    /// Layout the sender wrote the descriptor in.
    pub version: Version,
}

impl ObjectInfo {
    /// Returns whether the whole descriptor has been received and validated.
    pub fn is_complete(&self) -> bool {
        self.filled == self.size
    }
}

#[derive(Debug)]
struct Entry {
    info: ObjectInfo,
    offset: usize,
}

/// The shared memory object store.
pub struct ShmemStore {
    arena: [u8; ARENA_SIZE],
    used: usize,
    entries: ArrayVec<Entry, MAX_OBJECTS>,
    next_handle: u64,
}

impl ShmemStore {
    /// Creates an empty store.
    pub const fn new() -> Self {
        Self {
            arena: [0; ARENA_SIZE],
            used: 0,
            entries: ArrayVec::new_const(),
            next_handle: HANDLE_SEED,
        }
    }

    /// Reserves space for a descriptor of `size` bytes and mints a fresh handle for it.
    pub fn allocate(
        &mut self,
        size: usize,
        transaction_type: TransactionType,
        version: Version,
    ) -> Result<Handle, FfaError> {
        if size > ARENA_SIZE - self.used || self.entries.is_full() {
            warn!(
                "Shared memory store full: {size:#x} bytes requested, {:#x} free, {} objects",
                ARENA_SIZE - self.used,
                self.entries.len()
            );
            return Err(FfaError::NoMemory);
        }

        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(Entry {
            info: ObjectInfo {
                handle,
                size,
                filled: 0,
                in_use: 0,
                sender_id: 0,
                transaction_type,
                version,
            },
            offset: self.used,
        });
        self.used += size;
        debug!("Allocated {handle:?} of {size:#x} bytes");
        Ok(handle)
    }

    /// Returns the bookkeeping of the object with the given handle.
    pub fn lookup(&self, handle: Handle) -> Option<ObjectInfo> {
        self.index_of(handle).map(|index| self.entries[index].info)
    }

    /// Appends the next fragment of the descriptor of `handle`.
    ///
    /// A fragment that does not fit or arrives after the descriptor is complete is rejected
    /// without affecting the object. Any other failure frees the object. Receivers with secure
    /// endpoint IDs must satisfy `is_partition`.
    pub fn append_fragment(
        &mut self,
        handle: Handle,
        fragment: &[u8],
        is_partition: impl Fn(u16) -> bool,
    ) -> Result<FillStatus, FfaError> {
        let index = self.index_of(handle).ok_or(FfaError::InvalidParameters)?;
        let info = &self.entries[index].info;
        if info.is_complete() {
            warn!("{handle:?} is already complete");
            return Err(FfaError::InvalidParameters);
        }
        if fragment.len() > info.size - info.filled {
            warn!(
                "Fragment of {:#x} bytes overflows {handle:?}: {:#x} of {:#x} filled",
                fragment.len(),
                info.filled,
                info.size
            );
            return Err(FfaError::InvalidParameters);
        }

        let result = self.fill(index, fragment, is_partition);
        if result.is_err() {
            self.remove(index);
        }
        result
    }

    fn fill(
        &mut self,
        index: usize,
        fragment: &[u8],
        is_partition: impl Fn(u16) -> bool,
    ) -> Result<FillStatus, FfaError> {
        let entry = &mut self.entries[index];
        let start = entry.offset + entry.info.filled;
        self.arena[start..start + fragment.len()].copy_from_slice(fragment);

        if entry.info.filled == 0 {
            let desc = parse_header(fragment, entry.info.version)?;
            check_header(&desc, entry.info.transaction_type)?;
            entry.info.sender_id = desc.sender_id;
        }
        entry.info.filled += fragment.len();

        if !entry.info.is_complete() {
            return Ok(FillStatus::MoreFragmentsNeeded {
                filled: entry.info.filled,
            });
        }

        let transaction = self.transaction_at(index)?;
        self.validate(index, &transaction, is_partition)?;
        debug!(
            "{:?} complete: {} receivers, {} pages",
            transaction.desc.handle,
            transaction.receivers.len(),
            transaction.total_page_count()
        );
        Ok(FillStatus::Complete)
    }

    /// Checks the policy of a structurally valid descriptor against the rest of the system.
    fn validate(
        &self,
        index: usize,
        transaction: &MemTransaction,
        is_partition: impl Fn(u16) -> bool,
    ) -> Result<(), FfaError> {
        if is_secure_id(transaction.desc.sender_id) {
            warn!(
                "Memory can't be shared by secure endpoint {:#x}",
                transaction.desc.sender_id
            );
            return Err(FfaError::InvalidParameters);
        }

        for (position, receiver) in transaction.receivers.iter().enumerate() {
            if is_secure_id(receiver.endpoint_id) && !is_partition(receiver.endpoint_id) {
                warn!("Unknown receiver {:#x}", receiver.endpoint_id);
                return Err(FfaError::InvalidParameters);
            }
            if transaction.receivers[..position]
                .iter()
                .any(|other| other.endpoint_id == receiver.endpoint_id)
            {
                warn!("Duplicate receiver {:#x}", receiver.endpoint_id);
                return Err(FfaError::InvalidParameters);
            }
        }

        for (other_index, other) in self.entries.iter().enumerate() {
            if other_index == index || !other.info.is_complete() {
                continue;
            }
            let other_transaction = self.transaction_at(other_index)?;
            if overlapping(&transaction.ranges, &other_transaction.ranges) {
                warn!(
                    "{:?} overlaps {:?}",
                    transaction.desc.handle, other.info.handle
                );
                return Err(FfaError::InvalidParameters);
            }
        }
        Ok(())
    }

    /// Parses the complete descriptor of `handle`.
    pub fn transaction(&self, handle: Handle) -> Result<MemTransaction, FfaError> {
        let index = self.index_of(handle).ok_or(FfaError::InvalidParameters)?;
        if !self.entries[index].info.is_complete() {
            return Err(FfaError::InvalidParameters);
        }
        self.transaction_at(index)
    }

    fn transaction_at(&self, index: usize) -> Result<MemTransaction, FfaError> {
        let Entry { info, offset } = &self.entries[index];
        let mut transaction =
            MemTransaction::parse(&self.arena[*offset..*offset + info.size], info.version)?;
        transaction.desc.handle = info.handle;
        transaction.desc.flags.0 |= info.transaction_type.flag();
        Ok(transaction)
    }

    /// Records a retrieve of `handle`, returning the new in-use count.
    pub fn acquire(&mut self, handle: Handle) -> Result<u32, FfaError> {
        let index = self.index_of(handle).ok_or(FfaError::InvalidParameters)?;
        let info = &mut self.entries[index].info;
        info.in_use = info.in_use.checked_add(1).ok_or(FfaError::NoMemory)?;
        Ok(info.in_use)
    }

    /// Records a relinquish of `handle`, returning the new in-use count.
    ///
    /// Relinquishing more often than the object was retrieved is rejected.
    pub fn release(&mut self, handle: Handle) -> Result<u32, FfaError> {
        let index = self.index_of(handle).ok_or(FfaError::InvalidParameters)?;
        let info = &mut self.entries[index].info;
        if info.in_use == 0 {
            warn!("{handle:?} relinquished without an outstanding retrieve");
            return Err(FfaError::InvalidParameters);
        }
        info.in_use -= 1;
        Ok(info.in_use)
    }

    /// Frees the object with the given handle.
    pub fn free(&mut self, handle: Handle) -> Result<(), FfaError> {
        let index = self.index_of(handle).ok_or(FfaError::InvalidParameters)?;
        self.remove(index);
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        let Entry { info, offset } = self.entries.remove(index);
        let end = offset + info.size;
        self.arena.copy_within(end..self.used, offset);
        self.used -= info.size;
        for entry in &mut self.entries[index..] {
            entry.offset -= info.size;
        }
        debug!("Freed {:?}", info.handle);
    }

    fn index_of(&self, handle: Handle) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.info.handle == handle)
    }

    /// Number of objects in the store.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ShmemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks the header of the first fragment of a share or lend.
fn check_header(
    desc: &MemTransactionDesc,
    transaction_type: TransactionType,
) -> Result<(), FfaError> {
    if is_secure_id(desc.sender_id) {
        warn!("Secure sender {:#x} in share or lend", desc.sender_id);
        return Err(FfaError::InvalidParameters);
    }
    if is_non_secure(desc) {
        warn!("NS bit set in memory attributes by sender");
        return Err(FfaError::InvalidParameters);
    }
    if !transaction_type.accepts(desc.flags) {
        warn!("Invalid flags {:#x} for {transaction_type:?}", desc.flags.0);
        return Err(FfaError::InvalidParameters);
    }
    Ok(())
}

/// Returns the exclusive end address of `range`.
fn range_end(range: &ConstituentMemRegion) -> u64 {
    range
        .address
        .saturating_add(u64::from(range.page_cnt) * PAGE_SIZE as u64)
}

/// Returns whether any range of `a` intersects any range of `b`.
///
/// The same region trivially overlaps itself.
pub fn overlapping(a: &[ConstituentMemRegion], b: &[ConstituentMemRegion]) -> bool {
    if ptr::eq(a, b) {
        return true;
    }
    a.iter().any(|range_a| {
        b.iter().any(|range_b| {
            range_a.address < range_end(range_b) && range_b.address < range_end(range_a)
        })
    })
}
