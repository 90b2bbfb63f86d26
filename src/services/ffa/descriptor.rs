// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Memory transaction descriptors.
//!
//! Descriptors arrive in endpoint-writable buffers, so they are always parsed into owned values
//! before use. The v1.1 layout is decoded and encoded by `arm_ffa`. Receivers implementing v1.0
//! use an older header without the receiver array size and offset, which is handled here.
//!
//! On top of the codec, the offsets inside a descriptor are cross-checked so that every byte of it
//! belongs to exactly one part.

use super::abi::VERSION_1_0;
use arm_ffa::{
    FfaError, Version,
    memory_management::{
        self, ConstituentMemRegion, MemAccessPerm, MemRegionSecurity, MemRelinquishDesc,
        MemTransactionDesc, MemTransactionFlags,
    },
};
use arrayvec::ArrayVec;
use log::warn;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Translation granule assumed for address ranges.
pub const PAGE_SIZE: usize = 0x1000;

/// Maximum number of receivers in one transaction.
pub const MAX_RECEIVERS: usize = 8;
/// Maximum number of address ranges in one transaction.
pub const MAX_ADDRESS_RANGES: usize = 64;

const HEADER_V1_1_SIZE: usize = 48;
const EMAD_SIZE: usize = 16;
const COMPOSITE_SIZE: usize = 16;
const CONSTITUENT_SIZE: usize = 16;

// Field offsets shared by both header layouts, or within the records that follow them.
const RECEIVER_COUNT_OFFSET: usize = 28;
const RECEIVER_ARRAY_OFFSET: usize = 32;
const EMAD_COMPOSITE_OFFSET: usize = 4;
const COMPOSITE_RANGE_COUNT_OFFSET: usize = 4;

/// Size of the largest descriptor the SPMC can hold.
const MAX_DESCRIPTOR_SIZE: usize = HEADER_V1_1_SIZE
    + MAX_RECEIVERS * EMAD_SIZE
    + COMPOSITE_SIZE
    + MAX_ADDRESS_RANGES * CONSTITUENT_SIZE;

/// The first fields of a transaction header, laid out the same way in v1.0 and v1.1.
///
/// In v1.0 the memory attributes are a single byte followed by a reserved byte, so a non-zero
/// reserved byte fails attribute decoding.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct CommonHeader {
    sender_id: u16,
    memory_attributes: u16,
    flags: u32,
    handle: u64,
    tag: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct HeaderV1_0 {
    common: CommonHeader,
    reserved: u32,
    emad_count: u32,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct EmadV1_0 {
    endpoint_id: u16,
    permissions: u8,
    flags: u8,
    composite_offset: u32,
    reserved: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct CompositeV1_0 {
    total_page_count: u32,
    address_range_count: u32,
    reserved: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct ConstituentV1_0 {
    address: u64,
    page_count: u32,
    reserved: u32,
}

/// Whether a transaction shares or lends memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionType {
    /// FFA_MEM_SHARE: the sender keeps access.
    Share,
    /// FFA_MEM_LEND: the sender loses access until reclaim.
    Lend,
}

impl TransactionType {
    /// The flag value stamped into the descriptor for this type.
    pub fn flag(self) -> u32 {
        match self {
            Self::Share => MemTransactionFlags::TYPE_SHARE,
            Self::Lend => MemTransactionFlags::TYPE_LEND,
        }
    }

    /// Returns whether a descriptor of this type may carry `flags`: either none or just the type.
    pub fn accepts(self, flags: MemTransactionFlags) -> bool {
        flags.0 == 0 || flags.0 == self.flag()
    }
}

/// Size of the fixed header in the layout of `version`.
pub fn header_size(version: Version) -> usize {
    if version == VERSION_1_0 {
        size_of::<HeaderV1_0>()
    } else {
        HEADER_V1_1_SIZE
    }
}

/// Returns whether the memory attributes of `desc` have the NS bit set.
pub fn is_non_secure(desc: &MemTransactionDesc) -> bool {
    desc.mem_region_attr.security == MemRegionSecurity::NonSecure
}

/// Reads the fields of the header which don't describe the layout of the rest of the descriptor.
pub fn parse_header(bytes: &[u8], version: Version) -> Result<MemTransactionDesc, FfaError> {
    if bytes.len() < header_size(version) {
        warn!("Descriptor of {:#x} bytes is shorter than its header", bytes.len());
        return Err(FfaError::InvalidParameters);
    }
    let (header, _) =
        CommonHeader::read_from_prefix(bytes).map_err(|_| FfaError::InvalidParameters)?;
    Ok(MemTransactionDesc {
        sender_id: header.sender_id,
        mem_region_attr: header.memory_attributes.try_into()?,
        flags: MemTransactionFlags(header.flags),
        handle: memory_management::Handle(header.handle),
        tag: header.tag,
    })
}

/// Checks the receiver and address range counts declared by the first fragment of a descriptor
/// against what the SPMC can hold, so that an oversized transaction is refused before any of it is
/// stored.
///
/// The range count is only checked if the first fragment reaches the composite region header.
pub fn check_declared_counts(fragment: &[u8], version: Version) -> Result<(), FfaError> {
    let array = ReceiverArray::locate(fragment, version)?;
    if array.count > MAX_RECEIVERS {
        warn!("Descriptor declares {} receivers", array.count);
        return Err(FfaError::NoMemory);
    }
    if array.count == 0 {
        return Ok(());
    }
    if let Ok(composite_offset) = array.composite_offset(fragment, 0)
        && let Ok(range_count) = read_u32(fragment, composite_offset + COMPOSITE_RANGE_COUNT_OFFSET)
        && range_count as usize > MAX_ADDRESS_RANGES
    {
        warn!("Descriptor declares {range_count} address ranges");
        return Err(FfaError::NoMemory);
    }
    Ok(())
}

/// Position of the receiver array in a descriptor.
#[derive(Clone, Copy, Debug)]
struct ReceiverArray {
    offset: usize,
    count: usize,
}

impl ReceiverArray {
    fn locate(bytes: &[u8], version: Version) -> Result<Self, FfaError> {
        if bytes.len() < header_size(version) {
            warn!("Descriptor of {:#x} bytes is shorter than its header", bytes.len());
            return Err(FfaError::InvalidParameters);
        }
        let offset = if version == VERSION_1_0 {
            size_of::<HeaderV1_0>()
        } else {
            read_u32(bytes, RECEIVER_ARRAY_OFFSET)? as usize
        };
        Ok(Self {
            offset,
            count: read_u32(bytes, RECEIVER_COUNT_OFFSET)? as usize,
        })
    }

    /// Returns the end of the array, checking that it lies within `length` bytes.
    fn end(&self, length: usize) -> Result<usize, FfaError> {
        if self.count == 0 {
            warn!("Memory transaction without receivers");
            return Err(FfaError::InvalidParameters);
        }
        if self.offset % 16 != 0 {
            warn!("Misaligned receiver array at {:#x}", self.offset);
            return Err(FfaError::InvalidParameters);
        }
        let end = self
            .count
            .checked_mul(EMAD_SIZE)
            .and_then(|size| size.checked_add(self.offset))
            .ok_or(FfaError::InvalidParameters)?;
        if end > length {
            warn!("Receiver array ends at {end:#x}, past descriptor size {length:#x}");
            return Err(FfaError::InvalidParameters);
        }
        Ok(end)
    }

    fn composite_offset(&self, bytes: &[u8], index: usize) -> Result<usize, FfaError> {
        let offset = self.offset + index * EMAD_SIZE + EMAD_COMPOSITE_OFFSET;
        Ok(read_u32(bytes, offset)? as usize)
    }

    /// Returns the composite offset shared by every receiver.
    ///
    /// It must lie past the receiver array, 8-byte aligned, within `bytes`.
    fn common_composite_offset(&self, bytes: &[u8]) -> Result<usize, FfaError> {
        let receivers_end = self.end(bytes.len())?;
        let first = self.composite_offset(bytes, 0)?;
        for index in 0..self.count {
            let offset = self.composite_offset(bytes, index)?;
            if offset < receivers_end || offset > bytes.len() || offset % 8 != 0 {
                warn!("Invalid composite offset {offset:#x} for receiver {index}");
                return Err(FfaError::InvalidParameters);
            }
            if offset != first {
                warn!("Receivers reference different composite regions");
                return Err(FfaError::InvalidParameters);
            }
        }
        Ok(first)
    }

    fn v1_0_receivers<'a>(
        &self,
        bytes: &'a [u8],
    ) -> impl Iterator<Item = Result<MemAccessPerm, memory_management::Error>> + 'a {
        bytes[self.offset..self.offset + self.count * EMAD_SIZE]
            .chunks_exact(EMAD_SIZE)
            .map(|chunk| -> Result<_, memory_management::Error> {
                let emad = EmadV1_0::read_from_bytes(chunk)
                    .map_err(|_| memory_management::Error::MalformedDescriptor)?;
                Ok(MemAccessPerm {
                    endpoint_id: emad.endpoint_id,
                    instr_access: emad.permissions.try_into()?,
                    data_access: emad.permissions.try_into()?,
                    flags: emad.flags,
                })
            })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, FfaError> {
    let field = bytes
        .get(offset..offset + size_of::<u32>())
        .ok_or(FfaError::InvalidParameters)?;
    u32::read_from_bytes(field).map_err(|_| FfaError::InvalidParameters)
}

/// Collects decoded records, failing with `NoMemory` if there are more than `N`.
fn collect<T, const N: usize>(
    items: impl Iterator<Item = Result<T, memory_management::Error>>,
) -> Result<ArrayVec<T, N>, FfaError> {
    let mut collected = ArrayVec::new();
    for item in items {
        collected.try_push(item?).map_err(|_| FfaError::NoMemory)?;
    }
    Ok(collected)
}

/// An owned, structurally validated memory transaction descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct MemTransaction {
    /// The fixed header.
    pub desc: MemTransactionDesc,
    /// Receivers, in descriptor order.
    pub receivers: ArrayVec<MemAccessPerm, MAX_RECEIVERS>,
    /// The composite memory region.
    pub ranges: ArrayVec<ConstituentMemRegion, MAX_ADDRESS_RANGES>,
}

impl MemTransaction {
    /// Parses a complete descriptor, checking its internal structure.
    ///
    /// Fails with `InvalidParameters` unless:
    /// 1. there is at least one receiver and the receiver array lies within `bytes`;
    /// 2. every receiver's composite offset lies past the receiver array, within `bytes`;
    /// 3. every receiver uses the same composite offset;
    /// 4. the composite region's range count and total page count agree with its contents, and
    ///    its last range ends the descriptor.
    pub fn parse(bytes: &[u8], version: Version) -> Result<Self, FfaError> {
        let array = ReceiverArray::locate(bytes, version)?;
        let composite_offset = array.common_composite_offset(bytes)?;

        let transaction = if version == VERSION_1_0 {
            Self {
                desc: parse_header(bytes, version)?,
                receivers: collect(array.v1_0_receivers(bytes))?,
                ranges: v1_0_ranges(&bytes[composite_offset..])?,
            }
        } else {
            let (desc, receivers, ranges) = MemTransactionDesc::unpack(bytes)?;
            Self {
                desc,
                receivers: collect(receivers)?,
                ranges: collect(ranges.ok_or(FfaError::InvalidParameters)?)?,
            }
        };

        let end = composite_offset + COMPOSITE_SIZE + transaction.ranges.len() * CONSTITUENT_SIZE;
        if end != bytes.len() {
            warn!(
                "Composite region ends at {end:#x} in a descriptor of {:#x} bytes",
                bytes.len()
            );
            return Err(FfaError::InvalidParameters);
        }
        Ok(transaction)
    }

    /// Returns the receiver entry for `endpoint_id`, if it is one.
    pub fn receiver(&self, endpoint_id: u16) -> Option<&MemAccessPerm> {
        self.receivers
            .iter()
            .find(|receiver| receiver.endpoint_id == endpoint_id)
    }

    /// Total number of pages across all ranges.
    pub fn total_page_count(&self) -> u32 {
        self.ranges.iter().map(|range| range.page_cnt).sum()
    }

    /// Returns the size of the descriptor when serialised in the layout of `version`.
    pub fn serialized_size(&self, version: Version) -> usize {
        self.composite_offset(version) + COMPOSITE_SIZE + self.ranges.len() * CONSTITUENT_SIZE
    }

    fn composite_offset(&self, version: Version) -> usize {
        header_size(version) + self.receivers.len() * EMAD_SIZE
    }

    /// Serialises the descriptor in the layout of `version`, writing only the bytes from `offset`
    /// onwards that fit in `out`. Returns the number of bytes written.
    pub fn write_window(&self, version: Version, offset: usize, out: &mut [u8]) -> usize {
        let mut scratch = [0; MAX_DESCRIPTOR_SIZE];
        let size = if version == VERSION_1_0 {
            self.pack_v1_0(&mut scratch)
        } else {
            self.desc.pack(&self.ranges, &self.receivers, &mut scratch)
        };
        let Some(window) = scratch[..size].get(offset..) else {
            return 0;
        };
        let written = window.len().min(out.len());
        out[..written].copy_from_slice(&window[..written]);
        written
    }

    fn pack_v1_0(&self, buf: &mut [u8]) -> usize {
        let mut position = 0;
        let mut write = |bytes: &[u8]| {
            buf[position..position + bytes.len()].copy_from_slice(bytes);
            position += bytes.len();
        };
        write(
            HeaderV1_0 {
                common: CommonHeader {
                    sender_id: self.desc.sender_id,
                    memory_attributes: u16::from(self.desc.mem_region_attr),
                    flags: self.desc.flags.0,
                    handle: self.desc.handle.0,
                    tag: self.desc.tag,
                },
                reserved: 0,
                emad_count: self.receivers.len() as u32,
            }
            .as_bytes(),
        );
        let composite_offset = self.composite_offset(VERSION_1_0) as u32;
        for receiver in &self.receivers {
            write(
                EmadV1_0 {
                    endpoint_id: receiver.endpoint_id,
                    permissions: receiver.data_access as u8 | receiver.instr_access as u8,
                    flags: receiver.flags,
                    composite_offset,
                    reserved: 0,
                }
                .as_bytes(),
            );
        }
        write(
            CompositeV1_0 {
                total_page_count: self.total_page_count(),
                address_range_count: self.ranges.len() as u32,
                reserved: 0,
            }
            .as_bytes(),
        );
        for range in &self.ranges {
            write(
                ConstituentV1_0 {
                    address: range.address,
                    page_count: range.page_cnt,
                    reserved: 0,
                }
                .as_bytes(),
            );
        }
        position
    }
}

/// Reads a v1.0 composite region from the start of `bytes`.
fn v1_0_ranges(
    bytes: &[u8],
) -> Result<ArrayVec<ConstituentMemRegion, MAX_ADDRESS_RANGES>, FfaError> {
    let (composite, constituents) =
        CompositeV1_0::read_from_prefix(bytes).map_err(|_| FfaError::InvalidParameters)?;
    let range_count = composite.address_range_count as usize;
    let constituents = range_count
        .checked_mul(CONSTITUENT_SIZE)
        .and_then(|size| constituents.get(..size))
        .ok_or(FfaError::InvalidParameters)?;

    let ranges: ArrayVec<_, MAX_ADDRESS_RANGES> =
        collect(constituents.chunks_exact(CONSTITUENT_SIZE).map(
            |chunk| -> Result<_, memory_management::Error> {
            let constituent = ConstituentV1_0::read_from_bytes(chunk)
                .map_err(|_| memory_management::Error::MalformedDescriptor)?;
            Ok(ConstituentMemRegion {
                address: constituent.address,
                page_cnt: constituent.page_count,
            })
        }))?;
    let page_total: u64 = ranges.iter().map(|range| u64::from(range.page_cnt)).sum();
    if page_total != u64::from(composite.total_page_count) {
        warn!(
            "Page count mismatch: {page_total} != {}",
            composite.total_page_count
        );
        return Err(FfaError::InvalidParameters);
    }
    Ok(ranges)
}

/// A retrieve request sent by a receiver in FFA_MEM_RETRIEVE_REQ.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetrieveRequest {
    /// The fixed header, naming the transaction by handle.
    pub desc: MemTransactionDesc,
    /// The receivers the request is made on behalf of.
    pub receivers: ArrayVec<MemAccessPerm, MAX_RECEIVERS>,
}

impl RetrieveRequest {
    /// Parses a retrieve request.
    pub fn parse(bytes: &[u8], version: Version) -> Result<Self, FfaError> {
        let array = ReceiverArray::locate(bytes, version)?;
        array.end(bytes.len())?;
        if version == VERSION_1_0 {
            Ok(Self {
                desc: parse_header(bytes, version)?,
                receivers: collect(array.v1_0_receivers(bytes))?,
            })
        } else {
            let (desc, receivers, _) = MemTransactionDesc::unpack(bytes)?;
            Ok(Self {
                desc,
                receivers: collect(receivers)?,
            })
        }
    }
}

/// The descriptor passed in FFA_MEM_RELINQUISH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelinquishRequest {
    /// The transaction being relinquished and the relinquish flags.
    pub desc: MemRelinquishDesc,
    /// The endpoints relinquishing access.
    pub endpoints: ArrayVec<u16, MAX_RECEIVERS>,
}

impl RelinquishRequest {
    /// Parses a relinquish descriptor.
    pub fn parse(bytes: &[u8]) -> Result<Self, FfaError> {
        let (desc, endpoints) = MemRelinquishDesc::unpack(bytes)?;
        let mut collected = ArrayVec::new();
        for endpoint in endpoints {
            collected
                .try_push(endpoint)
                .map_err(|_| FfaError::InvalidParameters)?;
        }
        Ok(Self {
            desc,
            endpoints: collected,
        })
    }
}

/// Helpers to build descriptors in tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use arm_ffa::memory_management::{
        Cacheability, DataAccessPerm, Handle, InstuctionAccessPerm, MemRegionAttributes, MemType,
        Shareability,
    };

    /// Builds a descriptor with the given sender, receivers and ranges.
    pub fn transaction(
        sender_id: u16,
        receivers: &[u16],
        ranges: &[(u64, u32)],
    ) -> MemTransaction {
        MemTransaction {
            desc: MemTransactionDesc {
                sender_id,
                mem_region_attr: MemRegionAttributes {
                    security: MemRegionSecurity::Secure,
                    mem_type: MemType::Normal {
                        cacheability: Cacheability::WriteBack,
                        shareability: Shareability::Inner,
                    },
                },
                flags: MemTransactionFlags(0),
                handle: Handle(0),
                tag: 0x77,
            },
            receivers: receivers
                .iter()
                .map(|id| MemAccessPerm {
                    endpoint_id: *id,
                    instr_access: InstuctionAccessPerm::NotExecutable,
                    data_access: DataAccessPerm::ReadWrite,
                    flags: 0,
                })
                .collect(),
            ranges: ranges
                .iter()
                .map(|(address, page_cnt)| ConstituentMemRegion {
                    address: *address,
                    page_cnt: *page_cnt,
                })
                .collect(),
        }
    }

    /// Serialises a descriptor in full.
    pub fn encode(transaction: &MemTransaction, version: Version) -> Vec<u8> {
        let mut bytes = vec![0; transaction.serialized_size(version)];
        transaction.write_window(version, 0, &mut bytes);
        bytes
    }

    /// Builds a retrieve request for `handle` listing every receiver of `transaction`, without a
    /// composite region.
    pub fn retrieve_request(
        transaction: &MemTransaction,
        handle: Handle,
        version: Version,
    ) -> Vec<u8> {
        let mut request = transaction.clone();
        request.desc.handle = handle;
        let mut bytes = encode(&request, version);
        let receivers_end = header_size(version) + request.receivers.len() * EMAD_SIZE;
        for emad in (header_size(version)..receivers_end).step_by(EMAD_SIZE) {
            patch_u32(&mut bytes, emad + EMAD_COMPOSITE_OFFSET, 0);
        }
        bytes.truncate(receivers_end);
        bytes
    }

    /// Builds a relinquish descriptor.
    pub fn relinquish(handle: Handle, flags: u32, endpoints: &[u16]) -> Vec<u8> {
        let mut bytes = vec![0; 16 + endpoints.len() * size_of::<u16>()];
        MemRelinquishDesc { handle, flags }.pack(endpoints, &mut bytes);
        bytes
    }

    /// Overwrites a little-endian u32 field at `offset`.
    pub fn patch_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::services::ffa::abi::SPMC_VERSION;
    use arm_ffa::memory_management::Handle;

    const HEADER: usize = HEADER_V1_1_SIZE;
    // Offset of the composite offset in the first receiver of a v1.1 descriptor.
    const FIRST_COMPOSITE_OFFSET: usize = HEADER + EMAD_COMPOSITE_OFFSET;

    fn sample() -> MemTransaction {
        transaction(0, &[0x8001, 0x8002], &[(0x1000, 1), (0x8000, 3)])
    }

    #[test]
    fn wire_sizes() {
        assert_eq!(size_of::<CommonHeader>(), 24);
        assert_eq!(size_of::<HeaderV1_0>(), 32);
        assert_eq!(size_of::<EmadV1_0>(), EMAD_SIZE);
        assert_eq!(size_of::<CompositeV1_0>(), COMPOSITE_SIZE);
        assert_eq!(size_of::<ConstituentV1_0>(), CONSTITUENT_SIZE);
        assert_eq!(MAX_DESCRIPTOR_SIZE, 0x4c0);
    }

    #[test]
    fn parse_serialised_descriptor() {
        let sent = sample();
        let bytes = encode(&sent, SPMC_VERSION);
        assert_eq!(bytes.len(), 48 + 2 * 16 + 16 + 2 * 16);
        // Memory attributes: normal, write-back, inner shareable.
        assert_eq!(bytes[2], 0x2f);

        let parsed = MemTransaction::parse(&bytes, SPMC_VERSION).unwrap();
        assert_eq!(parsed, sent);
        assert_eq!(parsed.total_page_count(), 4);
        assert_eq!(parsed.desc.tag, 0x77);
    }

    #[test]
    fn v1_0_layout() {
        let sent = sample();
        let bytes = encode(&sent, VERSION_1_0);
        assert_eq!(bytes.len(), 32 + 2 * 16 + 16 + 2 * 16);
        assert_eq!(bytes[2], 0x2f);
        // The receiver array follows the header directly.
        assert_eq!(u16::from_le_bytes([bytes[32], bytes[33]]), 0x8001);
        assert_eq!(bytes[34], 0b0110);

        let parsed = MemTransaction::parse(&bytes, VERSION_1_0).unwrap();
        assert_eq!(parsed, sent);
    }

    #[test]
    fn v1_0_page_count_mismatch() {
        let mut bytes = encode(&sample(), VERSION_1_0);
        // total_page_count of the composite region at 64.
        patch_u32(&mut bytes, 64, 3);
        assert_eq!(
            MemTransaction::parse(&bytes, VERSION_1_0),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn invalid_attributes() {
        let mut bytes = encode(&sample(), SPMC_VERSION);
        // Bits 15:7 of the memory attributes are reserved.
        bytes[3] = 1;
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn no_receivers() {
        let bytes = encode(&transaction(0, &[], &[(0x1000, 1)]), SPMC_VERSION);
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn receiver_array_out_of_bounds() {
        let mut bytes = encode(&sample(), SPMC_VERSION);
        patch_u32(&mut bytes, RECEIVER_COUNT_OFFSET, 100);
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn misaligned_receiver_array() {
        let mut bytes = encode(&sample(), SPMC_VERSION);
        patch_u32(&mut bytes, RECEIVER_ARRAY_OFFSET, 40);
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn composite_offset_inside_receivers() {
        let mut bytes = encode(&sample(), SPMC_VERSION);
        patch_u32(&mut bytes, FIRST_COMPOSITE_OFFSET, HEADER as u32);
        patch_u32(&mut bytes, FIRST_COMPOSITE_OFFSET + 16, HEADER as u32);
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn composite_offset_past_end() {
        let mut bytes = encode(&sample(), SPMC_VERSION);
        let past_end = bytes.len() as u32 + 8;
        patch_u32(&mut bytes, FIRST_COMPOSITE_OFFSET, past_end);
        patch_u32(&mut bytes, FIRST_COMPOSITE_OFFSET + 16, past_end);
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn divergent_composite_offsets() {
        let mut bytes = encode(&sample(), SPMC_VERSION);
        patch_u32(&mut bytes, FIRST_COMPOSITE_OFFSET + 16, 96);
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn range_count_mismatch() {
        let mut bytes = encode(&sample(), SPMC_VERSION);
        // address_range_count of the composite region at 80.
        patch_u32(&mut bytes, 84, 3);
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );

        let bytes = encode(&sample(), SPMC_VERSION);
        assert_eq!(
            MemTransaction::parse(&bytes[..bytes.len() - 8], SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );

        // Trailing bytes after the last range.
        let mut padded = encode(&sample(), SPMC_VERSION);
        padded.extend_from_slice(&[0; 16]);
        assert_eq!(
            MemTransaction::parse(&padded, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn page_count_mismatch() {
        let mut bytes = encode(&sample(), SPMC_VERSION);
        patch_u32(&mut bytes, 80, 5);
        assert_eq!(
            MemTransaction::parse(&bytes, SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn windowed_serialisation() {
        let transaction = sample();
        let full = encode(&transaction, SPMC_VERSION);

        let mut window = [0; 40];
        assert_eq!(transaction.write_window(SPMC_VERSION, 20, &mut window), 40);
        assert_eq!(window[..], full[20..60]);

        let mut tail = [0xff; 64];
        let written = transaction.write_window(SPMC_VERSION, full.len() - 10, &mut tail);
        assert_eq!(written, 10);
        assert_eq!(tail[..10], full[full.len() - 10..]);
        assert_eq!(tail[10], 0xff);

        assert_eq!(transaction.write_window(SPMC_VERSION, full.len() + 1, &mut tail), 0);
    }

    #[test]
    fn retrieve_request_lists_every_receiver() {
        let bytes = retrieve_request(&sample(), Handle(5), SPMC_VERSION);
        assert_eq!(bytes.len(), HEADER + 2 * EMAD_SIZE);
        let request = RetrieveRequest::parse(&bytes, SPMC_VERSION).unwrap();
        assert_eq!(request.desc.handle, Handle(5));
        assert_eq!(request.receivers, sample().receivers);

        let v1_0 = retrieve_request(&sample(), Handle(5), VERSION_1_0);
        let request = RetrieveRequest::parse(&v1_0, VERSION_1_0).unwrap();
        assert_eq!(request.desc.handle, Handle(5));
        assert_eq!(request.receivers, sample().receivers);

        assert_eq!(
            RetrieveRequest::parse(&bytes[..HEADER - 1], SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
        assert_eq!(
            RetrieveRequest::parse(&bytes[..HEADER + EMAD_SIZE], SPMC_VERSION),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn relinquish_descriptor() {
        let bytes = relinquish(Handle(0x1_0000_0002), 0, &[0x8001]);
        assert_eq!(bytes.len(), 18);
        let request = RelinquishRequest::parse(&bytes).unwrap();
        assert_eq!(request.desc.handle, Handle(0x1_0000_0002));
        assert_eq!(request.desc.flags, 0);
        assert_eq!(request.endpoints.as_slice(), [0x8001]);

        assert_eq!(
            RelinquishRequest::parse(&bytes[..17]),
            Err(FfaError::InvalidParameters)
        );

        let endpoints: Vec<u16> = (0x8001..0x800b).collect();
        assert_eq!(
            RelinquishRequest::parse(&relinquish(Handle(1), 0, &endpoints)),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn header_of_first_fragment() {
        let bytes = encode(&sample(), VERSION_1_0);
        let desc = parse_header(&bytes[..32], VERSION_1_0).unwrap();
        assert_eq!(desc, sample().desc);
        assert!(!is_non_secure(&desc));
        assert_eq!(
            parse_header(&bytes[..31], VERSION_1_0),
            Err(FfaError::InvalidParameters)
        );
    }

    #[test]
    fn declared_counts_checked_on_first_fragment() {
        let bytes = encode(&sample(), SPMC_VERSION);
        // Just the header: nothing but the receiver count is known yet.
        assert_eq!(check_declared_counts(&bytes[..HEADER], SPMC_VERSION), Ok(()));
        assert_eq!(check_declared_counts(&bytes, SPMC_VERSION), Ok(()));

        let mut receivers = bytes.clone();
        patch_u32(&mut receivers, RECEIVER_COUNT_OFFSET, MAX_RECEIVERS as u32 + 1);
        assert_eq!(
            check_declared_counts(&receivers[..HEADER], SPMC_VERSION),
            Err(FfaError::NoMemory)
        );

        let mut ranges = bytes.clone();
        patch_u32(&mut ranges, 84, MAX_ADDRESS_RANGES as u32 + 1);
        assert_eq!(
            check_declared_counts(&ranges, SPMC_VERSION),
            Err(FfaError::NoMemory)
        );
        // The composite region hasn't arrived yet.
        assert_eq!(check_declared_counts(&ranges[..80], SPMC_VERSION), Ok(()));

        let mut v1_0 = encode(&sample(), VERSION_1_0);
        patch_u32(&mut v1_0, RECEIVER_COUNT_OFFSET, 100);
        assert_eq!(
            check_declared_counts(&v1_0, VERSION_1_0),
            Err(FfaError::NoMemory)
        );
        assert_eq!(
            check_declared_counts(&v1_0[..20], VERSION_1_0),
            Err(FfaError::InvalidParameters)
        );
    }
}
