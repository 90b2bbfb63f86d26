// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Memory regions of S-EL0 partitions and the permissions they are mapped with.

use super::descriptor::PAGE_SIZE;
use arm_ffa::{
    FfaError,
    memory_management::{DataAccessPermGetSet, InstructionAccessPermGetSet, MemPermissionsGetSet},
};
use arrayvec::ArrayVec;
use log::warn;

/// Maximum number of distinct regions tracked per partition, including those created by splits.
pub const MAX_MEMORY_REGIONS: usize = 16;

const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Access permissions of a page, as set by FFA_MEM_PERM_SET.
///
/// Writable memory is never executable, and pages can't be made inaccessible.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemPermissions {
    /// Read-write, not executable.
    ReadWrite,
    /// Read-only, not executable.
    ReadOnly,
    /// Read-only and executable.
    ReadExecute,
}

impl TryFrom<MemPermissionsGetSet> for MemPermissions {
    type Error = FfaError;

    fn try_from(value: MemPermissionsGetSet) -> Result<Self, Self::Error> {
        match (value.data_access, value.instr_access) {
            (DataAccessPermGetSet::ReadWrite, InstructionAccessPermGetSet::NonExecutable) => {
                Ok(Self::ReadWrite)
            }
            (DataAccessPermGetSet::ReadOnly, InstructionAccessPermGetSet::NonExecutable) => {
                Ok(Self::ReadOnly)
            }
            (DataAccessPermGetSet::ReadOnly, InstructionAccessPermGetSet::Executable) => {
                Ok(Self::ReadExecute)
            }
            _ => {
                warn!("Unsupported memory permissions {value:?}");
                Err(FfaError::InvalidParameters)
            }
        }
    }
}

impl From<MemPermissions> for MemPermissionsGetSet {
    fn from(value: MemPermissions) -> Self {
        let (data_access, instr_access) = match value {
            MemPermissions::ReadWrite => (
                DataAccessPermGetSet::ReadWrite,
                InstructionAccessPermGetSet::NonExecutable,
            ),
            MemPermissions::ReadOnly => (
                DataAccessPermGetSet::ReadOnly,
                InstructionAccessPermGetSet::NonExecutable,
            ),
            MemPermissions::ReadExecute => (
                DataAccessPermGetSet::ReadOnly,
                InstructionAccessPermGetSet::Executable,
            ),
        };
        Self {
            data_access,
            instr_access,
        }
    }
}

/// A page aligned range of a partition's address space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// First address of the region.
    pub base_address: u64,
    /// Size of the region in pages.
    pub page_count: u32,
    /// Current permissions of the whole region.
    pub permissions: MemPermissions,
}

impl MemoryRegion {
    fn end(&self) -> u64 {
        self.base_address + u64::from(self.page_count) * PAGE_SIZE_U64
    }

    fn contains(&self, address: u64) -> bool {
        (self.base_address..self.end()).contains(&address)
    }
}

/// The regions of one partition.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryRegions {
    regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
}

impl MemoryRegions {
    /// Creates the table from the partition's manifest.
    ///
    /// # Panics
    ///
    /// Panics if the manifest lists more than `MAX_MEMORY_REGIONS` regions.
    pub fn new(regions: &[MemoryRegion]) -> Self {
        assert!(
            regions.len() <= MAX_MEMORY_REGIONS,
            "Too many memory regions in partition manifest"
        );
        Self {
            regions: regions.iter().copied().collect(),
        }
    }

    /// Returns the regions.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Returns the permissions of the page containing `address`.
    pub fn permissions(&self, address: u64) -> Result<MemPermissions, FfaError> {
        self.regions
            .iter()
            .find(|region| region.contains(address))
            .map(|region| region.permissions)
            .ok_or(FfaError::InvalidParameters)
    }

    /// Changes the permissions of `page_count` pages starting at `base_address`.
    ///
    /// The range must lie within a single region. `apply` is called to update the translation
    /// tables once the request has been validated; the table is only updated if it succeeds.
    pub fn set_permissions(
        &mut self,
        base_address: u64,
        page_count: u32,
        permissions: MemPermissions,
        apply: impl FnOnce() -> Result<(), FfaError>,
    ) -> Result<(), FfaError> {
        if base_address % PAGE_SIZE_U64 != 0 || page_count == 0 {
            warn!("Invalid range {base_address:#x}, {page_count} pages");
            return Err(FfaError::InvalidParameters);
        }
        let end = u64::from(page_count)
            .checked_mul(PAGE_SIZE_U64)
            .and_then(|size| base_address.checked_add(size))
            .ok_or(FfaError::InvalidParameters)?;

        let index = self
            .regions
            .iter()
            .position(|region| region.contains(base_address) && end <= region.end())
            .ok_or_else(|| {
                warn!("Range {base_address:#x}..{end:#x} is not inside a single region");
                FfaError::InvalidParameters
            })?;
        let region = self.regions[index];

        let mut pieces = ArrayVec::<MemoryRegion, 3>::new();
        if region.base_address < base_address {
            pieces.push(MemoryRegion {
                base_address: region.base_address,
                page_count: ((base_address - region.base_address) / PAGE_SIZE_U64) as u32,
                permissions: region.permissions,
            });
        }
        pieces.push(MemoryRegion {
            base_address,
            page_count,
            permissions,
        });
        if end < region.end() {
            pieces.push(MemoryRegion {
                base_address: end,
                page_count: ((region.end() - end) / PAGE_SIZE_U64) as u32,
                permissions: region.permissions,
            });
        }
        if self.regions.len() - 1 + pieces.len() > MAX_MEMORY_REGIONS {
            warn!("No space left to split region {region:?}");
            return Err(FfaError::NoMemory);
        }

        apply()?;

        self.regions.remove(index);
        for (offset, piece) in pieces.into_iter().enumerate() {
            self.regions.insert(index + offset, piece);
        }
        Ok(())
    }
}
