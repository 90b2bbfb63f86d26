// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-core state and the world switch boundary.

use crate::{
    platform::{Platform, PlatformImpl},
    smccc::SmcReturn,
};
use core::cell::RefCell;
use percore::{Cores, ExceptionLock, PerCore};

/// Per-core mutable state, accessed with exceptions masked.
pub type PerCoreState<T> =
    PerCore<[ExceptionLock<RefCell<T>>; PlatformImpl::CORE_COUNT], CoresImpl>;

/// A security state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum World {
    /// Secure world, i.e. the secure partitions.
    Secure,
    /// Normal world, i.e. the hypervisor or OS kernel.
    NonSecure,
}

impl World {
    /// Returns the other world.
    pub fn opposite(self) -> Self {
        match self {
            Self::Secure => Self::NonSecure,
            Self::NonSecure => Self::Secure,
        }
    }
}

/// Implementation of [`Cores`] backed by the platform's core position.
pub struct CoresImpl;

// SAFETY: This implementation never returns the same index for different cores because
// `core_position` is guaranteed not to.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        PlatformImpl::core_position()
    }
}

/// The lower EL context to run next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Target {
    /// The normal world context of the current core.
    NormalWorld,
    /// An execution context of a secure partition on the current core.
    Partition {
        /// Endpoint ID of the partition.
        id: u16,
        /// Entry point to start the context from, or `None` to resume it where it left off.
        entry_point: Option<usize>,
    },
}

/// The reason a lower EL returned to EL3.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunResult {
    /// The lower EL executed an SMC instruction.
    Smc {
        /// The caller's x0-x17.
        regs: [u64; 18],
    },
    /// An interrupt routed to EL3 was taken.
    Interrupt,
}

/// Transfers control to a lower EL context and waits for it to return.
///
/// The register state of every context is owned by the implementation. The values in `regs` are
/// written to the caller-visible registers before entry; an empty `regs` leaves them untouched.
pub trait WorldSwitch: Sync {
    /// Enters `target` on the current core and returns once it traps back to EL3.
    fn enter(&self, target: Target, regs: &SmcReturn) -> RunResult;
}
