// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! SMC dispatch and the per-core runtime loop.

pub mod ffa;

use crate::{
    context::{RunResult, World},
    platform::{Platform, PlatformImpl},
    smccc::{FunctionId, NOT_SUPPORTED, SmcReturn},
};
use log::info;
use spin::Lazy;

/// Helper macro to define the range of SMC function ID values covered by a service
#[macro_export]
macro_rules! owns {
    // service handles the entire Owning Entity Number (OEN)
    ($owning_entity:expr) => {
        #[inline(always)]
        fn owns(&self, function: $crate::smccc::FunctionId) -> bool {
            function.oen() == $owning_entity
                && matches!(
                    function.call_type(),
                    $crate::smccc::SmcccCallType::Fast32 | $crate::smccc::SmcccCallType::Fast64
                )
        }
    };
    // service handles a sub-range of the OEN
    // range refers to the lower 16 bits [15:0] of the SMC FunctionId
    ($owning_entity:expr, $range:expr) => {
        #[inline(always)]
        fn owns(&self, function: $crate::smccc::FunctionId) -> bool {
            function.oen() == $owning_entity
                && $range.contains(&function.number())
                && matches!(
                    function.call_type(),
                    $crate::smccc::SmcccCallType::Fast32 | $crate::smccc::SmcccCallType::Fast64
                )
        }
    };
}
pub(crate) use owns;

/// A service which handles some range of SMC calls.
///
/// According to SMCCC v1.3+ the implementation must disregard the SVE hint bit in the function ID
/// and consider it to be 0 for the purpose of function identification.
pub trait Service {
    /// Returns whether this service is intended to handle the given function ID.
    fn owns(&self, function: FunctionId) -> bool;

    /// Handles the given SMC call from Normal World.
    fn handle_non_secure_smc(&self, _regs: &[u64; 18]) -> (SmcReturn, World) {
        (NOT_SUPPORTED.into(), World::NonSecure)
    }

    /// Handles the given SMC call from Secure World.
    fn handle_secure_smc(&self, _regs: &[u64; 18]) -> (SmcReturn, World) {
        (NOT_SUPPORTED.into(), World::Secure)
    }
}

/// Why a core came back through the warm boot path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeUpReason {
    /// Powered on for the first time, or after CPU_OFF.
    CpuOn,
    /// Resumed from a powerdown CPU_SUSPEND.
    SuspendFinished,
}

static SERVICES: Lazy<Services> = Lazy::new(Services::new);

/// Contains an instance of all of the currently implemented services.
pub struct Services {
    /// The Secure Partition Manager Core.
    pub spmc: ffa::Spmc,
}

impl Services {
    /// Returns a reference to the global Services instance.
    ///
    /// Also, initializes it if it hasn't been initialized yet.
    pub fn get() -> &'static Self {
        &SERVICES
    }

    fn new() -> Self {
        Self {
            spmc: ffa::Spmc::new(
                PlatformImpl::secure_partitions(),
                PlatformImpl::logical_partitions(),
                PlatformImpl::create_world_switch(),
            ),
        }
    }

    fn handle_smc(&self, regs: &[u64; 18], world: World) -> (SmcReturn, World) {
        let function = FunctionId(regs[0] as u32);

        if !function.valid() || !self.spmc.owns(function) {
            return (NOT_SUPPORTED.into(), world);
        }

        match world {
            World::NonSecure => self.spmc.handle_non_secure_smc(regs),
            World::Secure => self.spmc.handle_secure_smc(regs),
        }
    }

    /// Interrupts routed to EL3 are secure while the normal world runs, and non-secure while a
    /// partition runs.
    fn handle_interrupt(&self, world: World) -> (SmcReturn, World) {
        match world {
            World::NonSecure => (self.spmc.handle_secure_interrupt(), World::Secure),
            World::Secure => (self.spmc.handle_non_secure_interrupt(), World::NonSecure),
        }
    }

    fn per_world_loop(&self, mut regs: SmcReturn, world: World) -> (SmcReturn, World) {
        let mut next_world;

        loop {
            (regs, next_world) = match self.spmc.enter_world(&regs, world) {
                RunResult::Smc { regs } => self.handle_smc(&regs, world),
                RunResult::Interrupt => self.handle_interrupt(world),
            };

            if next_world != world {
                break (regs, next_world);
            }
        }
    }

    /// The main runtime loop.
    ///
    /// Enters the normal world and then keeps processing the results from a lower EL when it has
    /// returned to EL3, switching to the other world when a handler asks for it. The first entry
    /// happens with `SmcReturn::EMPTY`, so that the registers set up by the boot code are kept.
    /// This method doesn't return, it should be called on each core as the last step of the boot
    /// process.
    pub fn run_loop(&self) -> ! {
        let mut regs = SmcReturn::EMPTY;
        let mut current_world = World::NonSecure;
        info!("Booting Normal World");

        loop {
            let next_world;
            (regs, next_world) = self.per_world_loop(regs, current_world);
            assert_ne!(current_world, next_world);
            current_world = next_world;
        }
    }
}
