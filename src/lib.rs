// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! RF-A SPMC: an FF-A Secure Partition Manager Core running at EL3.
//!
//! The SPMC arbitrates between the Normal World and one or more Secure Partitions. It implements
//! the FF-A partition discovery, direct messaging and memory sharing interfaces, and tracks the
//! runtime state of every partition execution context.

#![cfg_attr(not(test), no_std)]

pub mod context;
pub mod logger;
pub mod platform;
pub mod services;
pub mod smccc;

use crate::{
    platform::{Platform, PlatformImpl},
    services::{Services, WakeUpReason},
};
use log::{debug, info};

/// Cold boot entry point of the SPMC, called on the primary core once the world switch and the
/// stacks are set up. Boots every secure partition, then enters the normal world.
///
/// # Panics
///
/// Panics if called on a secondary core.
pub fn spmc_main() -> ! {
    PlatformImpl::init();
    info!("Rust SPMC starting");
    assert_eq!(
        PlatformImpl::core_position(),
        PlatformImpl::primary_core(),
        "Cold boot on a secondary core"
    );

    let services = Services::get();
    services.spmc.boot_partitions();
    services.run_loop()
}

/// Warm boot entry point of the SPMC, called when a core comes back on or resumes from suspend.
pub fn spmc_warm_boot(reason: WakeUpReason) -> ! {
    debug!(
        "Warmboot on core #{}: {reason:?}",
        PlatformImpl::core_position()
    );

    let services = Services::get();
    match reason {
        WakeUpReason::CpuOn => services.spmc.cpu_on_finish(),
        WakeUpReason::SuspendFinished => services.spmc.suspend_finish(),
    }
    services.run_loop()
}
