// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Endpoint IDs, versions and the register encoding shared by the FF-A handlers.

use crate::smccc::SmcReturn;
use arm_ffa::{
    FfaError, Interface, Version,
    interface_args::{SuccessArgs, TargetInfo},
};

/// Endpoint ID of the SPMC itself.
pub const SPMC_ID: u16 = 0x8000;
/// Endpoint ID reserved for the SPMD.
pub const SPMD_ID: u16 = 0xffff;
/// Endpoint ID of the normal world, i.e. the hypervisor or OS kernel.
pub const NWD_ID: u16 = 0;
/// Endpoint ID which is never assigned to a partition.
pub const INVALID_PARTITION_ID: u16 = 0x7fff;
/// First endpoint ID handed out to secure partitions without a fixed ID.
pub const SP_ID_BASE: u16 = 0x8001;

/// The FF-A version implemented by the SPMC.
pub const SPMC_VERSION: Version = Version(1, 1);
/// FF-A v1.0, which uses the smaller descriptor layouts.
pub const VERSION_1_0: Version = Version(1, 0);

/// Version passed to the register codec.
///
/// v1.2 is the lowest version for which `arm_ffa` decodes the 18 register form of SMC64 direct
/// messages. The register layouts of every function the SPMC services are the same in v1.1 and
/// v1.2, and functions introduced after v1.2 are rejected by the codec.
pub const CODEC_VERSION: Version = Version(1, 2);

/// Returns true if the FF-A endpoint ID is assigned to the secure world.
pub const fn is_secure_id(id: u16) -> bool {
    id & 0x8000 != 0
}

/// Decodes the FF-A call in `regs`.
pub fn decode(regs: &[u64; 18]) -> Result<Interface, arm_ffa::Error> {
    Interface::from_regs(CODEC_VERSION, regs)
}

/// FFA_SUCCESS with no results.
pub fn success() -> SmcReturn {
    Interface::success32_noargs().into()
}

/// FFA_SUCCESS carrying the results of the call.
pub fn success_with(args: impl Into<SuccessArgs>) -> SmcReturn {
    Interface::Success {
        target_info: TargetInfo::default(),
        args: args.into(),
    }
    .into()
}

impl From<Interface> for SmcReturn {
    fn from(message: Interface) -> Self {
        let mut regs = SmcReturn::EMPTY;
        message.to_regs(CODEC_VERSION, regs.mark_all_used());
        regs
    }
}

impl From<FfaError> for SmcReturn {
    fn from(error: FfaError) -> Self {
        Interface::error(error, true).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_ffa::{
        FuncId, VersionOut,
        interface_args::{DirectMsgArgs, SuccessArgsIdGet},
    };

    #[test]
    fn error_return() {
        let regs = SmcReturn::from(FfaError::Denied);
        assert_eq!(regs.values().len(), SmcReturn::MAX_VALUES);
        assert_eq!(regs.values()[..4], [0x8400_0060, 0, 0xffff_fffa, 0]);
        assert!(regs.values()[4..].iter().all(|&value| value == 0));
    }

    #[test]
    fn success_results_in_w2() {
        let regs = success_with(SuccessArgsIdGet { id: 0x8001 });
        assert_eq!(regs.values()[..4], [0x8400_0061, 0, 0x8001, 0]);
        assert_eq!(success().values()[..3], [0x8400_0061, 0, 0]);
    }

    #[test]
    fn version_out_uses_w0() {
        let regs = SmcReturn::from(Interface::VersionOut {
            output_version: VersionOut::Version(SPMC_VERSION),
        });
        assert_eq!(regs.get(0), 0x0001_0001);
        let regs = SmcReturn::from(Interface::VersionOut {
            output_version: VersionOut::NotSupported,
        });
        assert_eq!(regs.get(0), 0xffff_ffff);
    }

    #[test]
    fn decodes_smc64_direct_request() {
        let mut regs = [0; 18];
        regs[0] = FuncId::MsgSendDirectReq64 as u64;
        regs[1] = 0x0000_8001;
        regs[3] = 0x1234;
        regs[17] = 7;
        let Ok(Interface::MsgSendDirectReq {
            src_id: 0,
            dst_id: 0x8001,
            args: DirectMsgArgs::Args64(args),
        }) = decode(&regs)
        else {
            panic!("Unexpected decoding of {regs:#x?}");
        };
        assert_eq!(args[0], 0x1234);
        assert_eq!(args[14], 7);
    }

    #[test]
    fn later_functions_not_supported() {
        let mut regs = [0; 18];
        regs[0] = FuncId::Run64 as u64;
        regs[1] = u32::from(TargetInfo {
            endpoint_id: 0x8001,
            vcpu_id: 0,
        })
        .into();
        let error = decode(&regs).unwrap_err();
        assert_eq!(FfaError::from(error), FfaError::NotSupported);
    }
}
