// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Logical partitions, which run inside the SPMC at EL3.

use super::partition::{PartitionProperties, is_reserved_id};
use arm_ffa::{FfaError, interface_args::DirectMsgArgs};
use log::info;
use uuid::Uuid;

/// Maximum number of logical partitions.
pub const MAX_LOGICAL_PARTITIONS: usize = 8;

/// A partition implemented as part of the firmware.
///
/// Direct requests to a logical partition are handled synchronously on the calling core, without
/// a world switch.
pub trait LogicalPartition: Sync {
    /// Endpoint ID of the partition.
    fn id(&self) -> u16;

    /// Partition UUID, with its bytes in the order they are passed in registers.
    fn uuid(&self) -> Uuid;

    /// Messaging capabilities. Must include `DIRECT_REQ_RECV`.
    fn properties(&self) -> PartitionProperties;

    /// Called once at boot, before any message is delivered.
    fn init(&self) -> Result<(), FfaError> {
        Ok(())
    }

    /// Handles a partition message from `source` and returns the arguments of the response.
    ///
    /// `args` is either `Args32` or `Args64`, and the response must use the same variant.
    fn handle_direct_request(&self, source: u16, args: DirectMsgArgs) -> DirectMsgArgs;
}

/// Checks the logical partitions against each other and the secure partitions, then initialises
/// them.
///
/// # Panics
///
/// Panics if there are more than `MAX_LOGICAL_PARTITIONS`, an ID is reserved or already used, a
/// partition can't receive direct requests, or its initialisation fails.
pub fn init_logical_partitions(
    logical_partitions: &[&dyn LogicalPartition],
    partition_ids: &[u16],
) {
    assert!(
        logical_partitions.len() <= MAX_LOGICAL_PARTITIONS,
        "Too many logical partitions: {}",
        logical_partitions.len()
    );
    for (index, partition) in logical_partitions.iter().enumerate() {
        let id = partition.id();
        assert!(!is_reserved_id(id), "Reserved logical partition ID {id:#x}");
        assert!(
            !partition_ids.contains(&id)
                && !logical_partitions[..index]
                    .iter()
                    .any(|other| other.id() == id),
            "Duplicate logical partition ID {id:#x}"
        );
        assert!(
            partition
                .properties()
                .contains(PartitionProperties::DIRECT_REQ_RECV),
            "Logical partition {id:#x} can't receive direct requests"
        );

        if let Err(error) = partition.init() {
            panic!("Logical partition {id:#x} failed to initialise: {error:?}");
        }
        info!("Logical partition {id:#x} initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::EchoPartition;

    static ECHO: EchoPartition = EchoPartition::new(0x8100);
    static OTHER: EchoPartition = EchoPartition::new(0x8101);
    static SAME: EchoPartition = EchoPartition::new(0x8100);
    static SPMC: EchoPartition = EchoPartition::new(0x8000);

    #[test]
    fn valid_partitions() {
        init_logical_partitions(&[&ECHO, &OTHER], &[0x8001]);
        assert!(ECHO.initialised());
    }

    #[test]
    #[should_panic]
    fn duplicate_logical() {
        init_logical_partitions(&[&ECHO, &SAME], &[]);
    }

    #[test]
    #[should_panic]
    fn clash_with_secure_partition() {
        init_logical_partitions(&[&ECHO], &[0x8100]);
    }

    #[test]
    #[should_panic]
    fn reserved_id() {
        init_logical_partitions(&[&SPMC], &[]);
    }
}
