// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! RX/TX buffer pairs registered by endpoints.

use super::descriptor::PAGE_SIZE;
use crate::platform::{Platform, PlatformImpl};
use arm_ffa::FfaError;
use core::fmt::{self, Debug, Formatter};
use log::{debug, warn};
use spin::mutex::{SpinMutex, SpinMutexGuard};

const RXTX_PAGE_COUNT_MASK: u32 = 0x3f;

/// A mapped RX/TX buffer pair.
pub struct RxTxBuffers {
    tx_address: u64,
    rx_address: u64,
    tx: &'static mut [u8],
    rx: &'static mut [u8],
}

impl RxTxBuffers {
    /// Wraps the SPMC mapping of the buffers the endpoint registered at the given addresses.
    ///
    /// Both slices must have the same length.
    pub fn new(
        tx_address: u64,
        rx_address: u64,
        tx: &'static mut [u8],
        rx: &'static mut [u8],
    ) -> Self {
        assert_eq!(tx.len(), rx.len());
        Self {
            tx_address,
            rx_address,
            tx,
            rx,
        }
    }

    /// Size of each buffer in bytes.
    pub fn size(&self) -> usize {
        self.rx.len()
    }

    /// Returns whether `address` lies inside either buffer, as seen by the endpoint.
    pub fn contains(&self, address: u64) -> bool {
        let size = self.size() as u64;
        [self.tx_address, self.rx_address]
            .iter()
            .any(|base| (*base..base.saturating_add(size)).contains(&address))
    }
}

impl Debug for RxTxBuffers {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "RxTxBuffers {{ tx: {:#x}, rx: {:#x}, size: {:#x} }}",
            self.tx_address,
            self.rx_address,
            self.size()
        )
    }
}

/// Ownership of the RX buffer contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RxState {
    /// The SPMC may write to the RX buffer.
    Empty,
    /// The endpoint owns the RX buffer until it releases it.
    Full,
}

/// The lock-protected state of a mailbox.
#[derive(Debug)]
pub struct MailboxState {
    buffers: Option<RxTxBuffers>,
    rx_state: RxState,
}

impl MailboxState {
    /// Returns the registered buffers, or `InvalidParameters` if there are none.
    pub fn buffers(&self) -> Result<&RxTxBuffers, FfaError> {
        self.buffers.as_ref().ok_or(FfaError::InvalidParameters)
    }

    /// Returns the first `length` bytes of the TX buffer.
    pub fn tx(&self, length: usize) -> Result<&[u8], FfaError> {
        self.buffers()?
            .tx
            .get(..length)
            .ok_or(FfaError::InvalidParameters)
    }

    /// Returns the current RX ownership.
    pub fn rx_state(&self) -> RxState {
        self.rx_state
    }

    /// Takes ownership of the RX buffer to fill it for the endpoint.
    ///
    /// Fails with `busy` if the endpoint still owns the previous contents. The buffer is handed
    /// to the endpoint (`Full`) when the returned slice is written.
    pub fn acquire_rx(&mut self, busy: FfaError) -> Result<&mut [u8], FfaError> {
        let buffers = self.buffers.as_mut().ok_or(FfaError::InvalidParameters)?;
        if self.rx_state == RxState::Full {
            return Err(busy);
        }
        self.rx_state = RxState::Full;
        Ok(&mut buffers.rx[..])
    }
}

/// An endpoint's RX/TX buffer pair with its ownership state.
#[derive(Debug)]
pub struct Mailbox {
    state: SpinMutex<MailboxState>,
}

impl Mailbox {
    /// Creates a mailbox without buffers.
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(MailboxState {
                buffers: None,
                rx_state: RxState::Empty,
            }),
        }
    }

    /// Locks the mailbox.
    ///
    /// When the shared memory store lock is needed too, it must be taken first.
    pub fn lock(&self) -> SpinMutexGuard<'_, MailboxState> {
        self.state.lock()
    }

    /// Handles FFA_RXTX_MAP.
    pub fn map(&self, tx_address: u64, rx_address: u64, pages: u32) -> Result<(), FfaError> {
        if tx_address == 0 || rx_address == 0 {
            warn!("RXTX_MAP with null buffer address");
            return Err(FfaError::InvalidParameters);
        }
        if tx_address == rx_address {
            warn!("RXTX_MAP with the same address for TX and RX");
            return Err(FfaError::InvalidParameters);
        }
        let page_count = (pages & RXTX_PAGE_COUNT_MASK) as usize;
        if page_count == 0 {
            return Err(FfaError::InvalidParameters);
        }

        let mut state = self.lock();
        if state.buffers.is_some() {
            warn!("RX/TX buffers already mapped");
            return Err(FfaError::Denied);
        }

        let buffers = PlatformImpl::map_rxtx(tx_address, rx_address, page_count)?;
        debug_assert_eq!(buffers.size(), page_count * PAGE_SIZE);
        debug!("Mapped {buffers:?}");
        state.buffers = Some(buffers);
        state.rx_state = RxState::Empty;
        Ok(())
    }

    /// Handles FFA_RXTX_UNMAP.
    pub fn unmap(&self, id: u16) -> Result<(), FfaError> {
        if id != 0 {
            return Err(FfaError::InvalidParameters);
        }

        let mut state = self.lock();
        let buffers = state.buffers.take().ok_or(FfaError::InvalidParameters)?;
        state.rx_state = RxState::Empty;
        debug!("Unmapping {buffers:?}");
        PlatformImpl::unmap_rxtx(buffers);
        Ok(())
    }

    /// Handles FFA_RX_RELEASE.
    pub fn release(&self) -> Result<(), FfaError> {
        let mut state = self.lock();
        if state.rx_state != RxState::Full {
            return Err(FfaError::Denied);
        }
        state.rx_state = RxState::Empty;
        Ok(())
    }

    /// Returns whether `address` lies inside the registered buffers.
    pub fn contains(&self, address: u64) -> bool {
        self.lock()
            .buffers
            .as_ref()
            .is_some_and(|buffers| buffers.contains(address))
    }

    /// Copies `bytes` to the start of the TX buffer, as the owning endpoint would.
    #[cfg(test)]
    pub fn write_tx(&self, bytes: &[u8]) {
        let mut state = self.lock();
        let buffers = state.buffers.as_mut().expect("mailbox not mapped");
        buffers.tx[..bytes.len()].copy_from_slice(bytes);
    }

    /// Returns a copy of the first `length` bytes of the RX buffer.
    #[cfg(test)]
    pub fn read_rx(&self, length: usize) -> Vec<u8> {
        let state = self.lock();
        let buffers = state.buffers.as_ref().expect("mailbox not mapped");
        buffers.rx[..length].to_vec()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
