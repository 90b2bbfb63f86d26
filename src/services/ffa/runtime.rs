// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Runtime state machine of a partition execution context.

use arm_ffa::FfaError;
use log::debug;

/// Whether an execution context can accept new work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeState {
    /// Idle, ready for a direct request, FFA_RUN or an interrupt.
    Waiting,
    /// Currently scheduled on its core.
    Running,
    /// Interrupted by a non-secure interrupt before it finished.
    Preempted,
    /// Gave up its CPU cycles with FFA_YIELD.
    Blocked,
}

/// What the execution context was last scheduled for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeModel {
    /// Partition initialisation, entered synchronously by the SPMC.
    Init,
    /// Scheduled by the normal world with FFA_RUN.
    Run,
    /// Handling a direct request.
    DirectRequest,
    /// Handling a secure interrupt.
    Interrupt,
}

/// The sub-protocol of an outstanding direct request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
    /// An implementation defined partition message.
    Partition,
    /// A power management framework message sent by the SPMC.
    PowerManagement,
}

/// A direct request the partition has not responded to yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingRequest {
    /// The endpoint the response must be sent to.
    pub origin: u16,
    /// The sub-protocol the response must use.
    pub kind: RequestKind,
}

/// The runtime bookkeeping of one execution context.
///
/// The register state lives with the world switch implementation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionContext {
    state: RuntimeState,
    model: RuntimeModel,
    request: Option<PendingRequest>,
}

impl ExecutionContext {
    /// Creates a context which is waiting for work.
    pub const fn new() -> Self {
        Self {
            state: RuntimeState::Waiting,
            model: RuntimeModel::Run,
            request: None,
        }
    }

    /// Returns the runtime state.
    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// Returns the runtime model.
    pub fn model(&self) -> RuntimeModel {
        self.model
    }

    /// Returns the outstanding direct request, if any.
    pub fn pending_request(&self) -> Option<PendingRequest> {
        self.request
    }

    /// Schedules the context for initialisation.
    pub fn begin_init(&mut self) {
        self.state = RuntimeState::Running;
        self.model = RuntimeModel::Init;
        self.request = None;
    }

    /// Accepts a direct request, which is only possible while waiting.
    pub fn begin_direct_request(&mut self, request: PendingRequest) -> Result<(), FfaError> {
        if self.state != RuntimeState::Waiting {
            debug!("Direct request to busy context {:?}", self.state);
            return Err(FfaError::Busy);
        }
        self.state = RuntimeState::Running;
        self.model = RuntimeModel::DirectRequest;
        self.request = Some(request);
        Ok(())
    }

    /// Completes the outstanding direct request with a response to `destination`.
    ///
    /// The response must match the recorded origin and sub-protocol. A partition may answer an
    /// SMC64 request with an SMC32 response and the other way round.
    pub fn complete_direct_request(
        &mut self,
        destination: u16,
        kind: RequestKind,
    ) -> Result<PendingRequest, FfaError> {
        if self.state != RuntimeState::Running || self.model != RuntimeModel::DirectRequest {
            return Err(FfaError::Denied);
        }
        let request = self.request.ok_or(FfaError::Denied)?;
        if request.origin != destination || request.kind != kind {
            debug!("Response to {destination:#x} ({kind:?}) does not match {request:?}");
            return Err(FfaError::Denied);
        }
        self.state = RuntimeState::Waiting;
        self.request = None;
        Ok(request)
    }

    /// Abandons the outstanding direct request, returning it so the origin can be told.
    pub fn abort_direct_request(&mut self) -> Option<PendingRequest> {
        if self.model != RuntimeModel::DirectRequest {
            return None;
        }
        self.state = RuntimeState::Waiting;
        self.request.take()
    }

    /// Handles FFA_MSG_WAIT, returning the model the context was running in.
    ///
    /// A context in the initialisation model stays `Running` until the SPMC has seen the
    /// outcome of the synchronous entry.
    pub fn wait(&mut self) -> Result<RuntimeModel, FfaError> {
        match self.model {
            RuntimeModel::DirectRequest => Err(FfaError::Denied),
            model => {
                self.state = RuntimeState::Waiting;
                Ok(model)
            }
        }
    }

    /// Schedules the context with FFA_RUN, returning the state it is resumed from.
    pub fn run(&mut self) -> Result<RuntimeState, FfaError> {
        let previous = self.state;
        match previous {
            RuntimeState::Running => return Err(FfaError::Busy),
            RuntimeState::Waiting => self.model = RuntimeModel::Run,
            RuntimeState::Preempted | RuntimeState::Blocked => {}
        }
        self.state = RuntimeState::Running;
        Ok(previous)
    }

    /// Handles FFA_YIELD.
    pub fn yield_cpu(&mut self) -> Result<(), FfaError> {
        match (self.state, self.model) {
            (RuntimeState::Running, RuntimeModel::Run | RuntimeModel::DirectRequest) => {
                self.state = RuntimeState::Blocked;
                Ok(())
            }
            _ => Err(FfaError::Denied),
        }
    }

    /// Records that a non-secure interrupt took the core away from the context.
    pub fn preempt(&mut self) {
        self.state = RuntimeState::Preempted;
    }

    /// Schedules the context to handle a secure interrupt.
    ///
    /// # Panics
    ///
    /// Panics if the context is not waiting.
    pub fn begin_interrupt(&mut self) {
        assert_eq!(
            self.state,
            RuntimeState::Waiting,
            "Secure interrupt for a context which is not waiting"
        );
        self.state = RuntimeState::Running;
        self.model = RuntimeModel::Interrupt;
    }

    /// Returns the context to its initial state, e.g. after its core was turned off.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
