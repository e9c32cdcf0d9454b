use crate::{RnnError, TempSpaceSizes};
use std::fmt::Display;

/// Where an executor stands within a training iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorState {
    /// Descriptors are built and no forward pass is pending a backward pass.
    Configured,
    /// The reserve buffer holds the state of the last forward pass.
    ForwardDone,
    /// Input gradients were computed; weight gradients may follow.
    BackwardDataDone,
    /// The iteration is complete.
    BackwardWeightsDone,
}

impl Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExecutorState::Configured => "configured",
            ExecutorState::ForwardDone => "past its forward pass",
            ExecutorState::BackwardDataDone => "past its backward data pass",
            ExecutorState::BackwardWeightsDone => "past its backward weights pass",
        })
    }
}

/// The executor entry points that take part in the phase ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseCall {
    Forward,
    BackwardData,
    BackwardWeights,
}

impl Display for PhaseCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PhaseCall::Forward => "forward",
            PhaseCall::BackwardData => "backward_data",
            PhaseCall::BackwardWeights => "backward_weights",
        })
    }
}

/// The state machine proper. Backward phases carry the buffer sizes resolved by the forward pass
/// they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Configured,
    ForwardDone(TempSpaceSizes),
    BackwardDataDone(TempSpaceSizes),
    BackwardWeightsDone,
}

impl Phase {
    pub(crate) fn state(&self) -> ExecutorState {
        match self {
            Phase::Configured => ExecutorState::Configured,
            Phase::ForwardDone(_) => ExecutorState::ForwardDone,
            Phase::BackwardDataDone(_) => ExecutorState::BackwardDataDone,
            Phase::BackwardWeightsDone => ExecutorState::BackwardWeightsDone,
        }
    }

    /// Checks that the backward `call` may run now and returns the sizes resolved by the forward
    /// pass it belongs to. A forward pass is accepted in every state and never asks.
    pub(crate) fn admit_backward(&self, call: PhaseCall) -> Result<TempSpaceSizes, RnnError> {
        match (call, self) {
            (PhaseCall::BackwardData, Phase::ForwardDone(sizes))
            | (PhaseCall::BackwardWeights, Phase::BackwardDataDone(sizes)) => Ok(*sizes),
            (call, phase) => Err(RnnError::OutOfOrder {
                call,
                state: phase.state(),
            }),
        }
    }

    /// The phase entered after `call` completed successfully.
    pub(crate) fn after(call: PhaseCall, sizes: TempSpaceSizes) -> Phase {
        match call {
            PhaseCall::Forward => Phase::ForwardDone(sizes),
            PhaseCall::BackwardData => Phase::BackwardDataDone(sizes),
            PhaseCall::BackwardWeights => Phase::BackwardWeightsDone,
        }
    }
}
