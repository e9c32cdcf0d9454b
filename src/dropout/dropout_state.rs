use crate::{RnnBackend, RnnError};
use std::rc::Rc;
use tracing::{debug, warn};

/// Seed the dropout generator states are initialized with unless configured otherwise.
pub const DEFAULT_DROPOUT_SEED: u64 = 0xdead_beef;

/// A configured dropout descriptor together with the device memory holding its random number
/// generator states.
///
/// The state buffer is allocated by this type and released by it, after the descriptor that
/// refers to it has been destroyed. The backend never takes ownership of it.
///
/// The probability and seed are fixed for the lifetime of the value; changing them requires
/// building a new `DropoutState`.
pub struct DropoutState<B: RnnBackend> {
    backend: Rc<B>,
    raw: B::DropoutDesc,
    states: Option<B::DropoutStates>,
    states_size: usize,
    probability: f32,
    seed: u64,
}

impl<B: RnnBackend> DropoutState<B> {
    /// Creates a dropout descriptor, allocates its generator states and seeds them.
    ///
    /// # Arguments
    ///
    ///   * `backend` - backend context the descriptor lives in.
    ///   * `probability` - probability with which a unit is zeroed during training. Must lie in
    ///     `[0, 1)`.
    ///   * `seed` - seed used to initialize the random number generator states.
    ///
    /// # Errors
    ///
    /// Returns an error if the probability is out of range, if any backend call fails or if the
    /// state buffer cannot be allocated. Whatever was acquired before the failure is released
    /// before returning.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn main() -> Result<(), cudnn_rnn::RnnError> {
    /// use cudnn_rnn::{testing::TrackingBackend, DropoutState};
    /// use std::rc::Rc;
    ///
    /// let backend = Rc::new(TrackingBackend::new());
    /// let dropout = DropoutState::new(&backend, 0.25, 42)?;
    ///
    /// assert_eq!(dropout.probability(), 0.25);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(backend: &Rc<B>, probability: f32, seed: u64) -> Result<Self, RnnError> {
        if !(0.0..1.0).contains(&probability) {
            return Err(RnnError::InvalidConfig {
                what: "dropout probability must lie in [0, 1)",
            });
        }

        let raw = backend.create_dropout_descriptor()?;

        // From here on dropping `state` releases everything acquired so far.
        let mut state = Self {
            backend: Rc::clone(backend),
            raw,
            states: None,
            states_size: 0,
            probability,
            seed,
        };

        state.states_size = backend.dropout_states_size()?;
        let states = state
            .states
            .insert(backend.alloc_dropout_states(state.states_size)?);

        backend.set_dropout_descriptor(state.raw, probability, states, seed)?;

        debug!(
            probability,
            seed,
            states_size = state.states_size,
            "configured dropout descriptor"
        );

        Ok(state)
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Size in bytes of the generator state buffer.
    pub fn states_size(&self) -> usize {
        self.states_size
    }

    pub(crate) fn raw(&self) -> B::DropoutDesc {
        self.raw
    }
}

impl<B: RnnBackend> Drop for DropoutState<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.destroy_dropout_descriptor(self.raw) {
            warn!(error = %e, "failed to destroy dropout descriptor");
        }

        if let Some(states) = self.states.take() {
            if let Err(e) = self.backend.free_dropout_states(states) {
                warn!(error = %e, "failed to free dropout generator states");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, HandleKind, TrackingBackend};

    #[test]
    fn descriptor_and_states_are_released_once() {
        let backend = Rc::new(TrackingBackend::new());

        let dropout = DropoutState::new(&backend, 0.0, DEFAULT_DROPOUT_SEED).unwrap();
        assert_eq!(backend.live(HandleKind::Dropout), 1);
        assert_eq!(backend.live(HandleKind::DropoutStates), 1);
        assert_eq!(dropout.states_size(), TrackingBackend::DROPOUT_STATES_SIZE);

        drop(dropout);
        assert_eq!(backend.live(HandleKind::Dropout), 0);
        assert_eq!(backend.live(HandleKind::DropoutStates), 0);
        assert_eq!(backend.released_twice(), 0);
    }

    #[test]
    fn descriptor_is_destroyed_before_its_states() {
        let backend = Rc::new(TrackingBackend::new());
        drop(DropoutState::new(&backend, 0.5, 7).unwrap());

        let calls = backend.calls();
        let destroy = calls
            .iter()
            .position(|c| *c == Call::DestroyDropoutDescriptor)
            .unwrap();
        let free = calls
            .iter()
            .position(|c| *c == Call::FreeDropoutStates)
            .unwrap();
        assert!(destroy < free);
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let backend = Rc::new(TrackingBackend::new());

        for p in [-0.1, 1.0, 1.5, f32::NAN] {
            let err = DropoutState::new(&backend, p, 1).err().unwrap();
            assert!(matches!(err, RnnError::InvalidConfig { .. }));
        }
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn failure_at_any_step_leaves_nothing_behind() {
        for call in [
            Call::CreateDropoutDescriptor,
            Call::DropoutStatesSize,
            Call::AllocDropoutStates,
            Call::SetDropoutDescriptor,
        ] {
            let backend = Rc::new(TrackingBackend::new());
            backend.fail_on(call, 1);

            assert!(DropoutState::new(&backend, 0.1, 3).is_err());
            assert_eq!(backend.live_total(), 0, "leak after failing {call:?}");
            assert_eq!(backend.released_twice(), 0);
        }
    }

    #[test]
    fn allocation_failure_is_reported_as_such() {
        let backend = Rc::new(TrackingBackend::new());
        backend.fail_on(Call::AllocDropoutStates, 1);

        let err = DropoutState::new(&backend, 0.1, 3).err().unwrap();
        assert_eq!(
            err,
            RnnError::DeviceAlloc {
                bytes: TrackingBackend::DROPOUT_STATES_SIZE
            }
        );
    }
}
