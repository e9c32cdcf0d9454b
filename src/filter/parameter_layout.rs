use crate::{RnnBackend, RnnDescriptor, RnnError, TensorDescriptor};
use std::rc::Rc;
use tracing::{debug, warn};

/// A flat, one dimensional filter description of the buffer holding every weight matrix and bias
/// of a recurrent network.
///
/// How the weights are arranged inside the buffer is up to the backend; this type only knows how
/// many elements the buffer must hold.
pub struct ParameterLayout<B: RnnBackend> {
    backend: Rc<B>,
    raw: B::FilterDesc,
    size: usize,
    size_in_bytes: usize,
}

impl<B: RnnBackend> ParameterLayout<B> {
    /// Queries the parameter size of `rnn` for steps shaped like `x_desc` and creates a
    /// `size × 1 × 1` filter descriptor over it.
    ///
    /// The backend reports the size in bytes; it is converted to the smallest element count of
    /// the descriptor's precision that covers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the size query or the descriptor setup fails. The filter descriptor is
    /// destroyed again before the error is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn main() -> Result<(), cudnn_rnn::RnnError> {
    /// use cudnn_rnn::{
    ///     testing::TrackingBackend, DropoutState, ParameterLayout, Precision, RnnConfig,
    ///     RnnDescriptor, TensorDescriptor,
    /// };
    /// use std::rc::Rc;
    ///
    /// let backend = Rc::new(TrackingBackend::new());
    /// let dropout = DropoutState::new(&backend, 0.0, 0)?;
    /// let rnn = RnnDescriptor::new(&backend, &RnnConfig::new(64, 2), 10, Precision::Single, dropout)?;
    /// let x_step = TensorDescriptor::new(&backend, Precision::Single, [8, 32, 1])?;
    ///
    /// let layout = ParameterLayout::new(&backend, &rnn, &x_step)?;
    ///
    /// assert!(layout.size() * 4 >= layout.size_in_bytes());
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        backend: &Rc<B>,
        rnn: &RnnDescriptor<B>,
        x_desc: &TensorDescriptor<B>,
    ) -> Result<Self, RnnError> {
        let precision = rnn.precision();

        let raw = backend.create_filter_descriptor()?;
        let mut layout = Self {
            backend: Rc::clone(backend),
            raw,
            size: 0,
            size_in_bytes: 0,
        };

        layout.size_in_bytes = backend.rnn_params_size(rnn.raw(), x_desc.raw(), precision)?;
        layout.size = precision.elements_for_bytes(layout.size_in_bytes);

        backend.set_filter_descriptor(layout.raw, precision, &[layout.size, 1, 1])?;

        debug!(
            elements = layout.size,
            bytes = layout.size_in_bytes,
            "built parameter layout"
        );

        Ok(layout)
    }

    /// Number of elements the parameter buffer must hold.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Parameter size as reported by the backend, in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub(crate) fn raw(&self) -> B::FilterDesc {
        self.raw
    }
}

impl<B: RnnBackend> Drop for ParameterLayout<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.destroy_filter_descriptor(self.raw) {
            warn!(error = %e, "failed to destroy filter descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{Call, HandleKind, TrackingBackend},
        DropoutState, Precision, RnnConfig, RnnMode,
    };

    fn layout_for(
        backend: &Rc<TrackingBackend>,
        precision: Precision,
        config: RnnConfig,
    ) -> Result<ParameterLayout<TrackingBackend>, RnnError> {
        let dropout = DropoutState::new(backend, 0.0, 0)?;
        let rnn = RnnDescriptor::new(backend, &config, 10, precision, dropout)?;
        let x_step = TensorDescriptor::new(backend, precision, [8, 32, 1])?;
        ParameterLayout::new(backend, &rnn, &x_step)
    }

    #[test]
    fn element_count_is_the_minimal_cover() {
        for precision in [Precision::Half, Precision::Single, Precision::Double] {
            for mode in [RnnMode::RnnTanh, RnnMode::RnnReLu, RnnMode::Lstm, RnnMode::Gru] {
                let backend = Rc::new(TrackingBackend::new());
                let config = RnnConfig::new(64, 2).cell_mode(mode);
                let layout = layout_for(&backend, precision, config).unwrap();

                let elem = precision.size_in_bytes();
                let bytes = layout.size_in_bytes();
                assert!(layout.size() * elem >= bytes);
                assert!(layout.size() * elem < bytes + elem);
            }
        }
    }

    #[test]
    fn filter_is_one_dimensional() {
        let backend = Rc::new(TrackingBackend::new());
        let layout = layout_for(&backend, Precision::Single, RnnConfig::new(16, 1)).unwrap();

        let dims = backend.filter_dims(layout.raw()).unwrap();
        assert_eq!(dims, [layout.size(), 1, 1]);
    }

    #[test]
    fn construction_is_all_or_nothing() {
        for call in [
            Call::CreateFilterDescriptor,
            Call::RnnParamsSize,
            Call::SetFilterDescriptor,
        ] {
            let backend = Rc::new(TrackingBackend::new());
            backend.fail_on(call, 1);

            assert!(layout_for(&backend, Precision::Single, RnnConfig::new(16, 1)).is_err());
            assert_eq!(backend.live(HandleKind::Filter), 0, "leak after failing {call:?}");
            assert_eq!(backend.live_total(), 0);
            assert_eq!(backend.released_twice(), 0);
        }
    }
}
