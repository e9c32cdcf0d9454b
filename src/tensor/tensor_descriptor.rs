use crate::{Precision, RnnBackend, RnnError, RnnGeometry};
use std::rc::Rc;
use tracing::warn;

/// A fully packed, three dimensional tensor description.
pub struct TensorDescriptor<B: RnnBackend> {
    backend: Rc<B>,
    raw: B::TensorDesc,
    dims: [usize; 3],
}

impl<B: RnnBackend> TensorDescriptor<B> {
    /// Creates a tensor descriptor with the given shape and packed strides, the last dimension
    /// being contiguous.
    ///
    /// # Errors
    ///
    /// Returns an error if a dimension is zero or if the backend rejects the shape. The
    /// descriptor is destroyed again before the error is returned.
    pub fn new(backend: &Rc<B>, precision: Precision, dims: [usize; 3]) -> Result<Self, RnnError> {
        if dims.contains(&0) {
            return Err(RnnError::InvalidConfig {
                what: "tensor dimensions must be at least 1",
            });
        }

        let strides = [dims[1] * dims[2], dims[2], 1];

        let raw = backend.create_tensor_descriptor()?;
        let desc = Self {
            backend: Rc::clone(backend),
            raw,
            dims,
        };
        backend.set_tensor_descriptor(desc.raw, precision, &dims, &strides)?;

        Ok(desc)
    }

    /// Describes the initial and final hidden (and cell) states of a network: one
    /// `batch × hidden` matrix per layer and direction.
    pub fn hidden_state(
        backend: &Rc<B>,
        geometry: &RnnGeometry,
        batch: usize,
    ) -> Result<Self, RnnError> {
        let dims = [
            geometry.num_layers * geometry.direction.directions(),
            batch,
            geometry.hidden_size,
        ];
        Self::new(backend, geometry.precision, dims)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub(crate) fn raw(&self) -> B::TensorDesc {
        self.raw
    }
}

impl<B: RnnBackend> Drop for TensorDescriptor<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.destroy_tensor_descriptor(self.raw) {
            warn!(error = %e, "failed to destroy tensor descriptor");
        }
    }
}
