use crate::{Precision, RnnBackend, RnnError, TensorDescriptor};
use std::rc::Rc;
use tracing::debug;

/// One tensor descriptor per time step of a sequence, each describing a `batch × width` slab.
///
/// The same type describes the input side (width = input size) and the output side (width =
/// hidden size times the number of directions) of a recurrent layer. All steps share the same
/// shape.
pub struct StepDescriptorSet<B: RnnBackend> {
    backend: Rc<B>,
    precision: Precision,
    steps: Vec<TensorDescriptor<B>>,
    raw: Vec<B::TensorDesc>,
    width: usize,
    batch: usize,
}

impl<B: RnnBackend> StepDescriptorSet<B> {
    /// Builds `seq_length` step descriptors of shape `(batch, width, 1)`.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn main() -> Result<(), cudnn_rnn::RnnError> {
    /// use cudnn_rnn::{testing::TrackingBackend, Precision, StepDescriptorSet};
    /// use std::rc::Rc;
    ///
    /// let backend = Rc::new(TrackingBackend::new());
    ///
    /// let mut steps = StepDescriptorSet::new(&backend, Precision::Single, 32, 8, 10)?;
    /// steps.rebuild(32, 4, 20)?;
    ///
    /// assert_eq!(steps.len(), 20);
    /// assert_eq!(steps.batch(), 4);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        backend: &Rc<B>,
        precision: Precision,
        width: usize,
        batch: usize,
        seq_length: usize,
    ) -> Result<Self, RnnError> {
        let mut set = Self {
            backend: Rc::clone(backend),
            precision,
            steps: Vec::new(),
            raw: Vec::new(),
            width: 0,
            batch: 0,
        };
        set.rebuild(width, batch, seq_length)?;
        Ok(set)
    }

    /// Replaces every step descriptor with `seq_length` fresh ones of shape `(batch, width, 1)`.
    ///
    /// The new set is built completely before the old descriptors are released. If building
    /// fails, the descriptors created so far are released and the old set is left untouched.
    pub fn rebuild(
        &mut self,
        width: usize,
        batch: usize,
        seq_length: usize,
    ) -> Result<(), RnnError> {
        if seq_length == 0 {
            return Err(RnnError::InvalidConfig {
                what: "sequence length must be at least 1",
            });
        }

        let steps = (0..seq_length)
            .map(|_| TensorDescriptor::new(&self.backend, self.precision, [batch, width, 1]))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            width,
            batch,
            seq_length,
            replaced = self.steps.len(),
            "rebuilt step descriptors"
        );

        self.raw = steps.iter().map(TensorDescriptor::raw).collect();
        self.steps = steps;
        self.width = width;
        self.batch = batch;

        Ok(())
    }

    /// Number of steps, i.e. the sequence length the set was built for.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// The raw handles in step order, ready to be handed to the backend.
    pub fn as_raw(&self) -> &[B::TensorDesc] {
        &self.raw
    }

    /// Descriptor of the first step; every step has the same shape.
    pub(crate) fn first(&self) -> Option<&TensorDescriptor<B>> {
        self.steps.first()
    }
}
