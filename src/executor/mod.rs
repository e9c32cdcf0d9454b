mod rebuild;
mod state;

pub use rebuild::*;
pub use state::{ExecutorState, PhaseCall};

use crate::{
    BackwardData, BackwardWeights, BufferRole, DataType, DeviceSpan, DropoutState, ForwardTraining,
    GpuMatrix, ParameterLayout, Precision, RnnBackend, RnnConfig, RnnDescriptor, RnnError,
    StepDescriptorSet, TensorDescriptor, TensorShape,
};
use state::Phase;
use std::{fmt::Display, marker::PhantomData, rc::Rc};
use tracing::{debug, trace};

/// Scratch and reserve memory a training iteration needs, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempSpaceSizes {
    pub(crate) workspace_bytes: usize,
    pub(crate) reserve_bytes: usize,
    pub(crate) precision: Precision,
}

impl TempSpaceSizes {
    /// Bytes of scratch memory every pass needs. The content does not survive between passes.
    pub fn workspace_bytes(&self) -> usize {
        self.workspace_bytes
    }

    /// Bytes of memory the forward pass fills and both backward passes read.
    pub fn reserve_bytes(&self) -> usize {
        self.reserve_bytes
    }

    /// Workspace size in elements of the executor's precision, rounded up.
    pub fn workspace_len(&self) -> usize {
        self.precision.elements_for_bytes(self.workspace_bytes)
    }

    /// Reserve size in elements of the executor's precision, rounded up.
    pub fn reserve_len(&self) -> usize {
        self.precision.elements_for_bytes(self.reserve_bytes)
    }
}

impl Display for TempSpaceSizes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "workspace {} B, reserve {} B",
            self.workspace_bytes, self.reserve_bytes
        )
    }
}

/// Runs the training passes of one recurrent layer.
///
/// The executor owns every descriptor the layer needs and keeps them in sync with the shape of the
/// data it is fed: a call with a different input shape than the previous one rebuilds the
/// affected descriptors before running. The caller owns every data buffer, including the workspace
/// and the reserve, and sizes them with [`parameter_count`](RnnExecutor::parameter_count) and
/// [`temp_space_sizes`](RnnExecutor::temp_space_sizes).
///
/// A training iteration is [`forward`](RnnExecutor::forward), then
/// [`backward_data`](RnnExecutor::backward_data), then
/// [`backward_weights`](RnnExecutor::backward_weights), all with the same reserve buffer. The
/// backward passes consume what the forward pass left in the reserve, so calling them in any other
/// order is rejected with [`RnnError::OutOfOrder`].
pub struct RnnExecutor<T: DataType, B: RnnBackend> {
    // Field order is release order: everything built on the RNN descriptor goes first.
    layout: ParameterLayout<B>,
    x_steps: StepDescriptorSet<B>,
    y_steps: StepDescriptorSet<B>,
    hidden: TensorDescriptor<B>,
    rnn: RnnDescriptor<B>,
    backend: Rc<B>,
    input_size: usize,
    mini_batch_size: usize,
    phase: Phase,
    descriptors_valid: bool,
    data_type: PhantomData<T>,
}

impl<T: DataType, B: RnnBackend> RnnExecutor<T, B> {
    /// Builds every descriptor of a recurrent layer fed with input of shape `shape_x`.
    ///
    /// # Arguments
    ///
    ///   * `backend` - backend context the layer runs in.
    ///   * `shape_x` - `[input_size, mini_batch, seq_length]`, the shape of the first input.
    ///   * `config` - cell type, depth, width, recurrence pattern and dropout of the layer.
    ///
    /// # Errors
    ///
    /// Returns [`RnnError::InvalidConfig`] if a size is zero or the dropout probability is out of
    /// range, and the backend error if a descriptor cannot be built. Everything built before the
    /// failure is released.
    pub fn new(backend: &Rc<B>, shape_x: TensorShape, config: RnnConfig) -> Result<Self, RnnError> {
        config.validate()?;
        check_input_shape(shape_x)?;

        let precision = T::PRECISION;
        let (features, batch, seq_length) =
            (shape_x.features(), shape_x.batch(), shape_x.seq_length());

        let dropout = DropoutState::new(backend, config.dropout, config.seed)?;
        let rnn = RnnDescriptor::new(backend, &config, seq_length, precision, dropout)?;
        let x_steps = StepDescriptorSet::new(backend, precision, features, batch, seq_length)?;
        let y_steps =
            StepDescriptorSet::new(backend, precision, rnn.output_width(), batch, seq_length)?;
        let hidden = TensorDescriptor::hidden_state(backend, rnn.geometry(), batch)?;
        let layout = ParameterLayout::new(backend, &rnn, first_step(&x_steps)?)?;

        debug!(
            shape = %shape_x,
            hidden_size = config.hidden_size,
            num_layers = config.num_layers,
            cell_mode = ?config.cell_mode,
            parameters = layout.size(),
            "built RNN executor"
        );

        Ok(Self {
            layout,
            x_steps,
            y_steps,
            hidden,
            rnn,
            backend: Rc::clone(backend),
            input_size: features,
            mini_batch_size: batch,
            phase: Phase::Configured,
            descriptors_valid: true,
            data_type: PhantomData,
        })
    }

    /// Number of elements the weight buffer, and the weight gradient buffer, must hold.
    ///
    /// The count is that of the shape the descriptors were last built for.
    pub fn parameter_count(&self) -> usize {
        self.layout.size()
    }

    /// Width of one output step: the hidden size times the number of directions.
    pub fn output_width(&self) -> usize {
        self.rnn.output_width()
    }

    /// The shape of the output produced for an input of shape `shape_x`.
    pub fn output_shape(&self, shape_x: TensorShape) -> TensorShape {
        TensorShape::new(self.output_width(), shape_x.batch(), shape_x.seq_length())
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn mini_batch_size(&self) -> usize {
        self.mini_batch_size
    }

    /// The sequence length the RNN descriptor is configured with.
    pub fn seq_length(&self) -> usize {
        self.rnn.length()
    }

    pub fn state(&self) -> ExecutorState {
        self.phase.state()
    }

    pub fn descriptor(&self) -> &RnnDescriptor<B> {
        &self.rnn
    }

    pub fn parameter_layout(&self) -> &ParameterLayout<B> {
        &self.layout
    }

    /// Per-step descriptors of the input, as last built.
    pub fn input_steps(&self) -> &StepDescriptorSet<B> {
        &self.x_steps
    }

    /// Per-step descriptors of the output, as last built.
    pub fn output_steps(&self) -> &StepDescriptorSet<B> {
        &self.y_steps
    }

    /// Changes the sequence length of the RNN descriptor.
    ///
    /// The step descriptors follow on the next call to
    /// [`temp_space_sizes`](RnnExecutor::temp_space_sizes), or on the next
    /// [`forward`](RnnExecutor::forward) with an input of the new length. Any pending backward
    /// pass is invalidated, unless the length is rejected.
    pub fn set_length(&mut self, seq_length: usize) -> Result<(), RnnError> {
        self.rnn.resize(seq_length)?;
        self.phase = Phase::Configured;
        debug!(seq_length, "set RNN sequence length");
        Ok(())
    }

    /// Queries the workspace and reserve sizes for the current shape at the current sequence
    /// length, rebuilding the step descriptors first if the length was changed with
    /// [`set_length`](RnnExecutor::set_length).
    ///
    /// Asking twice without changing anything returns the same sizes.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn main() -> Result<(), cudnn_rnn::RnnError> {
    /// use cudnn_rnn::{testing::TrackingBackend, RnnConfig, RnnExecutor, TensorShape};
    /// use std::rc::Rc;
    ///
    /// let backend = Rc::new(TrackingBackend::new());
    /// let mut rnn = RnnExecutor::<f32, _>::new(&backend, TensorShape::new(32, 8, 10), RnnConfig::new(64, 2))?;
    ///
    /// let short = rnn.temp_space_sizes()?;
    /// rnn.set_length(40)?;
    /// let long = rnn.temp_space_sizes()?;
    ///
    /// assert!(long.workspace_bytes() >= short.workspace_bytes());
    /// assert_eq!(rnn.input_steps().len(), 40);
    /// # Ok(())
    /// # }
    /// ```
    pub fn temp_space_sizes(&mut self) -> Result<TempSpaceSizes, RnnError> {
        let requested = self.cached_shape().with_seq_length(self.rnn.length());
        self.reconcile(requested)?;
        self.query_sizes()
    }

    /// Runs the training forward pass: `output_y = rnn(weights, input_x)`.
    ///
    /// The initial hidden and cell states are zero and the final ones are not returned. The
    /// reserve buffer is filled with what the backward passes need; it must not be touched until
    /// [`backward_weights`](RnnExecutor::backward_weights) returns.
    ///
    /// A forward pass is accepted in every state and starts a new iteration. If `shape_x` differs
    /// from the shape of the previous call, the descriptors are rebuilt first.
    ///
    /// # Errors
    ///
    /// Returns [`RnnError::ShapeMismatch`] if `shape_y` is not the output shape of `shape_x`,
    /// [`RnnError::InvalidConfig`] if either shape has more elements than fit in `usize`,
    /// [`RnnError::BufferTooSmall`] if a buffer cannot hold what the layer reads or writes, and the
    /// backend error if a rebuild or the pass itself fails. The executor is left
    /// [`Configured`](ExecutorState::Configured) on every error.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &mut self,
        weights: &impl GpuMatrix<T>,
        input_x: &impl GpuMatrix<T>,
        shape_x: TensorShape,
        output_y: &mut impl GpuMatrix<T>,
        shape_y: TensorShape,
        reserve: &mut impl GpuMatrix<T>,
        workspace: &mut impl GpuMatrix<T>,
    ) -> Result<(), RnnError> {
        self.phase = Phase::Configured;

        let expected_y = self.output_shape(shape_x);
        if shape_y != expected_y {
            return Err(RnnError::ShapeMismatch {
                expected: expected_y,
                found: shape_y,
            });
        }

        let len_x = element_count(shape_x)?;
        let len_y = element_count(shape_y)?;

        self.reconcile(shape_x)?;

        check_len(BufferRole::Weights, self.layout.size(), weights.len())?;
        check_len(BufferRole::Input, len_x, input_x.len())?;
        check_len(BufferRole::Output, len_y, output_y.len())?;

        let sizes = self.query_sizes()?;
        check_len(BufferRole::Workspace, sizes.workspace_len(), workspace.len())?;
        check_len(BufferRole::Reserve, sizes.reserve_len(), reserve.len())?;

        self.backend.rnn_forward_training(&ForwardTraining {
            rnn: self.rnn.raw(),
            x_desc: self.x_steps.as_raw(),
            x: input_x.device_ptr(),
            h_desc: self.hidden.raw(),
            w_desc: self.layout.raw(),
            w: weights.device_ptr(),
            y_desc: self.y_steps.as_raw(),
            y: output_y.device_ptr(),
            workspace: DeviceSpan::of(workspace),
            reserve: DeviceSpan::of(reserve),
        })?;

        self.complete(PhaseCall::Forward, sizes);
        Ok(())
    }

    /// Computes `dx`, the gradient of the loss with respect to the input of the last forward pass,
    /// from the output gradient `output_dy`.
    ///
    /// `output_y`, `weights` and `reserve` must be the buffers the forward pass used.
    ///
    /// # Errors
    ///
    /// Returns [`RnnError::OutOfOrder`] unless the previous phase was a successful
    /// [`forward`](RnnExecutor::forward), [`RnnError::BufferTooSmall`] if a buffer is smaller than
    /// the forward pass required, and the backend error if the pass fails. On any error but the
    /// first, the executor is left [`Configured`](ExecutorState::Configured).
    pub fn backward_data(
        &mut self,
        output_y: &impl GpuMatrix<T>,
        output_dy: &impl GpuMatrix<T>,
        weights: &impl GpuMatrix<T>,
        dx: &mut impl GpuMatrix<T>,
        reserve: &mut impl GpuMatrix<T>,
        workspace: &mut impl GpuMatrix<T>,
    ) -> Result<(), RnnError> {
        let sizes = self.phase.admit_backward(PhaseCall::BackwardData)?;
        let result = self.run_backward_data(
            sizes, output_y, output_dy, weights, dx, reserve, workspace,
        );
        self.finish(PhaseCall::BackwardData, sizes, result)
    }

    /// Accumulates the gradient of the loss with respect to the weights into `dw`.
    ///
    /// `dw` is added to, not overwritten; clear it before the first iteration that should start
    /// from zero. `input_x`, `output_y` and `reserve` must be the buffers the forward pass used.
    ///
    /// # Errors
    ///
    /// Returns [`RnnError::OutOfOrder`] unless the previous phase was a successful
    /// [`backward_data`](RnnExecutor::backward_data), [`RnnError::BufferTooSmall`] if a buffer is
    /// smaller than the forward pass required, and the backend error if the pass fails. On any
    /// error but the first, the executor is left [`Configured`](ExecutorState::Configured).
    pub fn backward_weights(
        &mut self,
        input_x: &impl GpuMatrix<T>,
        output_y: &impl GpuMatrix<T>,
        dw: &mut impl GpuMatrix<T>,
        reserve: &mut impl GpuMatrix<T>,
        workspace: &mut impl GpuMatrix<T>,
    ) -> Result<(), RnnError> {
        let sizes = self.phase.admit_backward(PhaseCall::BackwardWeights)?;
        let result = self.run_backward_weights(sizes, input_x, output_y, dw, reserve, workspace);
        self.finish(PhaseCall::BackwardWeights, sizes, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_backward_data(
        &self,
        sizes: TempSpaceSizes,
        output_y: &impl GpuMatrix<T>,
        output_dy: &impl GpuMatrix<T>,
        weights: &impl GpuMatrix<T>,
        dx: &mut impl GpuMatrix<T>,
        reserve: &mut impl GpuMatrix<T>,
        workspace: &mut impl GpuMatrix<T>,
    ) -> Result<(), RnnError> {
        let shape_x = self.cached_shape();
        let shape_y = self.output_shape(shape_x);

        let len_x = element_count(shape_x)?;
        let len_y = element_count(shape_y)?;

        check_len(BufferRole::Output, len_y, output_y.len())?;
        check_len(BufferRole::OutputGradients, len_y, output_dy.len())?;
        check_len(BufferRole::Weights, self.layout.size(), weights.len())?;
        check_len(BufferRole::InputGradients, len_x, dx.len())?;
        check_len(BufferRole::Workspace, sizes.workspace_len(), workspace.len())?;
        check_len(BufferRole::Reserve, sizes.reserve_len(), reserve.len())?;

        self.backend.rnn_backward_data(&BackwardData {
            rnn: self.rnn.raw(),
            y_desc: self.y_steps.as_raw(),
            y: output_y.device_ptr(),
            dy: output_dy.device_ptr(),
            h_desc: self.hidden.raw(),
            w_desc: self.layout.raw(),
            w: weights.device_ptr(),
            dx_desc: self.x_steps.as_raw(),
            dx: dx.device_ptr(),
            workspace: DeviceSpan::of(workspace),
            reserve: DeviceSpan::of(reserve),
        })
    }

    fn run_backward_weights(
        &self,
        sizes: TempSpaceSizes,
        input_x: &impl GpuMatrix<T>,
        output_y: &impl GpuMatrix<T>,
        dw: &mut impl GpuMatrix<T>,
        reserve: &mut impl GpuMatrix<T>,
        workspace: &mut impl GpuMatrix<T>,
    ) -> Result<(), RnnError> {
        let shape_x = self.cached_shape();
        let shape_y = self.output_shape(shape_x);

        let len_x = element_count(shape_x)?;
        let len_y = element_count(shape_y)?;

        check_len(BufferRole::Input, len_x, input_x.len())?;
        check_len(BufferRole::Output, len_y, output_y.len())?;
        check_len(BufferRole::WeightGradients, self.layout.size(), dw.len())?;
        check_len(BufferRole::Workspace, sizes.workspace_len(), workspace.len())?;
        check_len(BufferRole::Reserve, sizes.reserve_len(), reserve.len())?;

        self.backend.rnn_backward_weights(&BackwardWeights {
            rnn: self.rnn.raw(),
            x_desc: self.x_steps.as_raw(),
            x: input_x.device_ptr(),
            h_desc: self.hidden.raw(),
            y_desc: self.y_steps.as_raw(),
            y: output_y.device_ptr(),
            workspace: DeviceSpan::of(workspace),
            dw_desc: self.layout.raw(),
            dw: dw.device_ptr(),
            reserve: DeviceSpan::of(reserve),
        })
    }

    /// The input shape the step descriptors describe.
    fn cached_shape(&self) -> TensorShape {
        TensorShape::new(self.input_size, self.mini_batch_size, self.x_steps.len())
    }

    /// Brings every descriptor in line with `requested`.
    fn reconcile(&mut self, requested: TensorShape) -> Result<(), RnnError> {
        let plan = RebuildPlan::between(
            self.cached_shape(),
            requested,
            self.rnn.length(),
            self.descriptors_valid,
        );
        if !plan.is_needed() {
            return Ok(());
        }

        check_input_shape(requested)?;
        debug!(
            from = %self.cached_shape(),
            to = %requested,
            resize = plan.resize_descriptor,
            rebuild = plan.rebuild_descriptors,
            "reconfiguring RNN executor"
        );

        self.phase = Phase::Configured;

        if plan.resize_descriptor {
            if let Err(e) = self.rnn.resize(requested.seq_length()) {
                self.descriptors_valid = false;
                return Err(e);
            }
        }

        if plan.rebuild_descriptors {
            let (features, batch, seq_length) = (
                requested.features(),
                requested.batch(),
                requested.seq_length(),
            );

            self.descriptors_valid = false;

            self.x_steps.rebuild(features, batch, seq_length)?;
            self.y_steps
                .rebuild(self.rnn.output_width(), batch, seq_length)?;
            self.hidden =
                TensorDescriptor::hidden_state(&self.backend, self.rnn.geometry(), batch)?;
            self.layout =
                ParameterLayout::new(&self.backend, &self.rnn, first_step(&self.x_steps)?)?;

            self.input_size = features;
            self.mini_batch_size = batch;
            self.descriptors_valid = true;
        }

        Ok(())
    }

    fn query_sizes(&self) -> Result<TempSpaceSizes, RnnError> {
        let x_desc = self.x_steps.as_raw();
        Ok(TempSpaceSizes {
            workspace_bytes: self.backend.rnn_workspace_size(self.rnn.raw(), x_desc)?,
            reserve_bytes: self
                .backend
                .rnn_training_reserve_size(self.rnn.raw(), x_desc)?,
            precision: T::PRECISION,
        })
    }

    fn complete(&mut self, call: PhaseCall, sizes: TempSpaceSizes) {
        self.phase = Phase::after(call, sizes);
        trace!(%call, state = %self.phase.state(), %sizes, "RNN phase complete");
    }

    fn finish(
        &mut self,
        call: PhaseCall,
        sizes: TempSpaceSizes,
        result: Result<(), RnnError>,
    ) -> Result<(), RnnError> {
        match result {
            Ok(()) => {
                self.complete(call, sizes);
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Configured;
                trace!(%call, error = %e, "RNN phase failed");
                Err(e)
            }
        }
    }
}

impl<T: DataType, B: RnnBackend> std::fmt::Debug for RnnExecutor<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RnnExecutor")
            .field("precision", &T::PRECISION)
            .field("geometry", self.rnn.geometry())
            .field("input_size", &self.input_size)
            .field("mini_batch_size", &self.mini_batch_size)
            .field("parameters", &self.layout.size())
            .field("state", &self.phase.state())
            .finish()
    }
}

fn check_input_shape(shape: TensorShape) -> Result<(), RnnError> {
    if shape.features() == 0 {
        return Err(RnnError::InvalidConfig {
            what: "input size must be at least 1",
        });
    }
    if shape.batch() == 0 {
        return Err(RnnError::InvalidConfig {
            what: "mini-batch size must be at least 1",
        });
    }
    if shape.seq_length() == 0 {
        return Err(RnnError::InvalidConfig {
            what: "sequence length must be at least 1",
        });
    }
    Ok(())
}

fn element_count(shape: TensorShape) -> Result<usize, RnnError> {
    shape.checked_len().ok_or(RnnError::InvalidConfig {
        what: "shape element count overflows usize",
    })
}

fn check_len(buffer: BufferRole, required: usize, provided: usize) -> Result<(), RnnError> {
    if provided < required {
        return Err(RnnError::BufferTooSmall {
            buffer,
            required,
            provided,
        });
    }
    Ok(())
}

fn first_step<B: RnnBackend>(
    steps: &StepDescriptorSet<B>,
) -> Result<&TensorDescriptor<B>, RnnError> {
    steps.first().ok_or(RnnError::InvalidConfig {
        what: "sequence length must be at least 1",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{Call, HandleKind, HostMatrix, TrackingBackend},
        RnnMode,
    };
    use half::f16;

    const SHAPE_X: TensorShape = TensorShape::new(32, 8, 10);
    /// Large enough for every buffer of every shape used below.
    const ROOMY: usize = 1 << 18;

    type Executor = RnnExecutor<f32, TrackingBackend>;

    fn lstm() -> RnnConfig {
        RnnConfig::new(64, 2).cell_mode(RnnMode::Lstm)
    }

    fn executor(backend: &Rc<TrackingBackend>) -> Executor {
        RnnExecutor::new(backend, SHAPE_X, lstm()).unwrap()
    }

    struct Buffers<T: DataType> {
        w: HostMatrix<T>,
        dw: HostMatrix<T>,
        x: HostMatrix<T>,
        dx: HostMatrix<T>,
        y: HostMatrix<T>,
        dy: HostMatrix<T>,
        reserve: HostMatrix<T>,
        workspace: HostMatrix<T>,
    }

    impl<T: DataType + Default> Buffers<T> {
        /// Exactly sized for the shape `rnn` was last built for.
        fn exact(rnn: &mut RnnExecutor<T, TrackingBackend>) -> Self {
            let sizes = rnn.temp_space_sizes().unwrap();
            let shape_x =
                TensorShape::new(rnn.input_size(), rnn.mini_batch_size(), rnn.seq_length());
            let shape_y = rnn.output_shape(shape_x);
            Self {
                w: HostMatrix::zeros(rnn.parameter_count()),
                dw: HostMatrix::zeros(rnn.parameter_count()),
                x: HostMatrix::zeros(shape_x.len()),
                dx: HostMatrix::zeros(shape_x.len()),
                y: HostMatrix::zeros(shape_y.len()),
                dy: HostMatrix::zeros(shape_y.len()),
                reserve: HostMatrix::zeros(sizes.reserve_len()),
                workspace: HostMatrix::zeros(sizes.workspace_len()),
            }
        }

        fn roomy() -> Self {
            Self {
                w: HostMatrix::zeros(ROOMY),
                dw: HostMatrix::zeros(ROOMY),
                x: HostMatrix::zeros(ROOMY),
                dx: HostMatrix::zeros(ROOMY),
                y: HostMatrix::zeros(ROOMY),
                dy: HostMatrix::zeros(ROOMY),
                reserve: HostMatrix::zeros(ROOMY),
                workspace: HostMatrix::zeros(ROOMY),
            }
        }

        fn forward(
            &mut self,
            rnn: &mut RnnExecutor<T, TrackingBackend>,
            shape_x: TensorShape,
        ) -> Result<(), RnnError> {
            let shape_y = rnn.output_shape(shape_x);
            rnn.forward(
                &self.w,
                &self.x,
                shape_x,
                &mut self.y,
                shape_y,
                &mut self.reserve,
                &mut self.workspace,
            )
        }

        fn backward_data(
            &mut self,
            rnn: &mut RnnExecutor<T, TrackingBackend>,
        ) -> Result<(), RnnError> {
            rnn.backward_data(
                &self.y,
                &self.dy,
                &self.w,
                &mut self.dx,
                &mut self.reserve,
                &mut self.workspace,
            )
        }

        fn backward_weights(
            &mut self,
            rnn: &mut RnnExecutor<T, TrackingBackend>,
        ) -> Result<(), RnnError> {
            rnn.backward_weights(
                &self.x,
                &self.y,
                &mut self.dw,
                &mut self.reserve,
                &mut self.workspace,
            )
        }
    }

    #[test]
    fn sizes_are_nonzero_and_stable() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);

        let first = rnn.temp_space_sizes().unwrap();
        assert!(first.workspace_bytes() > 0);
        assert!(first.reserve_bytes() > 0);
        assert!(rnn.parameter_count() > 0);

        let created = backend.count(Call::CreateTensorDescriptor);
        assert_eq!(rnn.temp_space_sizes().unwrap(), first);
        assert_eq!(backend.count(Call::CreateTensorDescriptor), created);
    }

    #[test]
    fn sizes_grow_with_sequence_length_and_batch() {
        let backend = Rc::new(TrackingBackend::new());
        let sizes_for = |shape: TensorShape| {
            let mut rnn = Executor::new(&backend, shape, lstm()).unwrap();
            rnn.temp_space_sizes().unwrap()
        };

        let by_length: Vec<_> = [1, 5, 10, 20]
            .into_iter()
            .map(|seq| sizes_for(SHAPE_X.with_seq_length(seq)))
            .collect();
        let by_batch: Vec<_> = [1, 4, 8, 16]
            .into_iter()
            .map(|batch| sizes_for(TensorShape::new(32, batch, 10)))
            .collect();

        for sizes in [by_length, by_batch] {
            for pair in sizes.windows(2) {
                assert!(pair[0].workspace_bytes() <= pair[1].workspace_bytes());
                assert!(pair[0].reserve_bytes() <= pair[1].reserve_bytes());
            }
        }
        assert_eq!(backend.live_total(), 0);
    }

    #[test]
    fn training_iteration_makes_no_descriptor_calls() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::exact(&mut rnn);

        let mark = backend.calls().len();
        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        assert_eq!(rnn.state(), ExecutorState::ForwardDone);
        buffers.backward_data(&mut rnn).unwrap();
        assert_eq!(rnn.state(), ExecutorState::BackwardDataDone);
        buffers.backward_weights(&mut rnn).unwrap();
        assert_eq!(rnn.state(), ExecutorState::BackwardWeightsDone);

        assert_eq!(
            backend.calls()[mark..],
            [
                Call::RnnWorkspaceSize,
                Call::RnnTrainingReserveSize,
                Call::RnnForwardTraining,
                Call::RnnBackwardData,
                Call::RnnBackwardWeights,
            ]
        );
    }

    #[test]
    fn iterations_can_be_repeated() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::exact(&mut rnn);

        for _ in 0..3 {
            buffers.forward(&mut rnn, SHAPE_X).unwrap();
            buffers.backward_data(&mut rnn).unwrap();
            buffers.backward_weights(&mut rnn).unwrap();
        }

        // A forward pass abandons the iteration it interrupts.
        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        buffers.backward_data(&mut rnn).unwrap();
        assert_eq!(backend.count(Call::RnnForwardTraining), 5);
    }

    #[test]
    fn backward_phases_out_of_order_are_rejected() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::exact(&mut rnn);
        let mark = backend.calls().len();

        assert_eq!(
            buffers.backward_data(&mut rnn),
            Err(RnnError::OutOfOrder {
                call: PhaseCall::BackwardData,
                state: ExecutorState::Configured,
            })
        );
        assert_eq!(
            buffers.backward_weights(&mut rnn),
            Err(RnnError::OutOfOrder {
                call: PhaseCall::BackwardWeights,
                state: ExecutorState::Configured,
            })
        );
        assert_eq!(backend.calls().len(), mark);

        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        assert!(matches!(
            buffers.backward_weights(&mut rnn),
            Err(RnnError::OutOfOrder {
                state: ExecutorState::ForwardDone,
                ..
            })
        ));
        // The rejected call did not disturb the pending iteration.
        buffers.backward_data(&mut rnn).unwrap();
        buffers.backward_weights(&mut rnn).unwrap();

        assert!(matches!(
            buffers.backward_weights(&mut rnn),
            Err(RnnError::OutOfOrder {
                state: ExecutorState::BackwardWeightsDone,
                ..
            })
        ));
    }

    #[test]
    fn set_length_takes_effect_on_the_next_size_query() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let before = rnn.temp_space_sizes().unwrap();

        rnn.set_length(20).unwrap();
        assert_eq!(rnn.seq_length(), 20);
        assert_eq!(rnn.input_steps().len(), 10);

        let after = rnn.temp_space_sizes().unwrap();
        assert_eq!(rnn.input_steps().len(), 20);
        assert_eq!(rnn.output_steps().len(), 20);
        assert!(after.workspace_bytes() > before.workspace_bytes());
        assert!(after.reserve_bytes() > before.reserve_bytes());
        // Steps on both sides plus the hidden state.
        assert_eq!(backend.live(HandleKind::Tensor), 20 + 20 + 1);
    }

    #[test]
    fn set_length_invalidates_a_pending_backward_pass() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::exact(&mut rnn);

        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        rnn.set_length(10).unwrap();

        assert_eq!(rnn.state(), ExecutorState::Configured);
        assert!(buffers.backward_data(&mut rnn).unwrap_err().is_precondition());
    }

    #[test]
    fn failed_resize_is_retried_with_a_full_rebuild() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::roomy();
        let longer = SHAPE_X.with_seq_length(20);

        backend.fail_on(Call::SetRnnDescriptor, 1);
        assert!(buffers.forward(&mut rnn, longer).is_err());
        assert_eq!(rnn.seq_length(), SHAPE_X.seq_length());
        let geometry = backend.rnn_geometry(rnn.descriptor().raw()).unwrap();
        assert_eq!(geometry.seq_length, SHAPE_X.seq_length());

        buffers.forward(&mut rnn, longer).unwrap();
        assert_eq!(rnn.seq_length(), 20);
        assert_eq!(rnn.input_steps().len(), 20);
        assert_eq!(backend.released_twice(), 0);
    }

    #[test]
    fn rejected_length_keeps_a_pending_backward_pass() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::exact(&mut rnn);

        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        assert!(rnn.set_length(0).unwrap_err().is_precondition());

        assert_eq!(rnn.state(), ExecutorState::ForwardDone);
        assert_eq!(rnn.seq_length(), SHAPE_X.seq_length());
        buffers.backward_data(&mut rnn).unwrap();
        buffers.backward_weights(&mut rnn).unwrap();
    }

    #[test]
    fn new_input_shape_rebuilds_without_leaks() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::roomy();
        let fixed = backend.live_total() - backend.live(HandleKind::Tensor);

        let shape = TensorShape::new(32, 4, 6);
        buffers.forward(&mut rnn, shape).unwrap();
        assert_eq!(rnn.seq_length(), 6);
        assert_eq!(rnn.mini_batch_size(), 4);
        assert_eq!(backend.live(HandleKind::Tensor), 6 + 6 + 1);
        assert_eq!(backend.live_total(), fixed + 13);

        let mark = backend.calls().len();
        buffers.backward_data(&mut rnn).unwrap();
        buffers.backward_weights(&mut rnn).unwrap();
        assert_eq!(backend.calls().len(), mark + 2);

        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        assert_eq!(backend.live(HandleKind::Tensor), 10 + 10 + 1);

        drop(rnn);
        assert_eq!(backend.live_total(), 0);
        assert_eq!(backend.released_twice(), 0);
    }

    #[test]
    fn wider_input_changes_the_parameter_count() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::roomy();
        let narrow = rnn.parameter_count();

        buffers.forward(&mut rnn, TensorShape::new(48, 8, 10)).unwrap();
        assert_eq!(rnn.input_size(), 48);
        assert!(rnn.parameter_count() > narrow);
        assert_eq!(backend.live(HandleKind::Filter), 1);
    }

    #[test]
    fn mismatched_output_shape_is_rejected() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut b = Buffers::<f32>::roomy();

        let wrong = TensorShape::new(32, 8, 10);
        let err = rnn
            .forward(
                &b.w,
                &b.x,
                SHAPE_X,
                &mut b.y,
                wrong,
                &mut b.reserve,
                &mut b.workspace,
            )
            .unwrap_err();

        assert_eq!(
            err,
            RnnError::ShapeMismatch {
                expected: TensorShape::new(64, 8, 10),
                found: wrong,
            }
        );
        assert_eq!(backend.count(Call::RnnForwardTraining), 0);
    }

    #[test]
    fn short_buffers_are_rejected_before_the_pass() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let count = rnn.parameter_count();

        let mut buffers = Buffers::exact(&mut rnn);
        buffers.w = HostMatrix::zeros(count - 1);
        assert_eq!(
            buffers.forward(&mut rnn, SHAPE_X),
            Err(RnnError::BufferTooSmall {
                buffer: BufferRole::Weights,
                required: count,
                provided: count - 1,
            })
        );

        let mut buffers = Buffers::exact(&mut rnn);
        let len = buffers.workspace.len();
        buffers.workspace = HostMatrix::zeros(len - 1);
        assert!(matches!(
            buffers.forward(&mut rnn, SHAPE_X),
            Err(RnnError::BufferTooSmall {
                buffer: BufferRole::Workspace,
                ..
            })
        ));

        let mut buffers = Buffers::exact(&mut rnn);
        buffers.y = HostMatrix::zeros(10);
        assert!(matches!(
            buffers.forward(&mut rnn, SHAPE_X),
            Err(RnnError::BufferTooSmall {
                buffer: BufferRole::Output,
                ..
            })
        ));

        assert_eq!(backend.count(Call::RnnForwardTraining), 0);
        assert_eq!(rnn.state(), ExecutorState::Configured);
    }

    #[test]
    fn overflowing_shape_is_rejected_before_any_call() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::roomy();
        buffers.x = HostMatrix::zeros(1);
        let calls = backend.calls().len();

        let huge = TensorShape::new(usize::MAX / 2, 4, 16);
        assert_eq!(
            buffers.forward(&mut rnn, huge),
            Err(RnnError::InvalidConfig {
                what: "shape element count overflows usize",
            })
        );

        assert_eq!(backend.calls().len(), calls);
        assert_eq!(rnn.state(), ExecutorState::Configured);
        assert_eq!(rnn.input_size(), SHAPE_X.features());
        buffers.forward(&mut rnn, SHAPE_X).unwrap();
    }

    #[test]
    fn backward_buffers_are_checked_against_the_forward_sizes() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::exact(&mut rnn);
        buffers.forward(&mut rnn, SHAPE_X).unwrap();

        let queries = backend.count(Call::RnnWorkspaceSize);
        let mut short_dx = HostMatrix::<f32>::zeros(SHAPE_X.len() - 1);
        let err = rnn
            .backward_data(
                &buffers.y,
                &buffers.dy,
                &buffers.w,
                &mut short_dx,
                &mut buffers.reserve,
                &mut buffers.workspace,
            )
            .unwrap_err();

        assert!(matches!(
            err,
            RnnError::BufferTooSmall {
                buffer: BufferRole::InputGradients,
                ..
            }
        ));
        assert_eq!(backend.count(Call::RnnWorkspaceSize), queries);
        assert_eq!(rnn.state(), ExecutorState::Configured);
    }

    #[test]
    fn failed_pass_returns_to_configured() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::exact(&mut rnn);

        backend.fail_on(Call::RnnForwardTraining, 1);
        assert!(matches!(
            buffers.forward(&mut rnn, SHAPE_X),
            Err(RnnError::Cudnn(_))
        ));
        assert_eq!(rnn.state(), ExecutorState::Configured);
        assert!(buffers.backward_data(&mut rnn).is_err());

        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        backend.fail_on(Call::RnnBackwardData, 1);
        assert!(buffers.backward_data(&mut rnn).is_err());
        assert_eq!(rnn.state(), ExecutorState::Configured);
    }

    #[test]
    fn failed_rebuild_is_retried_on_the_next_call() {
        let backend = Rc::new(TrackingBackend::new());
        let mut rnn = executor(&backend);
        let mut buffers = Buffers::roomy();

        // The input steps are rebuilt, the second output step is not.
        backend.fail_on(Call::CreateTensorDescriptor, 8);
        assert!(buffers.forward(&mut rnn, TensorShape::new(32, 4, 6)).is_err());
        assert_eq!(rnn.state(), ExecutorState::Configured);

        buffers.forward(&mut rnn, SHAPE_X).unwrap();
        assert_eq!(rnn.input_steps().len(), 10);
        assert_eq!(rnn.output_steps().len(), 10);
        assert_eq!(rnn.input_steps().batch(), 8);
        assert_eq!(backend.live(HandleKind::Tensor), 10 + 10 + 1);

        buffers.backward_data(&mut rnn).unwrap();
        buffers.backward_weights(&mut rnn).unwrap();
    }

    #[test]
    fn construction_failure_leaks_nothing() {
        let cases = [
            (Call::CreateDropoutDescriptor, 1),
            (Call::DropoutStatesSize, 1),
            (Call::AllocDropoutStates, 1),
            (Call::SetDropoutDescriptor, 1),
            (Call::CreateRnnDescriptor, 1),
            (Call::SetRnnDescriptor, 1),
            // First input step, first output step, hidden state.
            (Call::CreateTensorDescriptor, 1),
            (Call::CreateTensorDescriptor, 11),
            (Call::CreateTensorDescriptor, 21),
            (Call::SetTensorDescriptor, 21),
            (Call::CreateFilterDescriptor, 1),
            (Call::RnnParamsSize, 1),
            (Call::SetFilterDescriptor, 1),
        ];

        for (call, nth) in cases {
            let backend = Rc::new(TrackingBackend::new());
            backend.fail_on(call, nth);

            assert!(Executor::new(&backend, SHAPE_X, lstm()).is_err());
            assert_eq!(backend.count(call), nth, "{call:?} was not reached");
            assert_eq!(backend.live_total(), 0, "leak after failing {call:?} #{nth}");
            assert_eq!(backend.released_twice(), 0);
        }
    }

    #[test]
    fn invalid_configuration_never_reaches_the_backend() {
        let backend = Rc::new(TrackingBackend::new());

        for (shape, config) in [
            (SHAPE_X, RnnConfig::new(0, 2)),
            (SHAPE_X, RnnConfig::new(64, 0)),
            (SHAPE_X, lstm().dropout(1.0, 0)),
            (TensorShape::new(0, 8, 10), lstm()),
            (TensorShape::new(32, 0, 10), lstm()),
            (TensorShape::new(32, 8, 0), lstm()),
        ] {
            let err = Executor::new(&backend, shape, config).unwrap_err();
            assert!(matches!(err, RnnError::InvalidConfig { .. }));
        }
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn drop_releases_everything_once() {
        let backend = Rc::new(TrackingBackend::new());
        let rnn = executor(&backend);

        // Dropout descriptor and states, RNN, both step sets, hidden state, filter.
        assert_eq!(backend.live_total(), 1 + 1 + 1 + 10 + 10 + 1 + 1);

        drop(rnn);
        assert_eq!(backend.live_total(), 0);
        assert_eq!(backend.released_twice(), 0);
        assert_eq!(Rc::strong_count(&backend), 1);
    }

    #[test]
    fn bidirectional_half_precision_layer() {
        let backend = Rc::new(TrackingBackend::new());
        let config = RnnConfig::new(16, 3)
            .cell_mode(RnnMode::Gru)
            .bidirectional(true)
            .dropout(0.25, 42);
        let shape_x = TensorShape::new(8, 2, 5);
        let mut rnn = RnnExecutor::<f16, _>::new(&backend, shape_x, config).unwrap();

        assert_eq!(rnn.output_width(), 32);
        assert_eq!(rnn.output_shape(shape_x), TensorShape::new(32, 2, 5));
        assert_eq!(rnn.descriptor().dropout().probability(), 0.25);
        assert_eq!(rnn.descriptor().precision(), Precision::Half);

        let mut buffers = Buffers::<f16>::exact(&mut rnn);
        buffers.forward(&mut rnn, shape_x).unwrap();
        buffers.backward_data(&mut rnn).unwrap();
        buffers.backward_weights(&mut rnn).unwrap();
    }
}
