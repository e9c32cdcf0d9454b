use crate::{DataType, Precision, RnnError, RnnGeometry};
use std::fmt::Debug;

/// A raw device address, as handed out by the matrix storage that owns the memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null device address. Backends treat it as "no buffer".
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Dense, contiguous device storage of `T` elements.
///
/// This is the view the recurrent layer needs of the matrix type used by the rest of the
/// training pipeline: where the data starts and how many elements are there.
pub trait GpuMatrix<T: DataType> {
    /// Device address of the first element.
    fn device_ptr(&self) -> DevicePtr;

    /// Number of `T` elements in the buffer.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the buffer in bytes, saturating at `usize::MAX`.
    fn byte_len(&self) -> usize {
        self.len()
            .checked_mul(T::PRECISION.size_in_bytes())
            .unwrap_or(usize::MAX)
    }
}

/// A device buffer passed to a compute entry point together with its usable size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpan {
    pub ptr: DevicePtr,
    pub bytes: usize,
}

impl DeviceSpan {
    pub fn of<T: DataType>(matrix: &impl GpuMatrix<T>) -> Self {
        Self {
            ptr: matrix.device_ptr(),
            bytes: matrix.byte_len(),
        }
    }
}

/// Arguments of a training forward pass.
///
/// `h_desc` describes the initial and final hidden and cell states; the executor always passes
/// null data for them, so the initial state is zero and the final state is not written back.
pub struct ForwardTraining<'a, B: RnnBackend + ?Sized> {
    pub rnn: B::RnnDesc,
    pub x_desc: &'a [B::TensorDesc],
    pub x: DevicePtr,
    pub h_desc: B::TensorDesc,
    pub w_desc: B::FilterDesc,
    pub w: DevicePtr,
    pub y_desc: &'a [B::TensorDesc],
    pub y: DevicePtr,
    pub workspace: DeviceSpan,
    pub reserve: DeviceSpan,
}

/// Arguments of the backward pass computing input gradients.
pub struct BackwardData<'a, B: RnnBackend + ?Sized> {
    pub rnn: B::RnnDesc,
    pub y_desc: &'a [B::TensorDesc],
    pub y: DevicePtr,
    pub dy: DevicePtr,
    pub h_desc: B::TensorDesc,
    pub w_desc: B::FilterDesc,
    pub w: DevicePtr,
    pub dx_desc: &'a [B::TensorDesc],
    pub dx: DevicePtr,
    pub workspace: DeviceSpan,
    pub reserve: DeviceSpan,
}

/// Arguments of the backward pass accumulating weight gradients.
pub struct BackwardWeights<'a, B: RnnBackend + ?Sized> {
    pub rnn: B::RnnDesc,
    pub x_desc: &'a [B::TensorDesc],
    pub x: DevicePtr,
    pub h_desc: B::TensorDesc,
    pub y_desc: &'a [B::TensorDesc],
    pub y: DevicePtr,
    pub workspace: DeviceSpan,
    pub dw_desc: B::FilterDesc,
    pub dw: DevicePtr,
    pub reserve: DeviceSpan,
}

/// The device compute library a recurrent layer is configured against.
///
/// Handles are plain copyable values; ownership of them is tracked by the descriptor types of
/// this crate, which call the matching `destroy_*` exactly once. A backend is shared through an
/// `Rc` by every component built on it and lives as long as the last of them.
///
/// Implementations must not assume any particular call order beyond what the descriptor types
/// enforce: every handle is created, then set (possibly several times), then destroyed.
pub trait RnnBackend {
    type DropoutDesc: Copy + Debug;
    type RnnDesc: Copy + Debug;
    type TensorDesc: Copy + Debug;
    type FilterDesc: Copy + Debug;
    /// Owned device memory backing the dropout random number generator states.
    type DropoutStates;

    fn create_dropout_descriptor(&self) -> Result<Self::DropoutDesc, RnnError>;

    fn destroy_dropout_descriptor(&self, desc: Self::DropoutDesc) -> Result<(), RnnError>;

    /// Bytes required to store the dropout random number generator states.
    fn dropout_states_size(&self) -> Result<usize, RnnError>;

    fn alloc_dropout_states(&self, bytes: usize) -> Result<Self::DropoutStates, RnnError>;

    fn free_dropout_states(&self, states: Self::DropoutStates) -> Result<(), RnnError>;

    /// Configures `desc` and seeds the generator states stored in `states`.
    fn set_dropout_descriptor(
        &self,
        desc: Self::DropoutDesc,
        probability: f32,
        states: &mut Self::DropoutStates,
        seed: u64,
    ) -> Result<(), RnnError>;

    fn create_rnn_descriptor(&self) -> Result<Self::RnnDesc, RnnError>;

    fn destroy_rnn_descriptor(&self, desc: Self::RnnDesc) -> Result<(), RnnError>;

    /// Applies the complete network geometry to `desc`.
    fn set_rnn_descriptor(
        &self,
        desc: Self::RnnDesc,
        geometry: &RnnGeometry,
        dropout: Self::DropoutDesc,
    ) -> Result<(), RnnError>;

    fn create_tensor_descriptor(&self) -> Result<Self::TensorDesc, RnnError>;

    fn destroy_tensor_descriptor(&self, desc: Self::TensorDesc) -> Result<(), RnnError>;

    fn set_tensor_descriptor(
        &self,
        desc: Self::TensorDesc,
        precision: Precision,
        dims: &[usize; 3],
        strides: &[usize; 3],
    ) -> Result<(), RnnError>;

    fn create_filter_descriptor(&self) -> Result<Self::FilterDesc, RnnError>;

    fn destroy_filter_descriptor(&self, desc: Self::FilterDesc) -> Result<(), RnnError>;

    fn set_filter_descriptor(
        &self,
        desc: Self::FilterDesc,
        precision: Precision,
        dims: &[usize; 3],
    ) -> Result<(), RnnError>;

    /// Bytes required by the parameter buffer of `rnn` when fed steps shaped like `x_desc`.
    fn rnn_params_size(
        &self,
        rnn: Self::RnnDesc,
        x_desc: Self::TensorDesc,
        precision: Precision,
    ) -> Result<usize, RnnError>;

    /// Bytes of scratch memory a forward or backward pass over `x_desc` needs.
    fn rnn_workspace_size(
        &self,
        rnn: Self::RnnDesc,
        x_desc: &[Self::TensorDesc],
    ) -> Result<usize, RnnError>;

    /// Bytes of memory the forward pass must leave behind for the backward passes.
    fn rnn_training_reserve_size(
        &self,
        rnn: Self::RnnDesc,
        x_desc: &[Self::TensorDesc],
    ) -> Result<usize, RnnError>;

    fn rnn_forward_training(&self, args: &ForwardTraining<'_, Self>) -> Result<(), RnnError>;

    fn rnn_backward_data(&self, args: &BackwardData<'_, Self>) -> Result<(), RnnError>;

    fn rnn_backward_weights(&self, args: &BackwardWeights<'_, Self>) -> Result<(), RnnError>;
}
