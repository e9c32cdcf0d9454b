//! A host-only backend for exercising descriptor lifecycles without a GPU.
//!
//! [`TrackingBackend`] hands out integer handles, remembers what every live handle was configured
//! with and records every call in order. Its size queries follow fixed formulas of the network
//! geometry, so that code sizing its buffers from them behaves as it would against cuDNN. Any call
//! can be made to fail with [`TrackingBackend::fail_on`].
//!
//! [`HostMatrix`] is a host buffer with a made-up device address that can stand in for device
//! storage wherever a [`GpuMatrix`] is expected. Nothing is ever read from or written to it.

use crate::{
    BackwardData, BackwardWeights, CudnnError, DataType, DevicePtr, DeviceSpan, ForwardTraining,
    GpuMatrix, Precision, RnnBackend, RnnError, RnnGeometry, RnnInputMode,
};
use std::{
    cell::RefCell,
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// A handle given out by [`TrackingBackend`]. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

/// The kinds of resources a [`TrackingBackend`] keeps track of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Dropout,
    DropoutStates,
    Rnn,
    Tensor,
    Filter,
}

/// One entry per [`RnnBackend`] method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    CreateDropoutDescriptor,
    DestroyDropoutDescriptor,
    DropoutStatesSize,
    AllocDropoutStates,
    FreeDropoutStates,
    SetDropoutDescriptor,
    CreateRnnDescriptor,
    DestroyRnnDescriptor,
    SetRnnDescriptor,
    CreateTensorDescriptor,
    DestroyTensorDescriptor,
    SetTensorDescriptor,
    CreateFilterDescriptor,
    DestroyFilterDescriptor,
    SetFilterDescriptor,
    RnnParamsSize,
    RnnWorkspaceSize,
    RnnTrainingReserveSize,
    RnnForwardTraining,
    RnnBackwardData,
    RnnBackwardWeights,
}

impl Call {
    /// Returns `true` for the calls that create, configure or release a resource.
    pub fn is_descriptor_call(self) -> bool {
        !matches!(
            self,
            Call::DropoutStatesSize
                | Call::RnnParamsSize
                | Call::RnnWorkspaceSize
                | Call::RnnTrainingReserveSize
                | Call::RnnForwardTraining
                | Call::RnnBackwardData
                | Call::RnnBackwardWeights
        )
    }

    fn is_release(self) -> bool {
        matches!(
            self,
            Call::DestroyDropoutDescriptor
                | Call::FreeDropoutStates
                | Call::DestroyRnnDescriptor
                | Call::DestroyTensorDescriptor
                | Call::DestroyFilterDescriptor
        )
    }
}

/// Dropout generator state memory handed out by [`TrackingBackend`].
#[derive(Debug, PartialEq, Eq)]
pub struct DropoutStates {
    handle: Handle,
    bytes: usize,
}

impl DropoutStates {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[derive(Debug, Clone, Copy)]
struct TensorLayout {
    dims: [usize; 3],
    strides: [usize; 3],
    precision: Precision,
}

#[derive(Debug, Default)]
struct Ledger {
    next_handle: u64,
    live: HashMap<Handle, HandleKind>,
    released_twice: usize,
    calls: Vec<Call>,
    armed: HashMap<Call, usize>,
    dropouts: HashMap<Handle, (f32, u64)>,
    rnns: HashMap<Handle, RnnGeometry>,
    tensors: HashMap<Handle, TensorLayout>,
    filters: HashMap<Handle, [usize; 3]>,
    last_reserve: Option<DevicePtr>,
}

/// A backend that runs nothing and remembers everything.
///
/// The size formulas, in bytes of the network's precision:
///
///   * parameters: `directions × gates × hidden × (in + hidden + 2)` elements per layer, where
///     `in` is the input size for the first layer (zero with [`RnnInputMode::SkipInput`]) and
///     `hidden × directions` for the others, plus [`PARAMS_PADDING`](Self::PARAMS_PADDING) bytes.
///   * workspace: `seq × batch × hidden × directions × layers × gates` elements plus
///     [`WORKSPACE_BASE`](Self::WORKSPACE_BASE) bytes.
///   * reserve: `seq × batch × hidden × directions × layers × (gates + 1)` elements.
///
/// Compute calls check that every descriptor is live and consistent with the RNN descriptor,
/// that the data pointers are not null and that the workspace and reserve are large enough.
/// Both backward passes also require the reserve of the latest forward pass.
///
/// Releasing a handle that is not live is counted by
/// [`released_twice`](TrackingBackend::released_twice) and reported as an error.
#[derive(Debug, Default)]
pub struct TrackingBackend {
    ledger: RefCell<Ledger>,
}

impl TrackingBackend {
    /// Bytes of dropout generator state the backend asks for.
    pub const DROPOUT_STATES_SIZE: usize = 4096;
    /// Added to the parameter size so that it is never a whole number of elements.
    pub const PARAMS_PADDING: usize = 1;
    pub const WORKSPACE_BASE: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live resources of the given kind.
    pub fn live(&self, kind: HandleKind) -> usize {
        self.ledger
            .borrow()
            .live
            .values()
            .filter(|k| **k == kind)
            .count()
    }

    /// Number of live resources of every kind.
    pub fn live_total(&self) -> usize {
        self.ledger.borrow().live.len()
    }

    /// Number of attempts to release a resource that was not live.
    pub fn released_twice(&self) -> usize {
        self.ledger.borrow().released_twice
    }

    /// Every call made so far, in order, including the ones that failed.
    pub fn calls(&self) -> Vec<Call> {
        self.ledger.borrow().calls.clone()
    }

    /// Number of times `call` was made.
    pub fn count(&self, call: Call) -> usize {
        self.ledger
            .borrow()
            .calls
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    /// Makes the `nth` occurrence of `call` from now on fail, counting from 1.
    ///
    /// Release calls cannot be made to fail.
    pub fn fail_on(&self, call: Call, nth: usize) {
        self.ledger.borrow_mut().armed.insert(call, nth.max(1));
    }

    /// The geometry last applied to an RNN descriptor.
    pub fn rnn_geometry(&self, desc: Handle) -> Option<RnnGeometry> {
        self.ledger.borrow().rnns.get(&desc).copied()
    }

    /// The dims and strides last applied to a tensor descriptor.
    pub fn tensor_layout(&self, desc: Handle) -> Option<([usize; 3], [usize; 3])> {
        self.ledger
            .borrow()
            .tensors
            .get(&desc)
            .map(|t| (t.dims, t.strides))
    }

    /// The dims last applied to a filter descriptor.
    pub fn filter_dims(&self, desc: Handle) -> Option<[usize; 3]> {
        self.ledger.borrow().filters.get(&desc).copied()
    }

    /// The probability and seed last applied to a dropout descriptor.
    pub fn dropout_config(&self, desc: Handle) -> Option<(f32, u64)> {
        self.ledger.borrow().dropouts.get(&desc).copied()
    }

    /// Records `call` and reports an injected failure.
    fn record(&self, call: Call) -> Result<(), RnnError> {
        let mut ledger = self.ledger.borrow_mut();
        ledger.calls.push(call);

        if call.is_release() {
            return Ok(());
        }
        if let Some(remaining) = ledger.armed.get_mut(&call) {
            *remaining -= 1;
            if *remaining == 0 {
                ledger.armed.remove(&call);
                return Err(RnnError::Cudnn(CudnnError::InternalError));
            }
        }
        Ok(())
    }

    fn create(&self, call: Call, kind: HandleKind) -> Result<Handle, RnnError> {
        self.record(call)?;

        let mut ledger = self.ledger.borrow_mut();
        ledger.next_handle += 1;
        let handle = Handle(ledger.next_handle);
        ledger.live.insert(handle, kind);
        Ok(handle)
    }

    fn release(&self, call: Call, kind: HandleKind, handle: Handle) -> Result<(), RnnError> {
        self.record(call)?;

        let mut ledger = self.ledger.borrow_mut();
        if ledger.live.get(&handle) != Some(&kind) {
            ledger.released_twice += 1;
            return Err(RnnError::Cudnn(CudnnError::BadParam));
        }
        ledger.live.remove(&handle);
        match kind {
            HandleKind::Dropout => {
                ledger.dropouts.remove(&handle);
            }
            HandleKind::Rnn => {
                ledger.rnns.remove(&handle);
            }
            HandleKind::Tensor => {
                ledger.tensors.remove(&handle);
            }
            HandleKind::Filter => {
                ledger.filters.remove(&handle);
            }
            HandleKind::DropoutStates => {}
        }
        Ok(())
    }

    fn check_live(&self, kind: HandleKind, handle: Handle) -> Result<(), RnnError> {
        match self.ledger.borrow().live.get(&handle) {
            Some(k) if *k == kind => Ok(()),
            _ => Err(RnnError::Cudnn(CudnnError::BadParam)),
        }
    }

    fn geometry(&self, rnn: Handle) -> Result<RnnGeometry, RnnError> {
        self.rnn_geometry(rnn)
            .ok_or(RnnError::Cudnn(CudnnError::BadParam))
    }

    fn layout(&self, desc: Handle) -> Result<TensorLayout, RnnError> {
        self.ledger
            .borrow()
            .tensors
            .get(&desc)
            .copied()
            .ok_or(RnnError::Cudnn(CudnnError::BadParam))
    }

    /// Checks that `steps` describe one `batch × width` slab per time step of `geometry` and
    /// returns the batch.
    fn check_steps(
        &self,
        geometry: &RnnGeometry,
        steps: &[Handle],
        width: Option<usize>,
    ) -> Result<usize, RnnError> {
        let first = steps
            .first()
            .ok_or(RnnError::Cudnn(CudnnError::BadParam))?;
        let first = self.layout(*first)?;

        if steps.len() != geometry.seq_length || first.precision != geometry.precision {
            return Err(RnnError::Cudnn(CudnnError::BadParam));
        }
        if width.is_some_and(|w| w != first.dims[1]) {
            return Err(RnnError::Cudnn(CudnnError::BadParam));
        }
        for step in steps {
            if self.layout(*step)?.dims != first.dims {
                return Err(RnnError::Cudnn(CudnnError::BadParam));
            }
        }

        Ok(first.dims[0])
    }

    fn per_step_elements(geometry: &RnnGeometry, batch: usize) -> usize {
        geometry.seq_length
            * batch
            * geometry.hidden_size
            * geometry.direction.directions()
            * geometry.num_layers
    }

    fn workspace_bytes(geometry: &RnnGeometry, batch: usize) -> usize {
        Self::per_step_elements(geometry, batch)
            * geometry.cell_mode.gate_count()
            * geometry.precision.size_in_bytes()
            + Self::WORKSPACE_BASE
    }

    fn reserve_bytes(geometry: &RnnGeometry, batch: usize) -> usize {
        Self::per_step_elements(geometry, batch)
            * (geometry.cell_mode.gate_count() + 1)
            * geometry.precision.size_in_bytes()
    }

    /// Common checks of the three compute calls.
    #[allow(clippy::too_many_arguments)]
    fn check_pass(
        &self,
        rnn: Handle,
        x_desc: &[Handle],
        y_desc: &[Handle],
        h_desc: Handle,
        w_desc: Handle,
        data: &[DevicePtr],
        workspace: DeviceSpan,
        reserve: DeviceSpan,
    ) -> Result<(), RnnError> {
        let bad = RnnError::Cudnn(CudnnError::BadParam);

        let geometry = self.geometry(rnn)?;
        self.check_live(HandleKind::Tensor, h_desc)?;
        self.check_live(HandleKind::Filter, w_desc)?;

        let batch = self.check_steps(&geometry, x_desc, None)?;
        let width = geometry.hidden_size * geometry.direction.directions();
        if self.check_steps(&geometry, y_desc, Some(width))? != batch {
            return Err(bad);
        }

        if data.iter().any(|ptr| ptr.is_null()) || workspace.ptr.is_null() || reserve.ptr.is_null()
        {
            return Err(bad);
        }
        if workspace.bytes < Self::workspace_bytes(&geometry, batch)
            || reserve.bytes < Self::reserve_bytes(&geometry, batch)
        {
            return Err(bad);
        }
        Ok(())
    }

    fn check_reserve(&self, reserve: DeviceSpan) -> Result<(), RnnError> {
        if self.ledger.borrow().last_reserve != Some(reserve.ptr) {
            return Err(RnnError::Cudnn(CudnnError::BadParam));
        }
        Ok(())
    }
}

impl RnnBackend for TrackingBackend {
    type DropoutDesc = Handle;
    type RnnDesc = Handle;
    type TensorDesc = Handle;
    type FilterDesc = Handle;
    type DropoutStates = DropoutStates;

    fn create_dropout_descriptor(&self) -> Result<Handle, RnnError> {
        self.create(Call::CreateDropoutDescriptor, HandleKind::Dropout)
    }

    fn destroy_dropout_descriptor(&self, desc: Handle) -> Result<(), RnnError> {
        self.release(Call::DestroyDropoutDescriptor, HandleKind::Dropout, desc)
    }

    fn dropout_states_size(&self) -> Result<usize, RnnError> {
        self.record(Call::DropoutStatesSize)?;
        Ok(Self::DROPOUT_STATES_SIZE)
    }

    fn alloc_dropout_states(&self, bytes: usize) -> Result<DropoutStates, RnnError> {
        if self.record(Call::AllocDropoutStates).is_err() {
            return Err(RnnError::DeviceAlloc { bytes });
        }

        let mut ledger = self.ledger.borrow_mut();
        ledger.next_handle += 1;
        let handle = Handle(ledger.next_handle);
        ledger.live.insert(handle, HandleKind::DropoutStates);
        Ok(DropoutStates { handle, bytes })
    }

    fn free_dropout_states(&self, states: DropoutStates) -> Result<(), RnnError> {
        self.release(
            Call::FreeDropoutStates,
            HandleKind::DropoutStates,
            states.handle,
        )
    }

    fn set_dropout_descriptor(
        &self,
        desc: Handle,
        probability: f32,
        states: &mut DropoutStates,
        seed: u64,
    ) -> Result<(), RnnError> {
        self.record(Call::SetDropoutDescriptor)?;
        self.check_live(HandleKind::Dropout, desc)?;
        self.check_live(HandleKind::DropoutStates, states.handle)?;
        if states.bytes < Self::DROPOUT_STATES_SIZE {
            return Err(RnnError::Cudnn(CudnnError::BadParam));
        }

        self.ledger
            .borrow_mut()
            .dropouts
            .insert(desc, (probability, seed));
        Ok(())
    }

    fn create_rnn_descriptor(&self) -> Result<Handle, RnnError> {
        self.create(Call::CreateRnnDescriptor, HandleKind::Rnn)
    }

    fn destroy_rnn_descriptor(&self, desc: Handle) -> Result<(), RnnError> {
        self.release(Call::DestroyRnnDescriptor, HandleKind::Rnn, desc)
    }

    fn set_rnn_descriptor(
        &self,
        desc: Handle,
        geometry: &RnnGeometry,
        dropout: Handle,
    ) -> Result<(), RnnError> {
        self.record(Call::SetRnnDescriptor)?;
        self.check_live(HandleKind::Rnn, desc)?;
        if self.dropout_config(dropout).is_none() {
            return Err(RnnError::Cudnn(CudnnError::BadParam));
        }

        self.ledger.borrow_mut().rnns.insert(desc, *geometry);
        Ok(())
    }

    fn create_tensor_descriptor(&self) -> Result<Handle, RnnError> {
        self.create(Call::CreateTensorDescriptor, HandleKind::Tensor)
    }

    fn destroy_tensor_descriptor(&self, desc: Handle) -> Result<(), RnnError> {
        self.release(Call::DestroyTensorDescriptor, HandleKind::Tensor, desc)
    }

    fn set_tensor_descriptor(
        &self,
        desc: Handle,
        precision: Precision,
        dims: &[usize; 3],
        strides: &[usize; 3],
    ) -> Result<(), RnnError> {
        self.record(Call::SetTensorDescriptor)?;
        self.check_live(HandleKind::Tensor, desc)?;

        self.ledger.borrow_mut().tensors.insert(
            desc,
            TensorLayout {
                dims: *dims,
                strides: *strides,
                precision,
            },
        );
        Ok(())
    }

    fn create_filter_descriptor(&self) -> Result<Handle, RnnError> {
        self.create(Call::CreateFilterDescriptor, HandleKind::Filter)
    }

    fn destroy_filter_descriptor(&self, desc: Handle) -> Result<(), RnnError> {
        self.release(Call::DestroyFilterDescriptor, HandleKind::Filter, desc)
    }

    fn set_filter_descriptor(
        &self,
        desc: Handle,
        _precision: Precision,
        dims: &[usize; 3],
    ) -> Result<(), RnnError> {
        self.record(Call::SetFilterDescriptor)?;
        self.check_live(HandleKind::Filter, desc)?;

        self.ledger.borrow_mut().filters.insert(desc, *dims);
        Ok(())
    }

    fn rnn_params_size(
        &self,
        rnn: Handle,
        x_desc: Handle,
        precision: Precision,
    ) -> Result<usize, RnnError> {
        self.record(Call::RnnParamsSize)?;
        let geometry = self.geometry(rnn)?;
        let input_size = self.layout(x_desc)?.dims[1];

        let hidden = geometry.hidden_size;
        let directions = geometry.direction.directions();
        let gates = geometry.cell_mode.gate_count();

        let elements: usize = (0..geometry.num_layers)
            .map(|layer| {
                let input_width = match (layer, geometry.input_mode) {
                    (0, RnnInputMode::LinearInput) => input_size,
                    (0, RnnInputMode::SkipInput) => 0,
                    _ => hidden * directions,
                };
                directions * gates * hidden * (input_width + hidden + 2)
            })
            .sum();

        Ok(elements * precision.size_in_bytes() + Self::PARAMS_PADDING)
    }

    fn rnn_workspace_size(&self, rnn: Handle, x_desc: &[Handle]) -> Result<usize, RnnError> {
        self.record(Call::RnnWorkspaceSize)?;
        let geometry = self.geometry(rnn)?;
        let batch = self.check_steps(&geometry, x_desc, None)?;
        Ok(Self::workspace_bytes(&geometry, batch))
    }

    fn rnn_training_reserve_size(
        &self,
        rnn: Handle,
        x_desc: &[Handle],
    ) -> Result<usize, RnnError> {
        self.record(Call::RnnTrainingReserveSize)?;
        let geometry = self.geometry(rnn)?;
        let batch = self.check_steps(&geometry, x_desc, None)?;
        Ok(Self::reserve_bytes(&geometry, batch))
    }

    fn rnn_forward_training(&self, args: &ForwardTraining<'_, Self>) -> Result<(), RnnError> {
        self.record(Call::RnnForwardTraining)?;
        self.check_pass(
            args.rnn,
            args.x_desc,
            args.y_desc,
            args.h_desc,
            args.w_desc,
            &[args.x, args.w, args.y],
            args.workspace,
            args.reserve,
        )?;

        self.ledger.borrow_mut().last_reserve = Some(args.reserve.ptr);
        Ok(())
    }

    fn rnn_backward_data(&self, args: &BackwardData<'_, Self>) -> Result<(), RnnError> {
        self.record(Call::RnnBackwardData)?;
        self.check_pass(
            args.rnn,
            args.dx_desc,
            args.y_desc,
            args.h_desc,
            args.w_desc,
            &[args.y, args.dy, args.w, args.dx],
            args.workspace,
            args.reserve,
        )?;
        self.check_reserve(args.reserve)
    }

    fn rnn_backward_weights(&self, args: &BackwardWeights<'_, Self>) -> Result<(), RnnError> {
        self.record(Call::RnnBackwardWeights)?;
        self.check_pass(
            args.rnn,
            args.x_desc,
            args.y_desc,
            args.h_desc,
            args.dw_desc,
            &[args.x, args.y, args.dw],
            args.workspace,
            args.reserve,
        )?;
        self.check_reserve(args.reserve)
    }
}

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(0x7f00_0000_0000);

/// A host buffer posing as device storage.
///
/// Every matrix gets its own address range, so that buffers can be told apart by their
/// [`device_ptr`](GpuMatrix::device_ptr).
#[derive(Debug)]
pub struct HostMatrix<T> {
    data: Vec<T>,
    address: DevicePtr,
}

impl<T: DataType + Default> HostMatrix<T> {
    pub fn zeros(len: usize) -> Self {
        let bytes = (len * T::PRECISION.size_in_bytes()).max(1) as u64;
        let address = NEXT_ADDRESS.fetch_add(bytes.next_multiple_of(256), Ordering::Relaxed);

        Self {
            data: vec![T::default(); len],
            address: DevicePtr::from_raw(address),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T: DataType> GpuMatrix<T> for HostMatrix<T> {
    fn device_ptr(&self) -> DevicePtr {
        self.address
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
