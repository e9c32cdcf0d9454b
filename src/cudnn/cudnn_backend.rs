use super::IntoResult;
use crate::{
    BackwardData, BackwardWeights, DevicePtr, ForwardTraining, Precision, RnnBackend, RnnError,
    RnnGeometry,
};
use cudnn_sys as sys;
use cust::memory::DeviceBuffer;
use std::{
    ffi::c_void,
    mem::{self, MaybeUninit},
    ptr,
};
use tracing::{debug, warn};

#[cfg(cudnn9)]
compile_error!("cuDNN 9 removed the per-step RNN API this backend is built on; use cuDNN 8");

/// cuDNN library context. Every descriptor and every recurrent pass goes through it.
///
/// # Multi-thread Usage
///
/// cuDNN recommends one context per thread and so does this crate: the backend is shared through
/// an `Rc` and can not leave the thread it was created on.
///
/// # Multi-Device Usage
///
/// cuDNN contexts are tied to the current device through the current CUDA context, therefore,
/// for multi-device usage one cuDNN context must be created for every different device.
///
/// # Drop Overhead
///
/// Dropping the context synchronizes the device. Create it outside of performance critical code
/// paths and keep it around.
pub struct CudnnBackend {
    raw: sys::cudnnHandle_t,
}

impl CudnnBackend {
    /// Creates a new cuDNN context, allocating the required memory on both host and device.
    ///
    /// A CUDA context must be current on the calling thread.
    pub fn new() -> Result<Self, RnnError> {
        let mut raw = MaybeUninit::uninit();

        unsafe {
            sys::cudnnCreate(raw.as_mut_ptr()).into_result()?;
            let backend = Self {
                raw: raw.assume_init(),
            };

            let (major, minor, patch) = backend.version();
            debug!(major, minor, patch, "created cuDNN context");

            Ok(backend)
        }
    }

    /// Returns the version number of the underlying cuDNN library.
    pub fn version(&self) -> (u32, u32, u32) {
        // cudnnGetVersion does not return a state as it never fails.
        split_version(unsafe { sys::cudnnGetVersion() })
    }

    /// Returns the version of the CUDA runtime the cuDNN library was compiled against.
    pub fn cuda_version(&self) -> (u32, u32, u32) {
        split_version(unsafe { sys::cudnnGetCudartVersion() })
    }

    /// Sets the CUDA stream cuDNN kernels are launched on.
    ///
    /// If no stream is set, all kernels use the default (NULL) stream.
    ///
    /// # Errors
    ///
    /// Returns error if the supplied stream in invalid or a mismatch if found between the user
    /// stream and the cuDNN handle context.
    pub fn set_stream(&mut self, stream: &cust::stream::Stream) -> Result<(), RnnError> {
        unsafe {
            sys::cudnnSetStream(self.raw, stream.as_inner() as sys::cudaStream_t).into_result()?;
        }
        Ok(())
    }
}

impl Drop for CudnnBackend {
    fn drop(&mut self) {
        if let Err(e) = unsafe { sys::cudnnDestroy(self.raw) }.into_result() {
            warn!(error = %e, "failed to destroy cuDNN context");
        }
    }
}

impl RnnBackend for CudnnBackend {
    type DropoutDesc = sys::cudnnDropoutDescriptor_t;
    type RnnDesc = sys::cudnnRNNDescriptor_t;
    type TensorDesc = sys::cudnnTensorDescriptor_t;
    type FilterDesc = sys::cudnnFilterDescriptor_t;
    type DropoutStates = DeviceBuffer<u8>;

    fn create_dropout_descriptor(&self) -> Result<Self::DropoutDesc, RnnError> {
        let mut raw = MaybeUninit::uninit();

        unsafe {
            sys::cudnnCreateDropoutDescriptor(raw.as_mut_ptr()).into_result()?;
            Ok(raw.assume_init())
        }
    }

    fn destroy_dropout_descriptor(&self, desc: Self::DropoutDesc) -> Result<(), RnnError> {
        unsafe { sys::cudnnDestroyDropoutDescriptor(desc).into_result()? };
        Ok(())
    }

    fn dropout_states_size(&self) -> Result<usize, RnnError> {
        let mut size = MaybeUninit::uninit();

        unsafe {
            sys::cudnnDropoutGetStatesSize(self.raw, size.as_mut_ptr()).into_result()?;
            Ok(size.assume_init())
        }
    }

    fn alloc_dropout_states(&self, bytes: usize) -> Result<Self::DropoutStates, RnnError> {
        // The generator states are initialized by cudnnSetDropoutDescriptor.
        unsafe { DeviceBuffer::uninitialized(bytes) }.map_err(|e| {
            warn!(error = %e, bytes, "failed to allocate dropout states");
            RnnError::DeviceAlloc { bytes }
        })
    }

    fn free_dropout_states(&self, states: Self::DropoutStates) -> Result<(), RnnError> {
        DeviceBuffer::drop(states).map_err(|(e, states)| {
            let bytes = states.len();
            warn!(error = %e, bytes, "failed to free dropout states");
            // Dropping the buffer would try to free it again.
            mem::forget(states);
            RnnError::DeviceRelease { bytes }
        })
    }

    fn set_dropout_descriptor(
        &self,
        desc: Self::DropoutDesc,
        probability: f32,
        states: &mut Self::DropoutStates,
        seed: u64,
    ) -> Result<(), RnnError> {
        let states_ptr = device_ptr_mut(DevicePtr::from_raw(states.as_device_ptr().as_raw()));

        unsafe {
            sys::cudnnSetDropoutDescriptor(
                desc,
                self.raw,
                probability,
                states_ptr,
                states.len(),
                seed,
            )
            .into_result()?;
        }
        Ok(())
    }

    fn create_rnn_descriptor(&self) -> Result<Self::RnnDesc, RnnError> {
        let mut raw = MaybeUninit::uninit();

        unsafe {
            sys::cudnnCreateRNNDescriptor(raw.as_mut_ptr()).into_result()?;
            Ok(raw.assume_init())
        }
    }

    fn destroy_rnn_descriptor(&self, desc: Self::RnnDesc) -> Result<(), RnnError> {
        unsafe { sys::cudnnDestroyRNNDescriptor(desc).into_result()? };
        Ok(())
    }

    /// The per-step API takes the sequence length with every call, the descriptor itself does not
    /// store it.
    fn set_rnn_descriptor(
        &self,
        desc: Self::RnnDesc,
        geometry: &RnnGeometry,
        dropout: Self::DropoutDesc,
    ) -> Result<(), RnnError> {
        let hidden_size = to_c_int(geometry.hidden_size, "hidden size exceeds i32::MAX")?;
        let num_layers = to_c_int(geometry.num_layers, "layer count exceeds i32::MAX")?;

        unsafe {
            sys::cudnnSetRNNDescriptor_v6(
                self.raw,
                desc,
                hidden_size,
                num_layers,
                dropout,
                geometry.input_mode.into(),
                geometry.direction.into(),
                geometry.cell_mode.into(),
                sys::cudnnRNNAlgo_t::CUDNN_RNN_ALGO_STANDARD,
                geometry.precision.into(),
            )
            .into_result()?;
        }
        Ok(())
    }

    fn create_tensor_descriptor(&self) -> Result<Self::TensorDesc, RnnError> {
        let mut raw = MaybeUninit::uninit();

        unsafe {
            sys::cudnnCreateTensorDescriptor(raw.as_mut_ptr()).into_result()?;
            Ok(raw.assume_init())
        }
    }

    fn destroy_tensor_descriptor(&self, desc: Self::TensorDesc) -> Result<(), RnnError> {
        unsafe { sys::cudnnDestroyTensorDescriptor(desc).into_result()? };
        Ok(())
    }

    fn set_tensor_descriptor(
        &self,
        desc: Self::TensorDesc,
        precision: Precision,
        dims: &[usize; 3],
        strides: &[usize; 3],
    ) -> Result<(), RnnError> {
        let dims = to_c_dims(dims)?;
        let strides = to_c_dims(strides)?;

        unsafe {
            sys::cudnnSetTensorNdDescriptor(
                desc,
                precision.into(),
                3,
                dims.as_ptr(),
                strides.as_ptr(),
            )
            .into_result()?;
        }
        Ok(())
    }

    fn create_filter_descriptor(&self) -> Result<Self::FilterDesc, RnnError> {
        let mut raw = MaybeUninit::uninit();

        unsafe {
            sys::cudnnCreateFilterDescriptor(raw.as_mut_ptr()).into_result()?;
            Ok(raw.assume_init())
        }
    }

    fn destroy_filter_descriptor(&self, desc: Self::FilterDesc) -> Result<(), RnnError> {
        unsafe { sys::cudnnDestroyFilterDescriptor(desc).into_result()? };
        Ok(())
    }

    fn set_filter_descriptor(
        &self,
        desc: Self::FilterDesc,
        precision: Precision,
        dims: &[usize; 3],
    ) -> Result<(), RnnError> {
        let dims = to_c_dims(dims)?;

        unsafe {
            sys::cudnnSetFilterNdDescriptor(
                desc,
                precision.into(),
                sys::cudnnTensorFormat_t::CUDNN_TENSOR_NCHW,
                3,
                dims.as_ptr(),
            )
            .into_result()?;
        }
        Ok(())
    }

    fn rnn_params_size(
        &self,
        rnn: Self::RnnDesc,
        x_desc: Self::TensorDesc,
        precision: Precision,
    ) -> Result<usize, RnnError> {
        let mut size = MaybeUninit::uninit();

        unsafe {
            sys::cudnnGetRNNParamsSize(self.raw, rnn, x_desc, size.as_mut_ptr(), precision.into())
                .into_result()?;
            Ok(size.assume_init())
        }
    }

    fn rnn_workspace_size(
        &self,
        rnn: Self::RnnDesc,
        x_desc: &[Self::TensorDesc],
    ) -> Result<usize, RnnError> {
        let seq_length = seq_length(x_desc)?;
        let mut size = MaybeUninit::uninit();

        unsafe {
            sys::cudnnGetRNNWorkspaceSize(
                self.raw,
                rnn,
                seq_length,
                x_desc.as_ptr(),
                size.as_mut_ptr(),
            )
            .into_result()?;
            Ok(size.assume_init())
        }
    }

    fn rnn_training_reserve_size(
        &self,
        rnn: Self::RnnDesc,
        x_desc: &[Self::TensorDesc],
    ) -> Result<usize, RnnError> {
        let seq_length = seq_length(x_desc)?;
        let mut size = MaybeUninit::uninit();

        unsafe {
            sys::cudnnGetRNNTrainingReserveSize(
                self.raw,
                rnn,
                seq_length,
                x_desc.as_ptr(),
                size.as_mut_ptr(),
            )
            .into_result()?;
            Ok(size.assume_init())
        }
    }

    /// Initial and final hidden and cell states are passed as null: the network starts from zero
    /// and its final state is discarded.
    fn rnn_forward_training(&self, args: &ForwardTraining<'_, Self>) -> Result<(), RnnError> {
        let seq_length = seq_length(args.x_desc)?;

        unsafe {
            sys::cudnnRNNForwardTraining(
                self.raw,
                args.rnn,
                seq_length,
                args.x_desc.as_ptr(),
                device_ptr(args.x),
                args.h_desc,
                ptr::null(),
                args.h_desc,
                ptr::null(),
                args.w_desc,
                device_ptr(args.w),
                args.y_desc.as_ptr(),
                device_ptr_mut(args.y),
                args.h_desc,
                ptr::null_mut(),
                args.h_desc,
                ptr::null_mut(),
                device_ptr_mut(args.workspace.ptr),
                args.workspace.bytes,
                device_ptr_mut(args.reserve.ptr),
                args.reserve.bytes,
            )
            .into_result()?;
        }
        Ok(())
    }

    fn rnn_backward_data(&self, args: &BackwardData<'_, Self>) -> Result<(), RnnError> {
        let seq_length = seq_length(args.y_desc)?;

        unsafe {
            sys::cudnnRNNBackwardData(
                self.raw,
                args.rnn,
                seq_length,
                args.y_desc.as_ptr(),
                device_ptr(args.y),
                args.y_desc.as_ptr(),
                device_ptr(args.dy),
                args.h_desc,
                ptr::null(),
                args.h_desc,
                ptr::null(),
                args.w_desc,
                device_ptr(args.w),
                args.h_desc,
                ptr::null(),
                args.h_desc,
                ptr::null(),
                args.dx_desc.as_ptr(),
                device_ptr_mut(args.dx),
                args.h_desc,
                ptr::null_mut(),
                args.h_desc,
                ptr::null_mut(),
                device_ptr_mut(args.workspace.ptr),
                args.workspace.bytes,
                device_ptr_mut(args.reserve.ptr),
                args.reserve.bytes,
            )
            .into_result()?;
        }
        Ok(())
    }

    fn rnn_backward_weights(&self, args: &BackwardWeights<'_, Self>) -> Result<(), RnnError> {
        let seq_length = seq_length(args.x_desc)?;

        unsafe {
            sys::cudnnRNNBackwardWeights(
                self.raw,
                args.rnn,
                seq_length,
                args.x_desc.as_ptr(),
                device_ptr(args.x),
                args.h_desc,
                ptr::null(),
                args.y_desc.as_ptr(),
                device_ptr(args.y),
                device_ptr(args.workspace.ptr),
                args.workspace.bytes,
                args.dw_desc,
                device_ptr_mut(args.dw),
                device_ptr(args.reserve.ptr),
                args.reserve.bytes,
            )
            .into_result()?;
        }
        Ok(())
    }
}

fn split_version(version: usize) -> (u32, u32, u32) {
    (
        (version / 1000) as u32,
        ((version % 1000) / 100) as u32,
        (version % 100) as u32,
    )
}

fn to_c_int(value: usize, what: &'static str) -> Result<i32, RnnError> {
    i32::try_from(value).map_err(|_| RnnError::InvalidConfig { what })
}

fn to_c_dims(values: &[usize; 3]) -> Result<[i32; 3], RnnError> {
    let [a, b, c] = *values;
    let what = "tensor dimension exceeds i32::MAX";
    Ok([to_c_int(a, what)?, to_c_int(b, what)?, to_c_int(c, what)?])
}

fn seq_length<D>(steps: &[D]) -> Result<i32, RnnError> {
    to_c_int(steps.len(), "sequence length exceeds i32::MAX")
}

fn device_ptr(ptr: DevicePtr) -> *const c_void {
    ptr.as_raw() as usize as *const c_void
}

fn device_ptr_mut(ptr: DevicePtr) -> *mut c_void {
    ptr.as_raw() as usize as *mut c_void
}
