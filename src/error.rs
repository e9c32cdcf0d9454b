use crate::{ExecutorState, PhaseCall, TensorShape};
use std::{error::Error, fmt::Display};

/// Enum encapsulating the non-success statuses a cuDNN call can report.
///
/// cuDNN [docs](https://docs.nvidia.com/deeplearning/cudnn/api/index.html#cudnnStatus_t)
/// may offer additional information about the APi behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CudnnError {
    /// The cuDNN library was not initialized properly.
    ///
    /// This error is usually returned when creating the backend context failed, which in turn is
    /// usually due to an error in the CUDA Runtime API or in the hardware setup.
    NotInitialized,
    /// Resource allocation failed inside the cuDNN library. This is usually caused by an internal
    /// `cudaMalloc()` failure.
    AllocFailed,
    /// An incorrect value or parameter was passed to the function.
    BadParam,
    /// An internal cuDNN operation failed.
    InternalError,
    InvalidValue,
    /// The function requires a feature absent from the current GPU device.
    ArchMismatch,
    /// An access to GPU memory space failed.
    MappingError,
    /// The GPU program failed to execute. This is usually caused by a failure to launch some
    /// cuDNN kernel on the GPU.
    ExecutionFailed,
    /// The functionality requested is not presently supported by cuDNN.
    NotSupported,
    LicenseError,
    /// A runtime library required by cuDNN cannot be found in the predefined search paths.
    RuntimePrerequisiteMissing,
    /// Some tasks in the user stream are not completed.
    RuntimeInProgress,
    /// Numerical overflow occurred during the GPU kernel execution.
    RuntimeFpOverflow,
    VersionMismatch,
}

impl CudnnError {
    fn as_str(&self) -> &'static str {
        match self {
            CudnnError::NotInitialized => "CUDNN_STATUS_NOT_INITIALIZED",
            CudnnError::AllocFailed => "CUDNN_STATUS_ALLOC_FAILED",
            CudnnError::BadParam => "CUDNN_STATUS_BAD_PARAM",
            CudnnError::InternalError => "CUDNN_STATUS_INTERNAL_ERROR",
            CudnnError::InvalidValue => "CUDNN_STATUS_INVALID_VALUE",
            CudnnError::ArchMismatch => "CUDNN_STATUS_ARCH_MISMATCH",
            CudnnError::MappingError => "CUDNN_STATUS_MAPPING_ERROR",
            CudnnError::ExecutionFailed => "CUDNN_STATUS_EXECUTION_FAILED",
            CudnnError::NotSupported => "CUDNN_STATUS_NOT_SUPPORTED",
            CudnnError::LicenseError => "CUDNN_STATUS_LICENSE_ERROR",
            CudnnError::RuntimePrerequisiteMissing => "CUDNN_STATUS_RUNTIME_PREREQUISITE_MISSING",
            CudnnError::RuntimeInProgress => "CUDNN_STATUS_RUNTIME_IN_PROGRESS",
            CudnnError::RuntimeFpOverflow => "CUDNN_STATUS_RUNTIME_FP_OVERFLOW",
            CudnnError::VersionMismatch => "CUDNN_STATUS_VERSION_MISMATCH",
        }
    }
}

impl Display for CudnnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error for CudnnError {}

/// Names the caller-supplied buffer a size check was performed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Weights,
    WeightGradients,
    Input,
    InputGradients,
    Output,
    OutputGradients,
    Workspace,
    Reserve,
}

impl Display for BufferRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BufferRole::Weights => "weights",
            BufferRole::WeightGradients => "weight gradients",
            BufferRole::Input => "input",
            BufferRole::InputGradients => "input gradients",
            BufferRole::Output => "output",
            BufferRole::OutputGradients => "output gradients",
            BufferRole::Workspace => "workspace",
            BufferRole::Reserve => "reserve",
        })
    }
}

/// Every way a recurrent layer operation can fail.
///
/// Errors fall into three groups: a backend call reported a non-success status
/// ([`RnnError::Cudnn`]), device memory could not be obtained ([`RnnError::DeviceAlloc`]), or the
/// caller broke a precondition, see [`RnnError::is_precondition`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum RnnError {
    /// A descriptor, sizing or kernel call reported a failure.
    Cudnn(CudnnError),
    /// The dropout random state buffer could not be allocated.
    DeviceAlloc { bytes: usize },
    /// The dropout random state buffer could not be freed. The memory is leaked.
    DeviceRelease { bytes: usize },
    /// A caller-supplied buffer is smaller than what the layout or the sizing query requires.
    /// Both sizes are expressed in elements.
    BufferTooSmall {
        buffer: BufferRole,
        required: usize,
        provided: usize,
    },
    /// A shape passed to a phase does not agree with the layer geometry.
    ShapeMismatch {
        expected: TensorShape,
        found: TensorShape,
    },
    /// A construction parameter is out of range.
    InvalidConfig { what: &'static str },
    /// A phase was invoked while the executor was in a state that does not permit it.
    OutOfOrder {
        call: PhaseCall,
        state: ExecutorState,
    },
}

impl RnnError {
    /// Returns `true` if the error was caused by misuse rather than by the device or the library.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RnnError::BufferTooSmall { .. }
                | RnnError::ShapeMismatch { .. }
                | RnnError::InvalidConfig { .. }
                | RnnError::OutOfOrder { .. }
        )
    }
}

impl Display for RnnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RnnError::Cudnn(e) => write!(f, "cuDNN call failed: {e}"),
            RnnError::DeviceAlloc { bytes } => {
                write!(f, "failed to allocate {bytes} bytes of device memory")
            }
            RnnError::DeviceRelease { bytes } => {
                write!(f, "failed to free {bytes} bytes of device memory")
            }
            RnnError::BufferTooSmall {
                buffer,
                required,
                provided,
            } => write!(
                f,
                "RNN needs {required} {buffer} elements, but {provided} were allocated"
            ),
            RnnError::ShapeMismatch { expected, found } => {
                write!(f, "expected a tensor of shape {expected}, found {found}")
            }
            RnnError::InvalidConfig { what } => write!(f, "invalid RNN configuration: {what}"),
            RnnError::OutOfOrder { call, state } => {
                write!(f, "{call} cannot be called while the executor is {state}")
            }
        }
    }
}

impl Error for RnnError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RnnError::Cudnn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CudnnError> for RnnError {
    fn from(e: CudnnError) -> Self {
        RnnError::Cudnn(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_classification() {
        assert!(!RnnError::Cudnn(CudnnError::BadParam).is_precondition());
        assert!(!RnnError::DeviceAlloc { bytes: 16 }.is_precondition());
        assert!(RnnError::InvalidConfig { what: "x" }.is_precondition());
        assert!(RnnError::OutOfOrder {
            call: PhaseCall::BackwardData,
            state: ExecutorState::Configured,
        }
        .is_precondition());
    }

    #[test]
    fn weights_message_names_both_counts() {
        let err = RnnError::BufferTooSmall {
            buffer: BufferRole::Weights,
            required: 120,
            provided: 100,
        };
        assert_eq!(
            err.to_string(),
            "RNN needs 120 weights elements, but 100 were allocated"
        );
    }

    #[test]
    fn backend_status_is_the_source() {
        let err = RnnError::from(CudnnError::ExecutionFailed);
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("CUDNN_STATUS_EXECUTION_FAILED"));
    }
}
