use crate::CudnnError;

pub(crate) trait IntoResult {
    fn into_result(self) -> Result<(), CudnnError>;
}

impl IntoResult for cudnn_sys::cudnnStatus_t {
    /// Converts the raw status into a result.
    fn into_result(self) -> Result<(), CudnnError> {
        use cudnn_sys::cudnnStatus_t::*;

        Err(match self {
            CUDNN_STATUS_SUCCESS => return Ok(()),
            CUDNN_STATUS_NOT_INITIALIZED => CudnnError::NotInitialized,
            CUDNN_STATUS_ALLOC_FAILED => CudnnError::AllocFailed,
            CUDNN_STATUS_BAD_PARAM => CudnnError::BadParam,
            CUDNN_STATUS_INTERNAL_ERROR => CudnnError::InternalError,
            CUDNN_STATUS_INVALID_VALUE => CudnnError::InvalidValue,
            CUDNN_STATUS_ARCH_MISMATCH => CudnnError::ArchMismatch,
            CUDNN_STATUS_MAPPING_ERROR => CudnnError::MappingError,
            CUDNN_STATUS_EXECUTION_FAILED => CudnnError::ExecutionFailed,
            CUDNN_STATUS_NOT_SUPPORTED => CudnnError::NotSupported,
            CUDNN_STATUS_LICENSE_ERROR => CudnnError::LicenseError,
            CUDNN_STATUS_RUNTIME_PREREQUISITE_MISSING => CudnnError::RuntimePrerequisiteMissing,
            CUDNN_STATUS_RUNTIME_IN_PROGRESS => CudnnError::RuntimeInProgress,
            CUDNN_STATUS_RUNTIME_FP_OVERFLOW => CudnnError::RuntimeFpOverflow,
            CUDNN_STATUS_VERSION_MISMATCH => CudnnError::VersionMismatch,
        })
    }
}
