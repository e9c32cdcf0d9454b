//! The cuDNN backend.

mod cudnn_backend;
mod device_buffer;
mod status;

pub use cudnn_backend::*;

pub(crate) use status::IntoResult;
