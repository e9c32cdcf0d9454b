//! Descriptor lifecycle and training-pass orchestration for recurrent layers executed by cuDNN.
//!
//! The crate owns every opaque handle a recurrent layer needs (dropout, network shape, parameter
//! layout and the per-step tensor descriptors), sizes the caller's workspace and reserve buffers
//! and drives the forward, backward-data and backward-weights passes in the only order the
//! library accepts.
//!
//! All device work goes through an [`RnnBackend`]. With the `cudnn` feature enabled,
//! [`CudnnBackend`] calls into the real library; [`testing::TrackingBackend`] is a host-only
//! backend that records every handle it hands out.
//!
//! ```
//! # fn main() -> Result<(), cudnn_rnn::RnnError> {
//! use cudnn_rnn::{testing::{HostMatrix, TrackingBackend}, RnnConfig, RnnExecutor, RnnMode, TensorShape};
//! use std::rc::Rc;
//!
//! let backend = Rc::new(TrackingBackend::new());
//! let shape_x = TensorShape::new(32, 8, 10);
//! let config = RnnConfig::new(64, 2).cell_mode(RnnMode::Lstm);
//!
//! let mut rnn = RnnExecutor::<f32, _>::new(&backend, shape_x, config)?;
//! let sizes = rnn.temp_space_sizes()?;
//!
//! let w = HostMatrix::<f32>::zeros(rnn.parameter_count());
//! let x = HostMatrix::<f32>::zeros(shape_x.len());
//! let shape_y = rnn.output_shape(shape_x);
//! let mut y = HostMatrix::<f32>::zeros(shape_y.len());
//! let mut reserve = HostMatrix::<f32>::zeros(sizes.reserve_len());
//! let mut workspace = HostMatrix::<f32>::zeros(sizes.workspace_len());
//!
//! rnn.forward(&w, &x, shape_x, &mut y, shape_y, &mut reserve, &mut workspace)?;
//! # Ok(())
//! # }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

mod backend;
mod data_type;
mod dropout;
mod error;
mod executor;
mod filter;
mod rnn;
mod shape;
mod tensor;

pub mod testing;

#[cfg(feature = "cudnn")]
mod cudnn;

pub use backend::*;
pub use data_type::*;
pub use dropout::*;
pub use error::*;
pub use executor::*;
pub use filter::*;
pub use rnn::*;
pub use shape::*;
pub use tensor::*;

#[cfg(feature = "cudnn")]
pub use cudnn::*;

pub(crate) mod private {
    pub trait Sealed {}
}
