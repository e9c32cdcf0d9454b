mod step_descriptors;
mod tensor_descriptor;

pub use step_descriptors::*;
pub use tensor_descriptor::*;
