mod parameter_layout;

pub use parameter_layout::*;
