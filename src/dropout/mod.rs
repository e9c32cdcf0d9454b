mod dropout_state;

pub use dropout_state::*;
