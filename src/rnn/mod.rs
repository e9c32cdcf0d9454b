mod rnn_config;
mod rnn_descriptor;
mod rnn_direction_mode;
mod rnn_input_mode;
mod rnn_mode;

pub use rnn_config::*;
pub use rnn_descriptor::*;
pub use rnn_direction_mode::*;
pub use rnn_input_mode::*;
pub use rnn_mode::*;
