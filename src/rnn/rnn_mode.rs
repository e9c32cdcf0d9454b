/// Specifies the type of recurrent cell used in every layer of the network.
///
/// cuDNN [docs](https://docs.nvidia.com/deeplearning/cudnn/api/index.html#cudnnRNNMode_t)
/// may offer additional information about the APi behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RnnMode {
    /// A single-gate recurrent neural network with a ReLU activation function.
    RnnReLu,
    /// A single-gate recurrent neural network with a tanh activation function.
    RnnTanh,
    /// A four-gate Long Short-Term Memory (LSTM) network with no peephole connections.
    #[default]
    Lstm,
    /// A three-gate network consisting of Gated Recurrent Units.
    Gru,
}

impl RnnMode {
    /// Number of gate matrices the cell carries per input and per recurrent connection.
    pub fn gate_count(self) -> usize {
        match self {
            RnnMode::RnnReLu | RnnMode::RnnTanh => 1,
            RnnMode::Lstm => 4,
            RnnMode::Gru => 3,
        }
    }
}

#[cfg(feature = "cudnn")]
impl From<RnnMode> for cudnn_sys::cudnnRNNMode_t {
    fn from(mode: RnnMode) -> Self {
        match mode {
            RnnMode::RnnReLu => Self::CUDNN_RNN_RELU,
            RnnMode::RnnTanh => Self::CUDNN_RNN_TANH,
            RnnMode::Lstm => Self::CUDNN_LSTM,
            RnnMode::Gru => Self::CUDNN_GRU,
        }
    }
}
