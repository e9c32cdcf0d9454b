/// Specifies the recurrence pattern for a recurrent neural network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RnnDirectionMode {
    /// The network iterates recurrently from the first input to the last.
    #[default]
    Unidirectional,
    /// Each layer of the network iterates recurrently from the first input to the last and
    /// separately from the last input to the first. The outputs of the two are concatenated at
    /// each iteration giving the output of the layer.
    Bidirectional,
}

impl RnnDirectionMode {
    /// Number of directions each physical layer runs in.
    pub fn directions(self) -> usize {
        match self {
            RnnDirectionMode::Unidirectional => 1,
            RnnDirectionMode::Bidirectional => 2,
        }
    }
}

impl From<bool> for RnnDirectionMode {
    fn from(bidirectional: bool) -> Self {
        if bidirectional {
            Self::Bidirectional
        } else {
            Self::Unidirectional
        }
    }
}

#[cfg(feature = "cudnn")]
impl From<RnnDirectionMode> for cudnn_sys::cudnnDirectionMode_t {
    fn from(direction: RnnDirectionMode) -> Self {
        match direction {
            RnnDirectionMode::Unidirectional => Self::CUDNN_UNIDIRECTIONAL,
            RnnDirectionMode::Bidirectional => Self::CUDNN_BIDIRECTIONAL,
        }
    }
}
