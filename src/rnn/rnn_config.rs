use crate::{RnnDirectionMode, RnnError, RnnInputMode, RnnMode, DEFAULT_DROPOUT_SEED};

/// The geometry and regularization settings of a recurrent layer, everything except the shape of
/// the data flowing through it.
///
/// # Examples
///
/// ```
/// use cudnn_rnn::{RnnConfig, RnnDirectionMode, RnnMode};
///
/// let config = RnnConfig::new(128, 3)
///     .cell_mode(RnnMode::Gru)
///     .direction(RnnDirectionMode::Bidirectional)
///     .dropout(0.2, 1234);
///
/// assert_eq!(config.output_width(), 256);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RnnConfig {
    /// Size of the hidden state vector. The same size is used in all layers.
    pub hidden_size: usize,
    /// Number of stacked physical layers. A bidirectional physical layer consists of one
    /// pseudo-layer per direction.
    pub num_layers: usize,
    /// Recurrence pattern.
    ///
    /// Defaults to [`RnnDirectionMode::Unidirectional`].
    pub direction: RnnDirectionMode,
    /// Recurrent cell used in every layer.
    ///
    /// Defaults to [`RnnMode::Lstm`].
    pub cell_mode: RnnMode,
    /// How the input of the first layer is processed.
    ///
    /// Defaults to [`RnnInputMode::LinearInput`].
    pub input_mode: RnnInputMode,
    /// Probability with which units are dropped between physical layers during training. A
    /// single layer network has no dropout applied.
    ///
    /// Defaults to `0.0`.
    pub dropout: f32,
    /// Seed of the dropout random number generator.
    ///
    /// Defaults to [`DEFAULT_DROPOUT_SEED`].
    pub seed: u64,
}

impl RnnConfig {
    pub fn new(hidden_size: usize, num_layers: usize) -> Self {
        Self {
            hidden_size,
            num_layers,
            direction: RnnDirectionMode::default(),
            cell_mode: RnnMode::default(),
            input_mode: RnnInputMode::default(),
            dropout: 0.0,
            seed: DEFAULT_DROPOUT_SEED,
        }
    }

    pub fn direction(mut self, direction: RnnDirectionMode) -> Self {
        self.direction = direction;
        self
    }

    /// Shorthand for [`direction`](Self::direction) taking a flag.
    pub fn bidirectional(mut self, bidirectional: bool) -> Self {
        self.direction = bidirectional.into();
        self
    }

    pub fn cell_mode(mut self, cell_mode: RnnMode) -> Self {
        self.cell_mode = cell_mode;
        self
    }

    pub fn input_mode(mut self, input_mode: RnnInputMode) -> Self {
        self.input_mode = input_mode;
        self
    }

    pub fn dropout(mut self, probability: f32, seed: u64) -> Self {
        self.dropout = probability;
        self.seed = seed;
        self
    }

    /// Width of one output step: the hidden size times the number of directions.
    pub fn output_width(&self) -> usize {
        self.hidden_size * self.direction.directions()
    }

    /// Checks the values that do not depend on the backend. The dropout probability is checked
    /// when the dropout state is built.
    pub fn validate(&self) -> Result<(), RnnError> {
        if self.hidden_size == 0 {
            return Err(RnnError::InvalidConfig {
                what: "hidden size must be at least 1",
            });
        }
        if self.num_layers == 0 {
            return Err(RnnError::InvalidConfig {
                what: "layer count must be at least 1",
            });
        }
        Ok(())
    }
}
