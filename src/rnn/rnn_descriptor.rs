use crate::{
    DropoutState, Precision, RnnBackend, RnnConfig, RnnDirectionMode, RnnError, RnnInputMode,
    RnnMode,
};
use std::rc::Rc;
use tracing::{debug, warn};

/// The full set of values an RNN descriptor is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RnnGeometry {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub seq_length: usize,
    pub direction: RnnDirectionMode,
    pub cell_mode: RnnMode,
    pub input_mode: RnnInputMode,
    pub precision: Precision,
}

/// A description of a recurrent network: its cell type, depth, width, recurrence pattern and the
/// dropout applied between layers.
///
/// The sequence length is the only value that can change after construction, see
/// [`resize`](RnnDescriptor::resize).
pub struct RnnDescriptor<B: RnnBackend> {
    backend: Rc<B>,
    raw: B::RnnDesc,
    geometry: RnnGeometry,
    // Declared after `raw` and therefore released after it.
    dropout: DropoutState<B>,
}

impl<B: RnnBackend> RnnDescriptor<B> {
    /// Initializes an RNN descriptor object.
    ///
    /// # Arguments
    ///
    ///   * `backend` - backend context the descriptor lives in.
    ///   * `config` - cell type, depth, width and recurrence pattern of the network.
    ///   * `seq_length` - number of time steps of the sequences fed to the network.
    ///   * `precision` - precision of the data and of the math.
    ///   * `dropout` - dropout applied between physical layers. The descriptor takes ownership of
    ///     it and releases it after itself.
    ///
    /// # Errors
    ///
    /// Returns an error if one of the sizes is zero or if the backend rejects the combination of
    /// arguments. The descriptor is destroyed again before the error is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn main() -> Result<(), cudnn_rnn::RnnError> {
    /// use cudnn_rnn::{testing::TrackingBackend, DropoutState, Precision, RnnConfig, RnnDescriptor};
    /// use std::rc::Rc;
    ///
    /// let backend = Rc::new(TrackingBackend::new());
    /// let dropout = DropoutState::new(&backend, 0.0, 0)?;
    ///
    /// let mut rnn = RnnDescriptor::new(&backend, &RnnConfig::new(64, 2), 10, Precision::Single, dropout)?;
    /// rnn.resize(25)?;
    ///
    /// assert_eq!(rnn.length(), 25);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        backend: &Rc<B>,
        config: &RnnConfig,
        seq_length: usize,
        precision: Precision,
        dropout: DropoutState<B>,
    ) -> Result<Self, RnnError> {
        config.validate()?;
        check_seq_length(seq_length)?;

        let geometry = RnnGeometry {
            hidden_size: config.hidden_size,
            num_layers: config.num_layers,
            seq_length,
            direction: config.direction,
            cell_mode: config.cell_mode,
            input_mode: config.input_mode,
            precision,
        };

        let raw = backend.create_rnn_descriptor()?;
        let desc = Self {
            backend: Rc::clone(backend),
            raw,
            geometry,
            dropout,
        };
        desc.apply()?;

        Ok(desc)
    }

    /// Changes the sequence length and reapplies the whole configuration.
    ///
    /// If the backend rejects the new configuration the previous length is kept and applied
    /// again, so the handle keeps describing [`geometry`](RnnDescriptor::geometry).
    pub fn resize(&mut self, seq_length: usize) -> Result<(), RnnError> {
        check_seq_length(seq_length)?;

        let previous = self.geometry.seq_length;
        self.geometry.seq_length = seq_length;

        if let Err(e) = self.apply() {
            self.geometry.seq_length = previous;
            if let Err(restore) = self.apply() {
                warn!(error = %restore, seq_length = previous, "failed to restore RNN descriptor");
            }
            return Err(e);
        }

        debug!(from = previous, to = seq_length, "resized RNN descriptor");
        Ok(())
    }

    /// Current sequence length.
    pub fn length(&self) -> usize {
        self.geometry.seq_length
    }

    pub fn hidden_size(&self) -> usize {
        self.geometry.hidden_size
    }

    pub fn num_layers(&self) -> usize {
        self.geometry.num_layers
    }

    pub fn direction(&self) -> RnnDirectionMode {
        self.geometry.direction
    }

    pub fn is_bidirectional(&self) -> bool {
        self.geometry.direction == RnnDirectionMode::Bidirectional
    }

    pub fn cell_mode(&self) -> RnnMode {
        self.geometry.cell_mode
    }

    pub fn input_mode(&self) -> RnnInputMode {
        self.geometry.input_mode
    }

    pub fn precision(&self) -> Precision {
        self.geometry.precision
    }

    pub fn geometry(&self) -> &RnnGeometry {
        &self.geometry
    }

    pub fn dropout(&self) -> &DropoutState<B> {
        &self.dropout
    }

    /// Width of one output step.
    pub fn output_width(&self) -> usize {
        self.geometry.hidden_size * self.geometry.direction.directions()
    }

    pub(crate) fn raw(&self) -> B::RnnDesc {
        self.raw
    }

    fn apply(&self) -> Result<(), RnnError> {
        self.backend
            .set_rnn_descriptor(self.raw, &self.geometry, self.dropout.raw())
    }
}

impl<B: RnnBackend> Drop for RnnDescriptor<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.destroy_rnn_descriptor(self.raw) {
            warn!(error = %e, "failed to destroy RNN descriptor");
        }
    }
}

fn check_seq_length(seq_length: usize) -> Result<(), RnnError> {
    if seq_length == 0 {
        return Err(RnnError::InvalidConfig {
            what: "sequence length must be at least 1",
        });
    }
    Ok(())
}
