use std::{fmt::Display, ops::Index};

/// Shape of a sequence tensor as seen by a recurrent layer: `[features, batch, sequence]`.
///
/// Index 0 is the feature dimension, 1 the mini-batch and 2 the number of time steps. Data is
/// expected to be laid out with the feature dimension innermost, one `batch × features` slab per
/// time step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    dims: [usize; 3],
}

impl TensorShape {
    pub const FEATURE_DIM: usize = 0;
    pub const BATCH_DIM: usize = 1;
    pub const SEQUENCE_DIM: usize = 2;

    pub const fn new(features: usize, batch: usize, seq_length: usize) -> Self {
        Self {
            dims: [features, batch, seq_length],
        }
    }

    pub fn features(&self) -> usize {
        self.dims[Self::FEATURE_DIM]
    }

    pub fn batch(&self) -> usize {
        self.dims[Self::BATCH_DIM]
    }

    pub fn seq_length(&self) -> usize {
        self.dims[Self::SEQUENCE_DIM]
    }

    /// Total number of elements covered by this shape, or `None` if it does not fit `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |len, &dim| len.checked_mul(dim))
    }

    /// Total number of elements covered by this shape, saturating at `usize::MAX`.
    pub fn len(&self) -> usize {
        self.checked_len().unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.dims.contains(&0)
    }

    /// Returns the same shape with the sequence dimension replaced.
    pub fn with_seq_length(self, seq_length: usize) -> Self {
        Self::new(self.features(), self.batch(), seq_length)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }
}

impl From<[usize; 3]> for TensorShape {
    fn from(dims: [usize; 3]) -> Self {
        Self { dims }
    }
}

impl Index<usize> for TensorShape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.dims[index]
    }
}

impl Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [features, batch, seq] = self.dims;
        write!(f, "[{features} x {batch} x {seq}]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_and_named_access_agree() {
        let shape = TensorShape::new(32, 8, 10);
        assert_eq!(shape[0], shape.features());
        assert_eq!(shape[1], shape.batch());
        assert_eq!(shape[2], shape.seq_length());
        assert_eq!(shape.len(), 32 * 8 * 10);
        assert_eq!(shape.with_seq_length(3), TensorShape::from([32, 8, 3]));
    }

    #[test]
    fn element_count_overflow_is_detected() {
        let huge = TensorShape::new(usize::MAX / 2, 4, 16);
        assert_eq!(huge.checked_len(), None);
        assert_eq!(huge.len(), usize::MAX);
        assert!(!huge.is_empty());

        let empty = TensorShape::new(usize::MAX, 0, 16);
        assert_eq!(empty.checked_len(), Some(0));
        assert!(empty.is_empty());
    }
}
