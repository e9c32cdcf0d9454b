use crate::TensorShape;

/// What has to be redone before an executor can run on a requested input shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildPlan {
    /// The RNN descriptor's sequence length differs from the requested one.
    pub resize_descriptor: bool,
    /// The step, hidden state and parameter layout descriptors no longer describe the requested
    /// shape.
    pub rebuild_descriptors: bool,
}

impl RebuildPlan {
    /// Compares the shape the descriptors were built for with the requested one.
    ///
    /// # Arguments
    ///
    ///   * `cached` - input shape the current step descriptors describe.
    ///   * `requested` - input shape of the upcoming call.
    ///   * `descriptor_length` - sequence length the RNN descriptor is configured with, which
    ///     [`set_length`](crate::RnnExecutor::set_length) may have moved away from `cached`.
    ///   * `descriptors_valid` - `false` after a rebuild failed partway, which forces a new one.
    ///
    /// # Examples
    ///
    /// ```
    /// use cudnn_rnn::{RebuildPlan, TensorShape};
    ///
    /// let cached = TensorShape::new(32, 8, 10);
    ///
    /// let plan = RebuildPlan::between(cached, cached, 10, true);
    /// assert!(!plan.is_needed());
    ///
    /// let plan = RebuildPlan::between(cached, cached.with_seq_length(12), 10, true);
    /// assert!(plan.resize_descriptor && plan.rebuild_descriptors);
    /// ```
    pub fn between(
        cached: TensorShape,
        requested: TensorShape,
        descriptor_length: usize,
        descriptors_valid: bool,
    ) -> Self {
        Self {
            resize_descriptor: requested.seq_length() != descriptor_length,
            rebuild_descriptors: !descriptors_valid || cached != requested,
        }
    }

    pub fn is_needed(&self) -> bool {
        self.resize_descriptor || self.rebuild_descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHED: TensorShape = TensorShape::new(32, 8, 10);

    #[test]
    fn unchanged_shape_needs_nothing() {
        assert_eq!(
            RebuildPlan::between(CACHED, CACHED, 10, true),
            RebuildPlan::default()
        );
    }

    #[test]
    fn batch_or_width_change_rebuilds_without_resizing() {
        for requested in [TensorShape::new(32, 4, 10), TensorShape::new(16, 8, 10)] {
            let plan = RebuildPlan::between(CACHED, requested, 10, true);
            assert!(plan.rebuild_descriptors);
            assert!(!plan.resize_descriptor);
        }
    }

    #[test]
    fn length_set_on_the_descriptor_alone_is_picked_up() {
        // set_length(12) was called; the next call asks for the descriptor's length.
        let plan = RebuildPlan::between(CACHED, CACHED.with_seq_length(12), 12, true);
        assert!(plan.rebuild_descriptors);
        assert!(!plan.resize_descriptor);
    }

    #[test]
    fn invalid_descriptors_are_always_rebuilt() {
        let plan = RebuildPlan::between(CACHED, CACHED, 10, false);
        assert!(plan.rebuild_descriptors);
    }
}
