use crate::private;
use half::f16;

/// Numeric precision of the data processed by a recurrent layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    /// 16-bit IEEE 754 floating point.
    Half,
    /// 32-bit IEEE 754 floating point.
    Single,
    /// 64-bit IEEE 754 floating point.
    Double,
}

impl Precision {
    /// Size in bytes of one element of this precision.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Precision::Half => 2,
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    /// Smallest number of elements able to hold `bytes` bytes.
    ///
    /// Backend size queries report bytes, buffers are allocated in elements; the conversion
    /// rounds up and never truncates.
    ///
    /// # Examples
    ///
    /// ```
    /// use cudnn_rnn::Precision;
    ///
    /// assert_eq!(Precision::Single.elements_for_bytes(16), 4);
    /// assert_eq!(Precision::Single.elements_for_bytes(17), 5);
    /// assert_eq!(Precision::Double.elements_for_bytes(0), 0);
    /// ```
    pub const fn elements_for_bytes(self, bytes: usize) -> usize {
        bytes.div_ceil(self.size_in_bytes())
    }
}

/// Element types a recurrent layer can be instantiated with.
///
/// The trait is sealed; it is implemented for [`f16`], [`f32`] and [`f64`].
pub trait DataType: private::Sealed + Copy + 'static {
    /// The precision tag matching this type.
    const PRECISION: Precision;
}

macro_rules! impl_rnn_data_type {
    ($safe_type:ty, $precision:ident) => {
        impl private::Sealed for $safe_type {}

        impl DataType for $safe_type {
            const PRECISION: Precision = Precision::$precision;
        }
    };
}

impl_rnn_data_type!(f16, Half);
impl_rnn_data_type!(f32, Single);
impl_rnn_data_type!(f64, Double);

#[cfg(feature = "cudnn")]
impl From<Precision> for cudnn_sys::cudnnDataType_t {
    fn from(precision: Precision) -> Self {
        match precision {
            Precision::Half => Self::CUDNN_DATA_HALF,
            Precision::Single => Self::CUDNN_DATA_FLOAT,
            Precision::Double => Self::CUDNN_DATA_DOUBLE,
        }
    }
}
