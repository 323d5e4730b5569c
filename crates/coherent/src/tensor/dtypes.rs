use half::f16;

/// Element types a tensor may be declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F16,
    U8,
    U32,
}

impl Dtype {
    pub const fn size_bytes(self) -> usize {
        match self {
            Dtype::F32 | Dtype::U32 => 4,
            Dtype::F16 => 2,
            Dtype::U8 => 1,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Dtype::F32 | Dtype::F16)
    }
}

/// Ties a host scalar type to a [`Dtype`] for typed host access.
pub trait TensorElement: Clone + Copy + Send + Sync + 'static {
    type Scalar: Clone + Copy + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static;
    const DTYPE: Dtype;

    fn from_f32(value: f32) -> Self::Scalar;
    fn to_f32(value: Self::Scalar) -> f32;
}

#[derive(Clone, Copy, Debug)]
pub struct F32;

impl TensorElement for F32 {
    type Scalar = f32;
    const DTYPE: Dtype = Dtype::F32;

    #[inline]
    fn from_f32(value: f32) -> Self::Scalar {
        value
    }

    #[inline]
    fn to_f32(value: Self::Scalar) -> f32 {
        value
    }
}

#[derive(Clone, Copy, Debug)]
pub struct F16;

impl TensorElement for F16 {
    type Scalar = f16;
    const DTYPE: Dtype = Dtype::F16;

    #[inline]
    fn from_f32(value: f32) -> Self::Scalar {
        f16::from_f32(value)
    }

    #[inline]
    fn to_f32(value: Self::Scalar) -> f32 {
        value.to_f32()
    }
}
