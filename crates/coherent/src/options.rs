//! Tensor metadata: element type, memory layout and the NCHW image packing.

use crate::{CoherentError, Result, tensor::dtypes::Dtype};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLayout {
    #[default]
    Contiguous,
    ChannelsLast,
}

impl MemoryLayout {
    pub const fn name(self) -> &'static str {
        match self {
            MemoryLayout::Contiguous => "contiguous",
            MemoryLayout::ChannelsLast => "channels-last",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorOptions {
    pub dtype: Dtype,
    pub layout: MemoryLayout,
}

impl TensorOptions {
    pub const fn new(dtype: Dtype) -> Self {
        Self {
            dtype,
            layout: MemoryLayout::Contiguous,
        }
    }

    pub const fn with_layout(mut self, layout: MemoryLayout) -> Self {
        self.layout = layout;
        self
    }
}

impl Default for TensorOptions {
    fn default() -> Self {
        Self::new(Dtype::F32)
    }
}

/// Reject element type / layout combinations that have no image format.
pub fn verify(options: &TensorOptions) -> Result<()> {
    if options.dtype.is_float() && options.layout == MemoryLayout::Contiguous {
        return Ok(());
    }
    Err(CoherentError::UnsupportedOptions {
        dtype: options.dtype,
        layout: options.layout.name(),
    })
}

pub const MAX_DIMS: usize = 4;

/// Extents of a 3D image in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageExtents {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl ImageExtents {
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self { width, height, depth }
    }

    pub const fn texels(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Bytes taken by an image of these extents, or `InvalidShape` if that overflows.
    pub fn byte_size(&self, format: ImageFormat) -> Result<usize> {
        checked_product([self.width, self.height, self.depth, format.texel_bytes()])
            .ok_or_else(|| CoherentError::InvalidShape(format!("image of {self:?} exceeds the address space")))
    }
}

/// Four-channel texel formats; one per floating dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba32Float,
    Rgba16Float,
}

impl ImageFormat {
    pub fn for_dtype(dtype: Dtype) -> Result<Self> {
        match dtype {
            Dtype::F32 => Ok(ImageFormat::Rgba32Float),
            Dtype::F16 => Ok(ImageFormat::Rgba16Float),
            other => Err(CoherentError::UnsupportedOptions {
                dtype: other,
                layout: MemoryLayout::Contiguous.name(),
            }),
        }
    }

    pub const fn channel_bytes(self) -> usize {
        match self {
            ImageFormat::Rgba32Float => 4,
            ImageFormat::Rgba16Float => 2,
        }
    }

    pub const fn texel_bytes(self) -> usize {
        self.channel_bytes() * 4
    }
}

/// How a contiguous NCHW buffer maps onto RGBA texels.
///
/// Texel `(x, y, z)` holds channels `4k..4k+4` of batch `n` at `(y, x)`, with
/// `z = n * ceil(C / 4) + k`. Channels past `C` are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackLayout {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub element_bytes: usize,
}

impl PackLayout {
    /// Fails with `InvalidShape` if the buffer or the padded image would not be addressable.
    pub fn new(sizes: &[usize], dtype: Dtype) -> Result<Self> {
        Self::checked(sizes, dtype.size_bytes())
    }

    fn checked(sizes: &[usize], element_bytes: usize) -> Result<Self> {
        let [batch, channels, height, width] = nchw(sizes)?;
        let layout = Self {
            batch,
            channels,
            height,
            width,
            element_bytes,
        };
        // Image bytes bound the buffer bytes, and every index below them.
        let image_bytes = batch
            .checked_mul(layout.channel_slices())
            .and_then(|depth| checked_product([width.max(1), height.max(1), depth.max(1), 4, element_bytes.max(1)]));
        match image_bytes {
            Some(_) => Ok(layout),
            None => Err(CoherentError::InvalidShape(format!("{sizes:?} exceeds the address space"))),
        }
    }

    #[inline]
    pub const fn channel_slices(&self) -> usize {
        self.channels.div_ceil(4)
    }

    pub const fn elements(&self) -> usize {
        self.batch * self.channels * self.height * self.width
    }

    pub const fn image_elements(&self) -> usize {
        self.batch * self.channel_slices() * self.height * self.width * 4
    }

    #[inline]
    pub const fn buffer_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.channels + c) * self.height + y) * self.width + x
    }

    #[inline]
    pub const fn image_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        let z = n * self.channel_slices() + c / 4;
        ((z * self.height + y) * self.width + x) * 4 + c % 4
    }

    pub fn extents(&self) -> ImageExtents {
        ImageExtents::new(
            self.width.max(1),
            self.height.max(1),
            (self.batch * self.channel_slices()).max(1),
        )
    }
}

/// Right-align `sizes` into `[N, C, H, W]`, padding leading dimensions with 1.
pub fn nchw(sizes: &[usize]) -> Result<[usize; 4]> {
    if sizes.len() > MAX_DIMS {
        return Err(CoherentError::InvalidShape(format!(
            "{} dimensions requested, at most {MAX_DIMS} are supported",
            sizes.len()
        )));
    }
    let mut out = [1usize; 4];
    out[MAX_DIMS - sizes.len()..].copy_from_slice(sizes);
    Ok(out)
}

/// Image extents backing a tensor of `sizes`.
pub fn image_extents(sizes: &[usize]) -> Result<ImageExtents> {
    Ok(PackLayout::checked(sizes, 0)?.extents())
}

/// Bytes needed for `sizes` elements of `dtype`, or `InvalidShape` if that overflows.
pub fn byte_size(sizes: &[usize], dtype: Dtype) -> Result<usize> {
    checked_product(sizes.iter().copied().chain([dtype.size_bytes()]))
        .ok_or_else(|| CoherentError::InvalidShape(format!("{sizes:?} exceeds the address space")))
}

fn checked_product(factors: impl IntoIterator<Item = usize>) -> Option<usize> {
    factors.into_iter().try_fold(1usize, usize::checked_mul)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_only_contiguous_floats() {
        assert!(verify(&TensorOptions::new(Dtype::F32)).is_ok());
        assert!(verify(&TensorOptions::new(Dtype::F16)).is_ok());
        assert!(matches!(
            verify(&TensorOptions::new(Dtype::U8)),
            Err(CoherentError::UnsupportedOptions { dtype: Dtype::U8, .. })
        ));
        assert!(matches!(
            verify(&TensorOptions::new(Dtype::F32).with_layout(MemoryLayout::ChannelsLast)),
            Err(CoherentError::UnsupportedOptions {
                layout: "channels-last",
                ..
            })
        ));
    }

    #[test]
    fn extents_pack_four_channels_per_texel() {
        assert_eq!(image_extents(&[4]).unwrap(), ImageExtents::new(4, 1, 1));
        assert_eq!(image_extents(&[5, 3, 2]).unwrap(), ImageExtents::new(2, 3, 2));
        assert_eq!(image_extents(&[2, 6, 3, 2]).unwrap(), ImageExtents::new(2, 3, 4));
        assert_eq!(image_extents(&[]).unwrap(), ImageExtents::new(1, 1, 1));
        assert!(matches!(image_extents(&[1, 1, 1, 1, 1]), Err(CoherentError::InvalidShape(_))));
    }

    #[test]
    fn pack_indices_place_channels_in_lanes() {
        let layout = PackLayout::new(&[1, 5, 1, 2], Dtype::F32).unwrap();
        assert_eq!(layout.channel_slices(), 2);
        assert_eq!(layout.image_elements(), 16);
        assert_eq!(layout.image_index(0, 0, 0, 0), 0);
        assert_eq!(layout.image_index(0, 3, 0, 0), 3);
        assert_eq!(layout.image_index(0, 1, 0, 1), 5);
        assert_eq!(layout.image_index(0, 4, 0, 0), 8);
        assert_eq!(layout.buffer_index(0, 4, 0, 1), 9);
    }

    #[test]
    fn oversized_shapes_are_rejected() {
        assert!(matches!(
            PackLayout::new(&[usize::MAX, 2], Dtype::F32),
            Err(CoherentError::InvalidShape(_))
        ));
        assert!(matches!(
            PackLayout::new(&[usize::MAX / 2, 1], Dtype::F32),
            Err(CoherentError::InvalidShape(_))
        ));
        // Empty tensors still occupy one texel per slice.
        assert!(matches!(
            image_extents(&[usize::MAX, 5, 0, 0]),
            Err(CoherentError::InvalidShape(_))
        ));
        assert!(matches!(byte_size(&[usize::MAX, 2], Dtype::F16), Err(CoherentError::InvalidShape(_))));
        assert_eq!(byte_size(&[3, 5], Dtype::F16).unwrap(), 30);
        assert_eq!(byte_size(&[], Dtype::F32).unwrap(), 4);
        assert!(matches!(
            ImageExtents::new(usize::MAX, 2, 1).byte_size(ImageFormat::Rgba16Float),
            Err(CoherentError::InvalidShape(_))
        ));
        assert_eq!(ImageExtents::new(2, 3, 4).byte_size(ImageFormat::Rgba32Float).unwrap(), 384);
    }
}
