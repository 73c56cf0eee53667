//! Decoded images and the render resources built from them

use crate::geometry::Size;
use crate::AppError;
use std::sync::Arc;

/// Decoded image in RAM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub format: ImageFormat,
}

/// Pixel layout of a decoded image. Decoders normalise to RGBA8 so every
/// texture upload path handles a single layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Rgba8,
}

impl DecodedImage {
    /// Wrap an RGBA8 buffer. `data` must hold `width * height * 4` bytes.
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 4);
        Self {
            width,
            height,
            data,
            format: ImageFormat::Rgba8,
        }
    }

    /// Solid-colour RGBA8 image, mostly useful for placeholders and tests.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba.repeat(width as usize * height as usize);
        Self::from_rgba8(width, height, data)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Bytes held by the pixel buffer.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

impl From<image::DynamicImage> for DecodedImage {
    fn from(img: image::DynamicImage) -> Self {
        let rgba = img.into_rgba8();
        let (width, height) = rgba.dimensions();
        Self::from_rgba8(width, height, rgba.into_raw())
    }
}

/// Creates and destroys the render resource (typically a GPU texture) that
/// backs a cached image.
///
/// Both methods are only ever called on the cache's owning thread.
pub trait TextureFactory: Send + Sync + 'static {
    type Texture: Send + Sync + 'static;

    /// Build a texture from a decoded image.
    fn create_texture(&self, image: &DecodedImage) -> Result<Self::Texture, AppError>;

    /// Destroy a texture. The default simply drops it.
    fn release_texture(&self, texture: Arc<Self::Texture>) {
        drop(texture);
    }
}
