//! wgpu texture upload for cached images

use crate::resource::{DecodedImage, TextureFactory};
use crate::AppError;
use std::sync::Arc;
use wgpu::{
    Device, Extent3d, ImageCopyTexture, ImageDataLayout, Origin3d, Queue, Texture, TextureAspect,
    TextureDescriptor, TextureDimension, TextureFormat, TextureUsages, TextureView,
    TextureViewDescriptor,
};

/// Texture plus the view used for binding it.
pub struct GpuTexture {
    pub texture: Texture,
    pub view: TextureView,
}

/// Uploads decoded RGBA8 images as sRGB textures.
pub struct WgpuTextureFactory {
    device: Arc<Device>,
    queue: Arc<Queue>,
}

impl WgpuTextureFactory {
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self { device, queue }
    }
}

impl TextureFactory for WgpuTextureFactory {
    type Texture = GpuTexture;

    fn create_texture(&self, image: &DecodedImage) -> Result<GpuTexture, AppError> {
        if image.size().is_empty() {
            return Err(AppError::TextureUpload("empty image".to_string()));
        }
        let limit = self.device.limits().max_texture_dimension_2d;
        if image.width > limit || image.height > limit {
            return Err(AppError::TextureUpload(format!(
                "{} exceeds the device limit of {}",
                image.size(),
                limit
            )));
        }

        let size = Extent3d {
            width: image.width,
            height: image.height,
            depth_or_array_layers: 1,
        };

        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some("cached image"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });

        self.queue.write_texture(
            ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            &image.data,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * image.width),
                rows_per_image: Some(image.height),
            },
            size,
        );

        let view = texture.create_view(&TextureViewDescriptor::default());
        Ok(GpuTexture { texture, view })
    }

    fn release_texture(&self, texture: Arc<GpuTexture>) {
        // Only destroy once nothing else is drawing with it.
        if let Ok(texture) = Arc::try_unwrap(texture) {
            texture.texture.destroy();
        }
    }
}
