//! QuickView Core
//!
//! This crate contains:
//! - Geometry and the decode-time scaling policy
//! - Decode backends
//! - The image loader (job queue and worker pool)
//! - The reference-counted texture cache and its per-surface registry
//! - The headless image slot consumed by views
//! - Configuration
//! - Error types

pub mod config;
pub mod decode;
pub mod error;
pub mod geometry;
#[cfg(feature = "wgpu")]
pub mod gpu_texture;
pub mod image_loader;
pub mod job;
pub mod registry;
pub mod render_thread;
pub mod resource;
pub mod scaling;
pub mod slot;
pub mod texture_cache;

pub use config::{AppConfig, CacheConfig, LoaderConfig};
pub use decode::{is_supported_image, DecodeBackend, DecodedFrame, ImageBackend, ImageInfo};
pub use error::AppError;
pub use geometry::Size;
#[cfg(feature = "wgpu")]
pub use gpu_texture::{GpuTexture, WgpuTextureFactory};
pub use image_loader::{ImageLoader, LoadedImage};
pub use job::{Job, JobCallback, JobStats};
pub use registry::{CacheRegistry, SurfaceId};
pub use render_thread::{RenderHandle, RenderThread};
pub use resource::{DecodedImage, ImageFormat, TextureFactory};
pub use scaling::{choose_decode_scale, DecodeScale};
pub use slot::{ImageSlot, SlotStatus};
pub use texture_cache::{CacheEntry, CacheOwner, CacheStats, ImageCache, SweepStats};
