//! Decode backends

use crate::geometry::Size;
use crate::resource::DecodedImage;
use crate::AppError;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::path::Path;

/// Header information read without decoding pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Natural size after the embedded orientation is applied.
    pub natural_size: Size,
    /// The embedded orientation swaps width and height.
    pub transposed: bool,
}

impl ImageInfo {
    /// Convert a size in displayed axes to the decoder's stored axes.
    pub fn to_stored_axes(&self, size: Size) -> Size {
        if self.transposed {
            size.transposed()
        } else {
            size
        }
    }
}

/// A decoded image together with its natural (displayed) size.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub image: DecodedImage,
    pub natural_size: Size,
}

/// Image decoding library used by the loader's workers.
pub trait DecodeBackend: Send + Sync + 'static {
    /// Read the natural size and orientation of `key`.
    fn probe(&self, key: &str) -> Result<ImageInfo, AppError>;

    /// Decode `key`, optionally at `scaled_size`.
    ///
    /// `scaled_size` is given in stored (pre-orientation) axes. The returned
    /// image has the orientation applied.
    fn decode(&self, key: &str, scaled_size: Option<Size>) -> Result<DecodedFrame, AppError>;
}

/// Backend reading image files from disk with the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageBackend;

impl ImageBackend {
    pub fn new() -> Self {
        Self
    }

    fn open(key: &str) -> Result<impl ImageDecoder, AppError> {
        let path = Path::new(key);
        if !path.exists() {
            return Err(AppError::FileNotFound(key.to_string()));
        }

        let reader = ImageReader::open(path)?.with_guessed_format()?;
        if reader.format().is_none() {
            return Err(AppError::UnsupportedFormat(key.to_string()));
        }
        Ok(reader.into_decoder()?)
    }
}

impl DecodeBackend for ImageBackend {
    fn probe(&self, key: &str) -> Result<ImageInfo, AppError> {
        let mut decoder = Self::open(key)?;
        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        let (width, height) = decoder.dimensions();
        Ok(info_for(Size::new(width, height), orientation))
    }

    fn decode(&self, key: &str, scaled_size: Option<Size>) -> Result<DecodedFrame, AppError> {
        let mut decoder = Self::open(key)?;
        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        let (width, height) = decoder.dimensions();
        let info = info_for(Size::new(width, height), orientation);

        let mut img = DynamicImage::from_decoder(decoder)?;

        // The image crate has no DCT-domain scaling, so the requested
        // fraction is reached by resampling right after decode.
        if let Some(size) = scaled_size {
            if !size.is_empty() && size != Size::new(width, height) {
                tracing::debug!(
                    "Scaling {} from {}x{} to {} during decode",
                    key,
                    width,
                    height,
                    size
                );
                img = img.thumbnail_exact(size.width, size.height);
            }
        }
        img.apply_orientation(orientation);

        let image = DecodedImage::from(img);
        tracing::debug!("Decoded {} ({}) at {}", key, info.natural_size, image.size());
        Ok(DecodedFrame {
            image,
            natural_size: info.natural_size,
        })
    }
}

fn info_for(stored: Size, orientation: Orientation) -> ImageInfo {
    let transposed = matches!(
        orientation,
        Orientation::Rotate90
            | Orientation::Rotate270
            | Orientation::Rotate90FlipH
            | Orientation::Rotate270FlipH
    );
    ImageInfo {
        natural_size: if transposed { stored.transposed() } else { stored },
        transposed,
    }
}

/// Check if a file is a supported image format
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            matches!(
                e.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp"
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_png(dir: &TempDir, name: &str, width: u32, height: u32) -> String {
        let path = dir.path().join(name);
        image::RgbaImage::from_pixel(width, height, image::Rgba([200, 100, 50, 255]))
            .save(&path)
            .unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_is_supported_image() {
        assert!(is_supported_image(Path::new("test.jpg")));
        assert!(is_supported_image(Path::new("test.PNG")));
        assert!(is_supported_image(Path::new("test.WebP")));
        assert!(!is_supported_image(Path::new("test.txt")));
        assert!(!is_supported_image(Path::new("test.mp4")));
    }

    #[test]
    fn test_probe_reads_natural_size() {
        let dir = TempDir::new().unwrap();
        let key = write_png(&dir, "wide.png", 64, 32);

        let info = ImageBackend::new().probe(&key).unwrap();
        assert_eq!(info.natural_size, Size::new(64, 32));
        assert!(!info.transposed);
    }

    #[test]
    fn test_decode_full_and_scaled() {
        let dir = TempDir::new().unwrap();
        let key = write_png(&dir, "photo.png", 80, 40);
        let backend = ImageBackend::new();

        let full = backend.decode(&key, None).unwrap();
        assert_eq!(full.image.size(), Size::new(80, 40));
        assert_eq!(full.natural_size, Size::new(80, 40));

        let scaled = backend.decode(&key, Some(Size::new(20, 10))).unwrap();
        assert_eq!(scaled.image.size(), Size::new(20, 10));
        assert_eq!(scaled.natural_size, Size::new(80, 40));
    }

    #[test]
    fn test_missing_and_garbage_files() {
        let dir = TempDir::new().unwrap();
        let backend = ImageBackend::new();

        let missing = dir.path().join("nope.png").to_string_lossy().into_owned();
        assert!(matches!(backend.decode(&missing, None), Err(AppError::FileNotFound(_))));

        let garbage = dir.path().join("garbage.png");
        std::fs::write(&garbage, b"definitely not an image").unwrap();
        let err = backend
            .decode(&garbage.to_string_lossy(), None)
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_orientation_swaps_axes() {
        let info = info_for(Size::new(30, 20), Orientation::Rotate90);
        assert_eq!(info.natural_size, Size::new(20, 30));
        assert_eq!(info.to_stored_axes(Size::new(10, 15)), Size::new(15, 10));

        let info = info_for(Size::new(30, 20), Orientation::FlipHorizontal);
        assert_eq!(info.natural_size, Size::new(30, 20));
        assert_eq!(info.to_stored_axes(Size::new(10, 15)), Size::new(10, 15));
    }
}
