//! Application error types

use thiserror::Error;

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // ===== Recoverable Errors (reported on the entry, loading continues) =====
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Image decode error: {0}")]
    ImageDecode(String),

    #[error("Texture upload failed: {0}")]
    TextureUpload(String),

    // ===== Programming Errors (caller used the wrong thread or a dead loader) =====
    #[error("{0} must run on the render thread")]
    ThreadAffinity(&'static str),

    #[error("Image loader closed: {0}")]
    LoaderClosed(String),

    #[error("Render thread has stopped")]
    RenderThreadStopped,

    // ===== Fatal Errors (application termination) =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization failed: {0}")]
    Init(String),
}

impl AppError {
    /// Is this error recoverable?
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::Io(_)
                | AppError::FileNotFound(_)
                | AppError::UnsupportedFormat(_)
                | AppError::ImageDecode(_)
                | AppError::TextureUpload(_)
        )
    }

    /// Is this a fatal error?
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Get a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AppError::FileNotFound(path) => format!("File not found: {}", path),
            AppError::UnsupportedFormat(ext) => format!("Unsupported format: {}", ext),
            AppError::ImageDecode(msg) => format!("Cannot load image: {}", msg),
            _ => self.to_string(),
        }
    }
}

impl From<image::ImageError> for AppError {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::Unsupported(u) => AppError::UnsupportedFormat(u.to_string()),
            image::ImageError::IoError(io) => AppError::Io(io),
            other => AppError::ImageDecode(other.to_string()),
        }
    }
}
