//! Headless image consumer
//!
//! An [`ImageSlot`] is what a view keeps per displayed image: it resolves its
//! source through the cache, asks the loader for a decode on a miss, and
//! requests a larger decode when the target grows past what was loaded.

use crate::geometry::Size;
use crate::image_loader::ImageLoader;
use crate::job::Job;
use crate::resource::TextureFactory;
use crate::texture_cache::{CacheEntry, ImageCache};
use crate::AppError;
use crossbeam_channel::Receiver;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// No source, or nothing requested yet.
    Null,
    Loading,
    Ready,
    Error,
}

pub struct ImageSlot<F: TextureFactory> {
    loader: Arc<ImageLoader>,
    cache: ImageCache<F>,
    changes: Receiver<String>,
    source: Option<String>,
    /// Target size in device pixels; zero means not laid out yet.
    target_size: Size,
    status: SlotStatus,
    entry: Option<CacheEntry<F>>,
    job: Option<Job>,
}

impl<F: TextureFactory> ImageSlot<F> {
    pub fn new(loader: Arc<ImageLoader>, cache: ImageCache<F>) -> Self {
        let changes = cache.subscribe();
        Self {
            loader,
            cache,
            changes,
            source: None,
            target_size: Size::ZERO,
            status: SlotStatus::Null,
            entry: None,
            job: None,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Show `source`, or nothing if it is empty.
    pub fn set_source(&mut self, source: &str) {
        if self.source.as_deref() == Some(source) {
            return;
        }
        self.clear();
        if source.is_empty() {
            return;
        }

        self.source = Some(source.to_string());
        // A cache hit sets the status right away.
        self.reload();
        if self.status == SlotStatus::Null {
            self.status = SlotStatus::Loading;
        }
    }

    pub fn target_size(&self) -> Size {
        self.target_size
    }

    pub fn set_target_size(&mut self, size: Size) {
        if self.target_size == size {
            return;
        }
        self.target_size = size;
        self.reload();
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    pub fn entry(&self) -> Option<&CacheEntry<F>> {
        self.entry.as_ref()
    }

    /// The decode job in flight, if any.
    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// Natural size of the current image.
    pub fn image_size(&self) -> Size {
        self.entry.as_ref().map_or(Size::ZERO, |e| e.natural_size())
    }

    pub fn loaded_size(&self) -> Size {
        self.entry.as_ref().map_or(Size::ZERO, |e| e.loaded_size())
    }

    pub fn error(&self) -> Option<String> {
        self.entry.as_ref().and_then(|e| e.error())
    }

    /// Texture for painting. Render thread only.
    pub fn texture(&self) -> Result<Option<Arc<F::Texture>>, AppError> {
        match &self.entry {
            Some(entry) => entry.texture(),
            None => Ok(None),
        }
    }

    fn clear(&mut self) {
        self.entry = None;
        self.job = None;
        self.source = None;
        self.status = SlotStatus::Null;
    }

    /// Whether the image was decoded smaller than the current target needs.
    pub fn needs_reload_for_draw_size(&self) -> bool {
        if matches!(self.status, SlotStatus::Null | SlotStatus::Error) {
            return false;
        }
        if self.target_size.is_null() {
            return false;
        }

        let (natural, loaded) = match &self.entry {
            Some(entry) => (entry.natural_size(), entry.loaded_size()),
            None => return true,
        };
        if natural.is_empty() || loaded.is_empty() {
            return true;
        }

        let fit = natural.fit_within(self.target_size);
        (fit.width > loaded.width && natural.width > loaded.width)
            || (fit.height > loaded.height && natural.height > loaded.height)
    }

    /// Use the cached image if it is good enough, otherwise request a decode
    /// or update the size of the one in flight.
    pub fn reload(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        if self.target_size.is_null() {
            return;
        }

        if self.entry.is_none() {
            let entry = self.cache.get(&source);
            let hit = !entry.is_empty();
            self.entry = Some(entry);
            if hit {
                self.on_cache_changed(&source);
            }
        }

        if let Some(entry) = &self.entry {
            if entry.error().is_some() || (!entry.is_empty() && !self.needs_reload_for_draw_size()) {
                return;
            }
        }

        let loading_size = self.target_size;
        // Best effort: ignored once a worker has started on it.
        if let Some(job) = &self.job {
            if job.draw_size() != loading_size {
                tracing::debug!("Updating load size of {} to {}", source, loading_size);
                job.set_draw_size(loading_size);
            }
            return;
        }

        let cache = self.cache.clone();
        let key = source.clone();
        let job = self.loader.enqueue(source, loading_size, 0, move |job: &Job| {
            match job.image() {
                Some(image) => cache.insert_image(&key, image, job.natural_size().unwrap_or(Size::ZERO)),
                None => cache.insert_error(&key, job.error().unwrap_or("Image load failed")),
            }
        });
        self.job = Some(job);
    }

    /// React to a cache update for `key`.
    pub fn on_cache_changed(&mut self, key: &str) {
        let Some(source) = self.source.clone() else {
            return;
        };
        if key != source {
            return;
        }

        // An insert from another request may land first; keep waiting on our
        // own job so it keeps its place in the queue.
        if let Some(job) = self.job.take_if(|job| job.is_finished()) {
            let stats = job.stats();
            tracing::debug!(
                "Loaded {} at {} (natural {}): waited {:?} at queue position {}, decoded in {:?}, total {:?}",
                source,
                self.loaded_size(),
                self.image_size(),
                stats.queue_wait(),
                stats.queue_position,
                stats.decode_time(),
                stats.total()
            );
        }

        let entry = self.entry.get_or_insert_with(|| self.cache.get(&source));
        self.status = if entry.error().is_some() {
            SlotStatus::Error
        } else {
            SlotStatus::Ready
        };

        if self.needs_reload_for_draw_size() {
            tracing::warn!(
                "Reloading {}: cached at {} but {} is wanted",
                source,
                self.loaded_size(),
                self.target_size
            );
            self.reload();
        }
    }

    /// Handle pending cache notifications. Returns how many concerned this
    /// slot's source.
    pub fn process_notifications(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(key) = self.changes.try_recv() {
            if self.source.as_deref() == Some(key.as_str()) {
                self.on_cache_changed(&key);
                handled += 1;
            }
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::decode::{DecodeBackend, DecodedFrame, ImageInfo};
    use crate::resource::DecodedImage;

    struct NullFactory;

    impl TextureFactory for NullFactory {
        type Texture = Size;

        fn create_texture(&self, image: &DecodedImage) -> Result<Size, AppError> {
            Ok(image.size())
        }
    }

    /// Backend that fails every request.
    struct BrokenBackend;

    impl DecodeBackend for BrokenBackend {
        fn probe(&self, key: &str) -> Result<ImageInfo, AppError> {
            Err(AppError::FileNotFound(key.to_string()))
        }

        fn decode(&self, key: &str, _scaled: Option<Size>) -> Result<DecodedFrame, AppError> {
            Err(AppError::FileNotFound(key.to_string()))
        }
    }

    fn slot() -> (ImageSlot<NullFactory>, ImageCache<NullFactory>) {
        let loader = ImageLoader::new(
            Arc::new(BrokenBackend),
            &LoaderConfig {
                worker_threads: Some(1),
            },
        );
        let cache = ImageCache::with_limits(NullFactory, u64::MAX, 1, std::thread::current().id());
        (ImageSlot::new(Arc::new(loader), cache.clone()), cache)
    }

    #[test]
    fn test_cache_hit_is_ready_without_job() {
        let (mut slot, cache) = slot();
        cache.insert_image(
            "a.jpg",
            Arc::new(DecodedImage::filled(100, 75, [0; 4])),
            Size::new(400, 300),
        );

        slot.set_target_size(Size::new(100, 100));
        slot.set_source("a.jpg");
        assert_eq!(slot.status(), SlotStatus::Ready);
        assert!(slot.job().is_none());
        assert_eq!(slot.image_size(), Size::new(400, 300));
        assert!(!slot.needs_reload_for_draw_size());
        assert_eq!(slot.texture().unwrap().as_deref(), Some(&Size::new(100, 75)));
    }

    #[test]
    fn test_larger_target_requests_reload() {
        let (mut slot, cache) = slot();
        cache.insert_image(
            "a.jpg",
            Arc::new(DecodedImage::filled(100, 75, [0; 4])),
            Size::new(400, 300),
        );
        slot.set_target_size(Size::new(100, 100));
        slot.set_source("a.jpg");

        slot.set_target_size(Size::new(200, 200));
        assert!(slot.needs_reload_for_draw_size());
        let job = slot.job().expect("reload job");
        assert_eq!(job.draw_size(), Size::new(200, 200));
        // The smaller image stays up meanwhile.
        assert_eq!(slot.status(), SlotStatus::Ready);
    }

    #[test]
    fn test_no_reload_when_loaded_at_natural_size() {
        let (mut slot, cache) = slot();
        cache.insert_image(
            "small.png",
            Arc::new(DecodedImage::filled(40, 30, [0; 4])),
            Size::new(40, 30),
        );
        slot.set_target_size(Size::new(1000, 1000));
        slot.set_source("small.png");
        assert!(!slot.needs_reload_for_draw_size());
        assert!(slot.job().is_none());
    }

    #[test]
    fn test_failed_load_sets_error() {
        let (mut slot, _cache) = slot();
        slot.set_target_size(Size::new(50, 50));
        slot.set_source("missing.jpg");
        assert_eq!(slot.status(), SlotStatus::Loading);
        assert!(slot.job().is_some());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while slot.process_notifications() == 0 {
            assert!(std::time::Instant::now() < deadline, "load never completed");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(slot.status(), SlotStatus::Error);
        assert!(slot.error().unwrap().contains("missing.jpg"));
        assert!(slot.job().is_none());
        assert!(!slot.needs_reload_for_draw_size());
    }

    #[test]
    fn test_unlaid_out_slot_waits() {
        let (mut slot, _cache) = slot();
        slot.set_source("a.jpg");
        assert_eq!(slot.status(), SlotStatus::Loading);
        assert!(slot.job().is_none());

        slot.set_source("");
        assert_eq!(slot.status(), SlotStatus::Null);
        assert!(slot.source().is_none());
    }
}
