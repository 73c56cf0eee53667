//! Application main loop
//!
//! The main thread plays the view: it owns the image slots and reacts to
//! cache notifications. Texture work and cache ticks run on the render
//! thread, one call per simulated frame.

use anyhow::{bail, Context, Result};
use app_core::{
    is_supported_image, AppConfig, AppError, CacheEntry, CacheRegistry, DecodedImage, ImageCache,
    ImageLoader, ImageSlot, Job, RenderThread, Size, SlotStatus, SurfaceId, TextureFactory,
};
use clap::Parser;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Page through a directory of images with the QuickView loader and cache
#[derive(Parser, Debug)]
#[command(name = "quickview", version, about)]
pub struct Args {
    /// Directory of images, or a single image file
    pub path: PathBuf,

    /// Display size in pixels, as WIDTHxHEIGHT (either side may be 0)
    #[arg(long, default_value = "1920x1080", value_parser = parse_size)]
    pub size: Size,

    /// Number of following images to prefetch
    #[arg(long, default_value_t = 2)]
    pub prefetch: usize,

    /// Decode worker threads (overrides the configuration)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Cache soft limit in megabytes (overrides the configuration)
    #[arg(long)]
    pub cache_mb: Option<u64>,

    /// Frame interval in milliseconds
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// Give up on an image after this many milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    pub save_config: bool,
}

impl Args {
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(threads) = self.threads {
            config.loader.worker_threads = Some(threads);
        }
        if let Some(mb) = self.cache_mb {
            config.cache.soft_limit_mb = mb;
        }
    }
}

fn parse_size(s: &str) -> Result<Size, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {:?}", s))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid dimension {:?}: {}", v, e))
    };
    Ok(Size::new(parse(w)?, parse(h)?))
}

/// Texture stand-in for running without a GPU: records the upload only.
#[derive(Debug)]
pub struct HeadlessTexture {
    pub size: Size,
}

#[derive(Default)]
pub struct UploadCounters {
    uploads: AtomicUsize,
    releases: AtomicUsize,
    uploaded_bytes: AtomicU64,
}

/// Counts texture uploads and the bytes they would have moved.
#[derive(Clone, Default)]
pub struct HeadlessFactory(Arc<UploadCounters>);

impl TextureFactory for HeadlessFactory {
    type Texture = HeadlessTexture;

    fn create_texture(&self, image: &DecodedImage) -> Result<HeadlessTexture, AppError> {
        self.0.uploads.fetch_add(1, Ordering::Relaxed);
        self.0
            .uploaded_bytes
            .fetch_add(image.byte_size() as u64, Ordering::Relaxed);
        Ok(HeadlessTexture { size: image.size() })
    }

    fn release_texture(&self, _texture: Arc<HeadlessTexture>) {
        self.0.releases.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-image outcome printed in the report
struct PageReport {
    name: String,
    status: SlotStatus,
    natural: Size,
    loaded: Size,
    shown_after: Duration,
    job: Option<Job>,
    error: Option<String>,
}

impl PageReport {
    fn print(&self) {
        let timing = match self.job.as_ref().map(Job::stats) {
            Some(stats) => format!(
                "queued {:>6.1?} at #{}, decoded {:>8.1?}",
                stats.queue_wait().unwrap_or_default(),
                stats.queue_position,
                stats.decode_time().unwrap_or_default()
            ),
            None => "cache hit".to_string(),
        };
        match &self.error {
            Some(error) => println!("{:<40} {:?}: {}", self.name, self.status, error),
            None => println!(
                "{:<40} {:?} {:>11} as {:>11} in {:>8.1?} ({})",
                self.name,
                self.status,
                self.natural.to_string(),
                self.loaded.to_string(),
                self.shown_after,
                timing
            ),
        }
    }
}

/// Run the application
pub fn run(args: &Args, config: &AppConfig, loader: &Arc<ImageLoader>) -> Result<()> {
    let images = collect_images(&args.path)?;
    if images.is_empty() {
        bail!("No supported images found in {}", args.path.display());
    }
    tracing::info!(
        "Paging through {} images at {} with {} decode workers",
        images.len(),
        args.size,
        loader.worker_count()
    );

    let render = RenderThread::spawn("render")?;
    let factory = HeadlessFactory::default();
    let registry = {
        let factory = factory.clone();
        CacheRegistry::new(config.cache.clone(), &render, move |_| factory.clone())
    };
    let cache = registry.for_surface(SurfaceId(0));

    let keys: Vec<String> = images
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let frame = Duration::from_millis(args.frame_ms.max(1));
    let timeout = Duration::from_millis(args.timeout_ms);

    // Front slot is the image on screen, the rest are prefetches.
    let mut window: VecDeque<ImageSlot<HeadlessFactory>> = VecDeque::new();
    let mut next = 0;
    let started = Instant::now();

    for index in 0..keys.len() {
        while next < keys.len() && next <= index + args.prefetch {
            let mut slot = ImageSlot::new(loader.clone(), cache.clone());
            slot.set_target_size(args.size);
            slot.set_source(&keys[next]);
            window.push_back(slot);
            next += 1;
        }

        let shown_at = Instant::now();
        let job = window.front().and_then(|s| s.job().cloned());
        loop {
            for slot in window.iter_mut() {
                slot.process_notifications();
            }
            let current = window.front().context("Empty view window")?;
            paint_frame(&render, &cache, current.entry().cloned())?;

            if current.status() != SlotStatus::Loading && current.job().is_none() {
                break;
            }
            if shown_at.elapsed() > timeout {
                tracing::warn!("Timed out waiting for {}", keys[index]);
                break;
            }
            std::thread::sleep(frame);
        }

        let current = window.pop_front().context("Empty view window")?;
        PageReport {
            name: display_name(&images[index]),
            status: current.status(),
            natural: current.image_size(),
            loaded: current.loaded_size(),
            shown_after: shown_at.elapsed(),
            job,
            error: current.error(),
        }
        .print();
    }

    drop(window);
    let swept = {
        let cache = cache.clone();
        render.call(move || cache.sweep())??
    };
    let stats = cache.stats();

    println!();
    println!(
        "{} images in {:.2?}; {} texture uploads ({:.1} MiB), {} released",
        keys.len(),
        started.elapsed(),
        factory.0.uploads.load(Ordering::Relaxed),
        factory.0.uploaded_bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0),
        factory.0.releases.load(Ordering::Relaxed)
    );
    println!(
        "cache: {} entries, {} evictable, {:.1} of {:.1} MiB; final sweep freed {} entries",
        stats.entries,
        stats.freeable,
        stats.total_cost as f64 / (1024.0 * 1024.0),
        stats.soft_limit as f64 / (1024.0 * 1024.0),
        swept.freed_entries
    );

    // Textures must be destroyed on the render thread.
    registry.remove(SurfaceId(0));
    render.call(move || drop(cache))?;
    Ok(())
}

/// Upload the visible texture and tick the cache on the render thread.
fn paint_frame(
    render: &RenderThread,
    cache: &ImageCache<HeadlessFactory>,
    visible: Option<CacheEntry<HeadlessFactory>>,
) -> Result<()> {
    let cache = cache.clone();
    render.call(move || -> Result<(), AppError> {
        if let Some(entry) = visible {
            if let Some(texture) = entry.texture()? {
                tracing::trace!("Drawing {} at {}", entry.key(), texture.size);
            }
        }
        if let Some(stats) = cache.frame_tick()? {
            tracing::debug!("Frame sweep: {:?}", stats);
        }
        Ok(())
    })??;
    Ok(())
}

fn collect_images(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut images: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Cannot read directory {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_supported_image(p))
        .collect();
    images.sort();
    Ok(images)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
