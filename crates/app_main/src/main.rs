//! QuickView - headless image paging driver
//!
//! Pages through a directory of images the way a viewer would, reporting
//! per-image load timings and cache statistics.

mod app;

use anyhow::Result;
use app_core::ImageLoader;
use clap::Parser;
use std::sync::Arc;

fn main() -> Result<()> {
    let args = app::Args::parse();

    // Initialize logging and panic hook first
    let _log_guard = app_log::init()?;

    // Clean up old logs (7 days)
    if let Err(e) = app_log::cleanup_old_logs(7) {
        tracing::warn!("Failed to cleanup old logs: {}", e);
    }

    tracing::info!("QuickView starting...");

    // Load configuration
    let mut config = app_core::AppConfig::load()?;
    args.apply_to(&mut config);
    if args.save_config {
        config.save()?;
    }

    let loader = Arc::new(ImageLoader::with_image_backend(&config.loader));

    // Run the application
    let result = app::run(&args, &config, &loader);
    loader.shutdown();
    result
}
