//! Per-surface cache registry
//!
//! Textures belong to the graphics context of the surface they were created
//! for, so each surface gets its own [`ImageCache`].

use crate::config::CacheConfig;
use crate::resource::TextureFactory;
use crate::texture_cache::{CacheOwner, ImageCache, SweepStats};
use crate::AppError;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Identifies a render surface (a window or an offscreen target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

type FactoryFn<F> = dyn Fn(SurfaceId) -> F + Send + Sync;

pub struct CacheRegistry<F: TextureFactory> {
    caches: DashMap<SurfaceId, ImageCache<F>>,
    make_factory: Arc<FactoryFn<F>>,
    config: CacheConfig,
    owner: CacheOwner,
}

impl<F: TextureFactory> CacheRegistry<F> {
    /// `make_factory` builds the texture factory for a newly seen surface.
    pub fn new<M>(config: CacheConfig, owner: impl Into<CacheOwner>, make_factory: M) -> Self
    where
        M: Fn(SurfaceId) -> F + Send + Sync + 'static,
    {
        Self {
            caches: DashMap::new(),
            make_factory: Arc::new(make_factory),
            config,
            owner: owner.into(),
        }
    }

    /// The cache for `surface`, created on first use.
    pub fn for_surface(&self, surface: SurfaceId) -> ImageCache<F> {
        self.caches
            .entry(surface)
            .or_insert_with(|| {
                tracing::debug!("Creating image cache for {}", surface);
                ImageCache::new((self.make_factory)(surface), &self.config, self.owner.clone())
            })
            .clone()
    }

    pub fn get(&self, surface: SurfaceId) -> Option<ImageCache<F>> {
        self.caches.get(&surface).map(|c| c.clone())
    }

    /// Forget the cache for a closed surface. Its textures are released once
    /// the last clone of the cache is dropped.
    pub fn remove(&self, surface: SurfaceId) -> Option<ImageCache<F>> {
        self.caches.remove(&surface).map(|(_, cache)| cache)
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Advance every cache's tick counter. Owning thread only.
    pub fn frame_tick_all(&self) -> Result<Vec<(SurfaceId, SweepStats)>, AppError> {
        // Clone out first so no shard lock is held while sweeping.
        let caches: Vec<(SurfaceId, ImageCache<F>)> = self
            .caches
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut swept = Vec::new();
        for (surface, cache) in caches {
            if let Some(stats) = cache.frame_tick()? {
                swept.push((surface, stats));
            }
        }
        Ok(swept)
    }
}
