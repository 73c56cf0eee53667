//! Reference-counted image texture cache
//!
//! Entries are created on first lookup and stay in the map until an
//! eviction sweep frees them. An entry is only eligible for eviction while
//! no [`CacheEntry`] handle refers to it.
//!
//! Locking: `main` guards the key map and the running cost, `freeable`
//! guards the eviction candidates. No path holds both; the sweep snapshots
//! the candidates, releases that lock, then takes `main`. Entry fields are
//! only written while `main` is held.
//!
//! Textures are created and destroyed on the owning (render) thread only.
//! Textures displaced by an insert on another thread go through a release
//! channel that the owning thread drains on its next tick. If the last clone
//! of a cache is dropped elsewhere, its textures are posted to the owner's
//! [`RenderHandle`], or leaked when the cache only knows the owner's id.

use crate::config::CacheConfig;
use crate::geometry::Size;
use crate::render_thread::{RenderHandle, RenderThread};
use crate::resource::{DecodedImage, TextureFactory};
use crate::AppError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

/// Cost of an entry without an image.
const MIN_ENTRY_COST: u64 = 1;

/// Key→image cache shared between loader callbacks and the render thread.
pub struct ImageCache<F: TextureFactory> {
    shared: Arc<CacheShared<F>>,
}

impl<F: TextureFactory> Clone for ImageCache<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Thread that owns a cache's textures.
#[derive(Clone)]
pub enum CacheOwner {
    /// Known by id only; textures left at teardown off this thread leak.
    Thread(ThreadId),
    /// A render thread that accepts the release of textures left at teardown.
    Render(RenderHandle),
}

impl CacheOwner {
    pub fn id(&self) -> ThreadId {
        match self {
            CacheOwner::Thread(id) => *id,
            CacheOwner::Render(handle) => handle.id(),
        }
    }
}

impl From<ThreadId> for CacheOwner {
    fn from(id: ThreadId) -> Self {
        CacheOwner::Thread(id)
    }
}

impl From<RenderHandle> for CacheOwner {
    fn from(handle: RenderHandle) -> Self {
        CacheOwner::Render(handle)
    }
}

impl From<&RenderThread> for CacheOwner {
    fn from(render: &RenderThread) -> Self {
        CacheOwner::Render(render.handle())
    }
}

struct CacheShared<F: TextureFactory> {
    main: Mutex<CacheMap<F>>,
    freeable: Mutex<Vec<Arc<CacheData<F>>>>,
    factory: Arc<F>,
    owner: CacheOwner,
    soft_limit: u64,
    sweep_interval: u32,
    ticks: AtomicU32,
    release_tx: Sender<Arc<F::Texture>>,
    release_rx: Receiver<Arc<F::Texture>>,
    subscribers: Mutex<Vec<Sender<String>>>,
}

struct CacheMap<F: TextureFactory> {
    entries: HashMap<String, Arc<CacheData<F>>>,
    total_cost: u64,
}

struct CacheData<F: TextureFactory> {
    key: String,
    cache: Weak<CacheShared<F>>,
    state: Mutex<EntryState<F::Texture>>,
    /// Number of `CacheEntry` handles; the map's own reference is not counted.
    ref_count: AtomicUsize,
    /// Removed from the map by a sweep; never becomes a candidate again.
    evicted: AtomicBool,
}

struct EntryState<T> {
    image: Option<Arc<DecodedImage>>,
    natural_size: Size,
    texture: Option<Arc<T>>,
    error: Option<String>,
    cost: u64,
}

impl<T> EntryState<T> {
    fn empty() -> Self {
        Self {
            image: None,
            natural_size: Size::ZERO,
            texture: None,
            error: None,
            cost: MIN_ENTRY_COST,
        }
    }
}

/// Result of one eviction sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries removed from the cache.
    pub freed_entries: usize,
    /// Cost removed from the cache.
    pub freed_cost: u64,
    /// Total cost left after the sweep.
    pub remaining_cost: u64,
    /// Textures destroyed, including ones displaced by inserts.
    pub released_textures: usize,
}

/// Cache statistics
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub freeable: usize,
    pub total_cost: u64,
    pub soft_limit: u64,
}

impl<F: TextureFactory> ImageCache<F> {
    /// Create a cache whose textures belong to `owner`.
    pub fn new(factory: F, config: &CacheConfig, owner: impl Into<CacheOwner>) -> Self {
        Self::with_limits(factory, config.soft_limit_bytes(), config.sweep_interval_ticks, owner)
    }

    /// Create a cache with an explicit soft limit in cost units (bytes).
    pub fn with_limits(
        factory: F,
        soft_limit: u64,
        sweep_interval_ticks: u32,
        owner: impl Into<CacheOwner>,
    ) -> Self {
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(CacheShared {
                main: Mutex::new(CacheMap {
                    entries: HashMap::new(),
                    total_cost: 0,
                }),
                freeable: Mutex::new(Vec::new()),
                factory: Arc::new(factory),
                owner: owner.into(),
                soft_limit,
                sweep_interval: sweep_interval_ticks.max(1),
                ticks: AtomicU32::new(0),
                release_tx,
                release_rx,
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Look up `key`, creating an empty entry if there is none.
    ///
    /// The returned handle keeps the entry from being evicted. If the key is
    /// inserted later, the same entry is updated.
    pub fn get(&self, key: &str) -> CacheEntry<F> {
        let (data, first_ref) = {
            let mut main = self.shared.main.lock();
            let data = match main.entries.get(key) {
                Some(data) => data.clone(),
                None => {
                    let data = Arc::new(CacheData {
                        key: key.to_string(),
                        cache: Arc::downgrade(&self.shared),
                        state: Mutex::new(EntryState::empty()),
                        ref_count: AtomicUsize::new(0),
                        evicted: AtomicBool::new(false),
                    });
                    main.entries.insert(key.to_string(), data.clone());
                    main.total_cost += MIN_ENTRY_COST;
                    data
                }
            };
            refresh_cost(&mut main, &mut data.state.lock());

            // The 0 -> 1 transition happens under the main lock, so a sweep
            // can never free an entry that is being handed out here.
            let first_ref = data.ref_count.fetch_add(1, Ordering::AcqRel) == 0;
            (data, first_ref)
        };

        if first_ref {
            self.shared.sync_freeable(&data);
        }
        CacheEntry { data }
    }

    /// Store a decoded image for `key` and notify subscribers.
    pub fn insert_image(&self, key: &str, image: Arc<DecodedImage>, natural_size: Size) {
        let entry = self.get(key);
        {
            let mut main = self.shared.main.lock();
            let mut state = entry.data.state.lock();

            let changed = state
                .image
                .as_ref()
                .map_or(true, |old| !Arc::ptr_eq(old, &image));
            state.image = Some(image);
            state.natural_size = natural_size;
            state.error = None;
            if changed {
                self.shared.discard_texture(&mut state);
            }
            refresh_cost(&mut main, &mut state);
        }
        drop(entry);

        tracing::debug!("Cached image for {}", key);
        self.shared.notify(key);
    }

    /// Store a load error for `key` and notify subscribers.
    pub fn insert_error(&self, key: &str, error: impl Into<String>) {
        let entry = self.get(key);
        {
            let mut main = self.shared.main.lock();
            let mut state = entry.data.state.lock();

            state.image = None;
            state.natural_size = Size::ZERO;
            state.error = Some(error.into());
            self.shared.discard_texture(&mut state);
            refresh_cost(&mut main, &mut state);
        }
        drop(entry);

        tracing::debug!("Cached error for {}", key);
        self.shared.notify(key);
    }

    /// Receive the key of every entry changed by an insert from now on.
    pub fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Advance the render tick counter; every `sweep_interval_ticks` ticks an
    /// eviction sweep runs. Owning thread only.
    pub fn frame_tick(&self) -> Result<Option<SweepStats>, AppError> {
        self.shared.check_owner("Cache tick")?;

        let tick = self.shared.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if tick % self.shared.sweep_interval != 0 {
            self.shared.drain_releases();
            return Ok(None);
        }
        self.sweep().map(Some)
    }

    /// Free unreferenced entries until the total cost is under the soft
    /// limit. Owning thread only.
    pub fn sweep(&self) -> Result<SweepStats, AppError> {
        self.shared.check_owner("Cache sweep")?;
        Ok(self.shared.sweep())
    }

    /// Whether `key` is currently an eviction candidate.
    pub fn is_freeable(&self, key: &str) -> bool {
        self.shared
            .freeable
            .lock()
            .iter()
            .any(|data| data.key == key && data.ref_count.load(Ordering::Acquire) == 0)
    }

    /// Whether the map holds an entry for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.shared.main.lock().entries.contains_key(key)
    }

    pub fn total_cost(&self) -> u64 {
        self.shared.main.lock().total_cost
    }

    pub fn soft_limit(&self) -> u64 {
        self.shared.soft_limit
    }

    /// Thread allowed to touch textures.
    pub fn owner(&self) -> ThreadId {
        self.shared.owner.id()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let (entries, total_cost) = {
            let main = self.shared.main.lock();
            (main.entries.len(), main.total_cost)
        };
        let freeable = self.shared.freeable.lock().len();
        CacheStats {
            entries,
            freeable,
            total_cost,
            soft_limit: self.shared.soft_limit,
        }
    }
}

impl<F: TextureFactory> CacheShared<F> {
    fn check_owner(&self, what: &'static str) -> Result<(), AppError> {
        if std::thread::current().id() == self.owner.id() {
            Ok(())
        } else {
            tracing::warn!("{} attempted off the render thread", what);
            Err(AppError::ThreadAffinity(what))
        }
    }

    /// Make the candidate list agree with the entry's current count. Callers
    /// update the count first, so whichever call takes the lock last sees the
    /// final value.
    fn sync_freeable(&self, data: &Arc<CacheData<F>>) {
        let mut list = self.freeable.lock();
        let unreferenced = data.ref_count.load(Ordering::Acquire) == 0
            && !data.evicted.load(Ordering::Acquire);
        let position = list.iter().position(|d| Arc::ptr_eq(d, data));
        match (unreferenced, position) {
            (true, None) => list.push(data.clone()),
            (false, Some(idx)) => {
                list.remove(idx);
            }
            _ => {}
        }
    }

    /// Hand the entry's texture to the owning thread for destruction.
    fn discard_texture(&self, state: &mut EntryState<F::Texture>) {
        if let Some(texture) = state.texture.take() {
            // The receiver lives as long as `self`, so this cannot fail.
            let _ = self.release_tx.send(texture);
        }
    }

    fn drain_releases(&self) -> usize {
        let mut released = 0;
        while let Ok(texture) = self.release_rx.try_recv() {
            self.factory.release_texture(texture);
            released += 1;
        }
        released
    }

    fn notify(&self, key: &str) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(key.to_string()).is_ok());
    }

    fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats {
            released_textures: self.drain_releases(),
            ..SweepStats::default()
        };

        let limit = self.soft_limit;
        let total = self.main.lock().total_cost;
        if total <= limit {
            stats.remaining_cost = total;
            return stats;
        }

        let candidates = std::mem::take(&mut *self.freeable.lock());
        let candidate_count = candidates.len();
        let mut leftover = Vec::new();
        let mut textures = Vec::new();
        {
            let mut main = self.main.lock();
            let mut candidates = candidates.into_iter();
            while main.total_cost > limit {
                let Some(data) = candidates.next() else {
                    break;
                };
                // Re-referenced since the snapshot.
                if data.ref_count.load(Ordering::Acquire) != 0 {
                    leftover.push(data);
                    continue;
                }
                // Stale candidate whose entry was already freed.
                let current = main
                    .entries
                    .get(&data.key)
                    .map_or(false, |d| Arc::ptr_eq(d, &data));
                if !current {
                    continue;
                }

                main.entries.remove(&data.key);
                data.evicted.store(true, Ordering::Release);
                let mut state = data.state.lock();
                main.total_cost = main.total_cost.saturating_sub(state.cost);
                stats.freed_cost += state.cost;
                stats.freed_entries += 1;
                textures.extend(state.texture.take());
                state.cost = 0;
            }
            leftover.extend(candidates);
            stats.remaining_cost = main.total_cost;
        }

        stats.released_textures += textures.len();
        for texture in textures {
            self.factory.release_texture(texture);
        }

        if !leftover.is_empty() {
            let mut list = self.freeable.lock();
            let newer = std::mem::take(&mut *list);
            list.extend(leftover.into_iter().filter(|d| {
                d.ref_count.load(Ordering::Acquire) == 0 && !d.evicted.load(Ordering::Acquire)
            }));
            for data in newer {
                if !list.iter().any(|d| Arc::ptr_eq(d, &data)) {
                    list.push(data);
                }
            }
        }

        tracing::info!(
            "Cache sweep freed {} of {} candidates ({} bytes), {} of {} bytes in use",
            stats.freed_entries,
            candidate_count,
            stats.freed_cost,
            stats.remaining_cost,
            limit
        );
        stats
    }
}

impl<F: TextureFactory> Drop for CacheShared<F> {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut self.main.get_mut().entries);
        let mut textures: Vec<Arc<F::Texture>> = entries
            .into_values()
            .filter_map(|data| {
                let texture = data.state.lock().texture.take();
                texture
            })
            .collect();
        textures.extend(self.release_rx.try_iter());
        if textures.is_empty() {
            return;
        }

        let factory = self.factory.clone();
        let release = move || {
            for texture in textures {
                factory.release_texture(texture);
            }
        };
        if std::thread::current().id() == self.owner.id() {
            release();
            return;
        }

        let reason = match &self.owner {
            CacheOwner::Render(handle) => match handle.try_post(Box::new(release)) {
                Ok(()) => {
                    tracing::debug!("Image cache dropped off the render thread; textures forwarded");
                    return;
                }
                Err(task) => {
                    std::mem::forget(task);
                    "render thread stopped"
                }
            },
            CacheOwner::Thread(_) => {
                std::mem::forget(release);
                "no render handle"
            }
        };
        tracing::error!("Image cache dropped off the render thread ({}); leaking textures", reason);
    }
}

fn refresh_cost<F: TextureFactory>(main: &mut CacheMap<F>, state: &mut EntryState<F::Texture>) {
    let cost = state
        .image
        .as_ref()
        .map_or(MIN_ENTRY_COST, |img| (img.byte_size() as u64).max(MIN_ENTRY_COST));
    main.total_cost = main.total_cost.saturating_sub(state.cost) + cost;
    state.cost = cost;
}

impl<F: TextureFactory> CacheData<F> {
    fn acquire(self: &Arc<Self>) {
        if self.ref_count.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Some(cache) = self.cache.upgrade() {
                cache.sync_freeable(self);
            }
        }
    }

    fn release(self: &Arc<Self>) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cache) = self.cache.upgrade() {
                cache.sync_freeable(self);
            }
        }
    }
}

/// Strong reference to a cache entry.
///
/// While any handle exists the entry is not evicted. Cloning is cheap.
pub struct CacheEntry<F: TextureFactory> {
    data: Arc<CacheData<F>>,
}

impl<F: TextureFactory> Clone for CacheEntry<F> {
    fn clone(&self) -> Self {
        self.data.acquire();
        Self {
            data: self.data.clone(),
        }
    }
}

impl<F: TextureFactory> Drop for CacheEntry<F> {
    fn drop(&mut self) {
        self.data.release();
    }
}

impl<F: TextureFactory> CacheEntry<F> {
    pub fn key(&self) -> &str {
        &self.data.key
    }

    /// Neither an image nor an error has been stored yet.
    pub fn is_empty(&self) -> bool {
        let state = self.data.state.lock();
        state.image.is_none() && state.error.is_none()
    }

    pub fn image(&self) -> Option<Arc<DecodedImage>> {
        self.data.state.lock().image.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.data.state.lock().error.clone()
    }

    /// Size of the decoded image, which may be smaller than its natural size.
    pub fn loaded_size(&self) -> Size {
        self.data
            .state
            .lock()
            .image
            .as_ref()
            .map_or(Size::ZERO, |img| img.size())
    }

    pub fn natural_size(&self) -> Size {
        self.data.state.lock().natural_size
    }

    pub fn cost(&self) -> u64 {
        self.data.state.lock().cost
    }

    /// Both handles refer to the same entry.
    pub fn ptr_eq(&self, other: &CacheEntry<F>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// The texture for the current image, created on first access.
    /// Owning thread only.
    pub fn texture(&self) -> Result<Option<Arc<F::Texture>>, AppError> {
        let Some(cache) = self.data.cache.upgrade() else {
            return Ok(None);
        };
        cache.check_owner("Texture access")?;

        let image = {
            let state = self.data.state.lock();
            if let Some(texture) = &state.texture {
                return Ok(Some(texture.clone()));
            }
            match &state.image {
                Some(image) => image.clone(),
                None => return Ok(None),
            }
        };

        // Upload without holding any lock; install only if the image did not
        // change meanwhile.
        let texture = Arc::new(cache.factory.create_texture(&image)?);
        let stale = {
            let _main = cache.main.lock();
            let mut state = self.data.state.lock();
            let current = state
                .image
                .as_ref()
                .map_or(false, |img| Arc::ptr_eq(img, &image));
            if current && state.texture.is_none() {
                state.texture = Some(texture.clone());
                return Ok(Some(texture));
            }
            state.texture.clone()
        };
        cache.factory.release_texture(texture);
        Ok(stale)
    }
}

impl<F: TextureFactory> fmt::Debug for CacheEntry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.data.state.lock();
        f.debug_struct("CacheEntry")
            .field("key", &self.data.key)
            .field("loaded", &state.image.as_ref().map(|img| img.size()))
            .field("natural_size", &state.natural_size)
            .field("error", &state.error)
            .field("cost", &state.cost)
            .finish()
    }
}
