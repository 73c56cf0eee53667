mod common;

use app_core::{
    AppError, DecodedImage, ImageCache, ImageLoader, ImageSlot, Job, LoaderConfig, RenderThread,
    Size, SlotStatus, TextureFactory,
};
use common::{ScriptedBackend, TIMEOUT};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;
use tempfile::TempDir;

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    released: AtomicUsize,
    release_threads: Mutex<Vec<ThreadId>>,
}

/// Textures are just the image size; creations and releases are counted.
#[derive(Clone, Default)]
struct CountingFactory(Arc<Counters>);

impl TextureFactory for CountingFactory {
    type Texture = Size;

    fn create_texture(&self, image: &DecodedImage) -> Result<Size, AppError> {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        Ok(image.size())
    }

    fn release_texture(&self, _texture: Arc<Size>) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
        self.0.release_threads.lock().push(std::thread::current().id());
    }
}

fn single_worker() -> LoaderConfig {
    LoaderConfig {
        worker_threads: Some(1),
    }
}

/// Pump the slot's notifications until it leaves the loading state.
fn wait_settled<F: TextureFactory>(slot: &mut ImageSlot<F>) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        slot.process_notifications();
        if slot.status() != SlotStatus::Loading && slot.job().is_none() {
            return;
        }
        assert!(Instant::now() < deadline, "slot never settled");
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
}

#[test]
fn test_slot_loads_then_upgrades_resolution() {
    let backend = Arc::new(ScriptedBackend::new(&[("a.jpg", Size::new(800, 800))]));
    let loader = Arc::new(ImageLoader::new(backend.clone(), &single_worker()));
    let factory = CountingFactory::default();
    let cache = ImageCache::with_limits(factory.clone(), u64::MAX, 1, std::thread::current().id());

    let mut slot = ImageSlot::new(loader, cache.clone());
    slot.set_target_size(Size::new(200, 200));
    slot.set_source("a.jpg");
    assert_eq!(slot.status(), SlotStatus::Loading);
    wait_settled(&mut slot);

    assert_eq!(slot.status(), SlotStatus::Ready);
    assert_eq!(slot.loaded_size(), Size::new(200, 200));
    assert_eq!(slot.image_size(), Size::new(800, 800));
    assert_eq!(*slot.texture().unwrap().unwrap(), Size::new(200, 200));

    // Growing the target past the loaded size asks for a larger decode.
    slot.set_target_size(Size::new(400, 400));
    assert!(slot.job().is_some());
    wait_settled(&mut slot);
    assert_eq!(slot.loaded_size(), Size::new(400, 400));
    assert_eq!(backend.decode_count("a.jpg"), 2);

    // The old texture is released on the next sweep, the new one created lazily.
    assert_eq!(*slot.texture().unwrap().unwrap(), Size::new(400, 400));
    cache.sweep().unwrap();
    assert_eq!(factory.0.created.load(Ordering::SeqCst), 2);
    assert_eq!(factory.0.released.load(Ordering::SeqCst), 1);

    // Shrinking never reloads.
    slot.set_target_size(Size::new(100, 100));
    assert!(slot.job().is_none());
}

#[test]
fn test_smaller_insert_keeps_queued_job() {
    let backend = Arc::new(ScriptedBackend::gated(&[
        ("blocker", Size::new(10, 10)),
        ("a.jpg", Size::new(800, 800)),
        ("b.jpg", Size::new(10, 10)),
    ]));
    let loader = Arc::new(ImageLoader::new(backend.clone(), &single_worker()));
    let cache = ImageCache::with_limits(
        CountingFactory::default(),
        u64::MAX,
        1,
        std::thread::current().id(),
    );

    let _blocker = loader.enqueue("blocker", Size::ZERO, 0, |_: &Job| {});
    backend.wait_entered("blocker");

    let mut slot = ImageSlot::new(loader.clone(), cache.clone());
    slot.set_target_size(Size::new(400, 400));
    slot.set_source("a.jpg");
    let queued = slot.job().cloned().unwrap();
    let _later = loader.enqueue("b.jpg", Size::ZERO, 0, |_: &Job| {});

    // Someone else caches a smaller decode of the same image.
    let small = Arc::new(DecodedImage::filled(100, 100, [0, 0, 0, 255]));
    cache.insert_image("a.jpg", small, Size::new(800, 800));
    assert_eq!(slot.process_notifications(), 1);
    assert_eq!(slot.status(), SlotStatus::Ready);
    assert!(slot.job().unwrap().ptr_eq(&queued));
    assert_eq!(loader.pending_groups(), 2);

    backend.open_gate();
    wait_settled(&mut slot);
    assert_eq!(slot.loaded_size(), Size::new(400, 400));
    let order: Vec<String> = backend.decodes().into_iter().map(|(k, _)| k).collect();
    assert_eq!(order[..2], ["blocker", "a.jpg"]);
}

#[test]
fn test_second_slot_hits_cache() {
    let backend = Arc::new(ScriptedBackend::new(&[("a.jpg", Size::new(300, 300))]));
    let loader = Arc::new(ImageLoader::new(backend.clone(), &single_worker()));
    let cache = ImageCache::with_limits(
        CountingFactory::default(),
        u64::MAX,
        1,
        std::thread::current().id(),
    );

    let mut first = ImageSlot::new(loader.clone(), cache.clone());
    first.set_target_size(Size::new(300, 300));
    first.set_source("a.jpg");
    wait_settled(&mut first);

    let mut second = ImageSlot::new(loader, cache);
    second.set_target_size(Size::new(150, 150));
    second.set_source("a.jpg");
    assert_eq!(second.status(), SlotStatus::Ready);
    assert!(second.job().is_none());
    assert!(first.entry().unwrap().ptr_eq(second.entry().unwrap()));
    assert_eq!(backend.decode_count("a.jpg"), 1);
}

#[test]
fn test_render_thread_owns_textures() {
    let render = RenderThread::spawn("test-render").unwrap();
    let factory = CountingFactory::default();
    let cache = ImageCache::with_limits(factory.clone(), 0, 1, &render);

    let backend = Arc::new(ScriptedBackend::new(&[("a.jpg", Size::new(64, 64))]));
    let loader = ImageLoader::new(backend, &single_worker());
    let changes = cache.subscribe();

    let entry = cache.get("a.jpg");
    let sink = cache.clone();
    let _job = loader.enqueue("a.jpg", Size::ZERO, 0, move |job: &Job| {
        sink.insert_image("a.jpg", job.image().unwrap(), job.natural_size().unwrap());
    });
    assert_eq!(changes.recv_timeout(TIMEOUT).unwrap(), "a.jpg");

    // Off the render thread, textures are refused.
    assert!(matches!(entry.texture(), Err(AppError::ThreadAffinity(_))));

    let on_render = entry.clone();
    let size = render
        .call(move || on_render.texture().map(|t| t.map(|t| *t)))
        .unwrap()
        .unwrap();
    assert_eq!(size, Some(Size::new(64, 64)));

    // Still referenced, so over-budget sweeps keep it.
    let sweeper = cache.clone();
    let stats = render.call(move || sweeper.sweep()).unwrap().unwrap();
    assert_eq!(stats.freed_entries, 0);

    drop(entry);
    let sweeper = cache.clone();
    let stats = render.call(move || sweeper.sweep()).unwrap().unwrap();
    assert_eq!(stats.freed_entries, 1);
    assert_eq!(stats.released_textures, 1);
    assert_eq!(factory.0.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cache_torn_down_off_render_thread() {
    let render = RenderThread::spawn("test-render").unwrap();
    let factory = CountingFactory::default();
    let cache = ImageCache::with_limits(factory.clone(), u64::MAX, 1, &render);

    let backend = Arc::new(ScriptedBackend::new(&[("a.jpg", Size::new(64, 64))]));
    let loader = Arc::new(ImageLoader::new(backend, &single_worker()));
    let mut slot = ImageSlot::new(loader.clone(), cache.clone());
    slot.set_target_size(Size::new(64, 64));
    slot.set_source("a.jpg");
    wait_settled(&mut slot);
    assert_eq!(slot.status(), SlotStatus::Ready);

    let entry = slot.entry().cloned().unwrap();
    render
        .call(move || entry.texture().map(|t| t.is_some()))
        .unwrap()
        .unwrap();
    assert_eq!(factory.0.created.load(Ordering::SeqCst), 1);

    // Everything that holds the cache goes away on the test thread.
    drop(slot);
    drop(cache);
    drop(loader);
    render.call(|| ()).unwrap();

    assert_eq!(factory.0.released.load(Ordering::SeqCst), 1);
    assert_eq!(*factory.0.release_threads.lock(), [render.id()]);
}

#[test]
fn test_loaded_images_respect_cache_budget() {
    let images: Vec<(String, Size)> = (0..6)
        .map(|i| (format!("{}.jpg", i), Size::new(100, 100)))
        .collect();
    let refs: Vec<(&str, Size)> = images.iter().map(|(k, s)| (k.as_str(), *s)).collect();
    let backend = Arc::new(ScriptedBackend::new(&refs));
    let loader = ImageLoader::new(backend, &LoaderConfig { worker_threads: Some(2) });

    // Each decoded image is 100x100 RGBA = 40_000 bytes.
    let cache = ImageCache::with_limits(
        CountingFactory::default(),
        100_000,
        1,
        std::thread::current().id(),
    );
    let changes = cache.subscribe();

    let jobs: Vec<Job> = images
        .iter()
        .map(|(key, _)| {
            let sink = cache.clone();
            let key = key.clone();
            loader.enqueue(key.clone(), Size::ZERO, 0, move |job: &Job| {
                sink.insert_image(&key, job.image().unwrap(), job.natural_size().unwrap());
            })
        })
        .collect();
    for _ in 0..jobs.len() {
        changes.recv_timeout(TIMEOUT).unwrap();
    }
    assert_eq!(cache.total_cost(), 240_000);

    let held = cache.get("5.jpg");
    let stats = cache.sweep().unwrap();
    assert!(stats.remaining_cost <= 100_000);
    assert_eq!(held.cost(), 40_000);
    assert!(cache.contains("5.jpg"));
}

#[test]
fn test_image_backend_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("photo.png");
    image::RgbaImage::from_pixel(64, 48, image::Rgba([10, 20, 30, 255]))
        .save(&path)
        .unwrap();
    let key = path.to_string_lossy().into_owned();

    let loader = ImageLoader::with_image_backend(&single_worker());
    let (tx, rx) = crossbeam_channel::bounded(1);
    let _job = loader.enqueue(key.as_str(), Size::new(16, 12), 0, move |job: &Job| {
        let _ = tx.send((job.image().map(|i| i.size()), job.natural_size()));
    });

    let (loaded, natural) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(natural, Some(Size::new(64, 48)));
    assert_eq!(loaded, Some(Size::new(16, 12)));
}
