//! Image loading and decoding service
//!
//! Requests are queued as groups of weak job references sharing one key.
//! A request for a key that already has a pending group joins that group,
//! so concurrent requests for the same image share a single decode.

use crate::config::LoaderConfig;
use crate::decode::{DecodeBackend, DecodedFrame, ImageBackend, ImageInfo};
use crate::geometry::Size;
use crate::job::{Job, JobCallback, JobData, JobOutcome};
use crate::resource::DecodedImage;
use crate::scaling::choose_decode_scale;
use crate::AppError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Requests sharing one key, serviced by a single decode.
type JobGroup = Vec<Weak<JobData>>;

/// Image loader service
pub struct ImageLoader {
    shared: Arc<Shared>,
}

struct Shared {
    queue: Mutex<QueueState>,
    cv: Condvar,
    backend: Arc<dyn DecodeBackend>,
    worker_count: usize,
}

struct QueueState {
    groups: VecDeque<JobGroup>,
    stopping: bool,
    workers: Vec<JoinHandle<()>>,
}

/// Result of [`ImageLoader::load`]
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub key: String,
    pub image: Arc<DecodedImage>,
    pub natural_size: Size,
}

impl ImageLoader {
    /// Create a loader decoding through `backend`. Workers start on the
    /// first request.
    pub fn new(backend: Arc<dyn DecodeBackend>, config: &LoaderConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    groups: VecDeque::new(),
                    stopping: false,
                    workers: Vec::new(),
                }),
                cv: Condvar::new(),
                backend,
                worker_count: config.worker_count(),
            }),
        }
    }

    /// Create a loader reading files from disk.
    pub fn with_image_backend(config: &LoaderConfig) -> Self {
        Self::new(Arc::new(ImageBackend::new()), config)
    }

    /// Queue a decode of `key` for drawing at `draw_size`.
    ///
    /// Priority above zero puts a new group at the head of the queue; it does
    /// not reorder groups that are already queued. `callback` runs at most
    /// once, on a worker thread, and only if a handle to the returned job is
    /// still alive when the decode finishes. After [`shutdown`](Self::shutdown)
    /// the job fails at once and the callback runs on the calling thread.
    pub fn enqueue<F>(&self, key: impl Into<String>, draw_size: Size, priority: i32, callback: F) -> Job
    where
        F: FnOnce(&Job) + Send + 'static,
    {
        let callback: JobCallback = Box::new(callback);
        self.submit(JobData::new(key.into(), draw_size, priority, Some(callback)))
    }

    fn submit(&self, data: JobData) -> Job {
        let data = Arc::new(data);

        let mut state = self.shared.queue.lock();
        if state.stopping {
            drop(state);
            tracing::warn!("Image loader is shut down; rejecting {}", data.key);
            data.complete(JobOutcome::Failed(
                AppError::LoaderClosed("Image loader is shut down".into()).to_string(),
            ));
            return Job { d: data };
        }
        let (position, coalesced) = place_in_queue(&mut state.groups, &data);
        data.set_queue_position(position);
        if coalesced {
            tracing::debug!(
                "Enqueued with existing job for {} with draw size {}",
                data.key,
                data.draw_size()
            );
        } else {
            tracing::debug!(
                "Enqueued new job for {} with draw size {} at position {}",
                data.key,
                data.draw_size(),
                position
            );
        }

        if state.workers.is_empty() {
            self.start_workers(&mut state);
        }
        drop(state);
        self.shared.cv.notify_one();

        Job { d: data }
    }

    fn start_workers(&self, state: &mut QueueState) {
        for i in 0..self.shared.worker_count {
            let shared = self.shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("image-loader-{}", i))
                .spawn(move || worker_loop(shared));
            match spawned {
                Ok(handle) => state.workers.push(handle),
                Err(e) => tracing::error!("Failed to spawn image loader worker: {}", e),
            }
        }
        tracing::info!("{} image loader workers started", state.workers.len());
    }

    /// Load an image asynchronously.
    ///
    /// Dropping the returned future before it resolves abandons the request.
    pub async fn load(&self, key: impl Into<String>, draw_size: Size) -> Result<LoadedImage, AppError> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        let _job = self.enqueue(key, draw_size, 0, move |job: &Job| {
            let result = match (job.image(), job.natural_size()) {
                (Some(image), Some(natural_size)) => Ok(LoadedImage {
                    key: job.key().to_string(),
                    image,
                    natural_size,
                }),
                _ => Err(AppError::ImageDecode(
                    job.error().unwrap_or("no image produced").to_string(),
                )),
            };
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| AppError::LoaderClosed("Image loader response failed".into()))?
    }

    /// Number of groups waiting for a worker.
    pub fn pending_groups(&self) -> usize {
        self.shared.queue.lock().groups.len()
    }

    /// Configured number of workers.
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// Whether the worker pool has been started.
    pub fn is_started(&self) -> bool {
        !self.shared.queue.lock().workers.is_empty()
    }

    /// Stop the workers and wait for them to exit. Groups still queued are
    /// never decoded. Called on drop; calling it again does nothing.
    pub fn shutdown(&self) {
        let workers = {
            let mut state = self.shared.queue.lock();
            state.stopping = true;
            std::mem::take(&mut state.workers)
        };
        self.shared.cv.notify_all();
        if workers.is_empty() {
            return;
        }

        let current = std::thread::current().id();
        let mut joined = 0;
        for worker in workers {
            // The last handle may be released from a callback on a worker.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!("Image loader worker panicked");
            }
            joined += 1;
        }
        tracing::info!("{} image loader workers stopped", joined);
    }
}

impl Default for ImageLoader {
    fn default() -> Self {
        Self::with_image_backend(&LoaderConfig::default())
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Add `data` to the group already holding its key, or create a new group
/// at the head (priority > 0) or tail. Returns the group index and whether
/// the job joined an existing group.
fn place_in_queue(groups: &mut VecDeque<JobGroup>, data: &Arc<JobData>) -> (usize, bool) {
    if let Some(idx) = find_group(groups, &data.key) {
        groups[idx].push(Arc::downgrade(data));
        return (idx, true);
    }

    let group = vec![Arc::downgrade(data)];
    if data.priority > 0 {
        groups.push_front(group);
        (0, false)
    } else {
        groups.push_back(group);
        (groups.len() - 1, false)
    }
}

/// Groups hold a single key, so the first live member decides the match.
fn find_group(groups: &VecDeque<JobGroup>, key: &str) -> Option<usize> {
    for (idx, group) in groups.iter().enumerate() {
        for weak in group {
            match weak.upgrade() {
                None => continue,
                Some(job) if job.key == key => return Some(idx),
                Some(_) => break,
            }
        }
    }
    None
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let group = {
            let mut state = shared.queue.lock();
            while !state.stopping && state.groups.is_empty() {
                shared.cv.wait(&mut state);
            }
            if state.stopping {
                break;
            }
            match state.groups.pop_front() {
                Some(group) => group,
                None => continue,
            }
        };

        process_group(shared.backend.as_ref(), &group);
    }
    tracing::debug!("Image loader worker stopped");
}

/// Decode once for every live member of `group` and hand each the result.
fn process_group(backend: &dyn DecodeBackend, group: &JobGroup) {
    let started = Instant::now();

    // Only weak references are held while decoding, so members released in
    // the meantime are skipped at delivery.
    let mut key = None;
    let mut sizes = Vec::with_capacity(group.len());
    for job in group.iter().filter_map(Weak::upgrade) {
        job.mark_started(started);
        key.get_or_insert_with(|| job.key.clone());
        sizes.push(job.draw_size());
    }

    let Some(key) = key else {
        tracing::trace!("Job group aborted before decode");
        return;
    };

    let mut probe = GroupProbe::new(backend, &key);
    let draw_size = union_draw_size(&sizes, || probe.info().map(|info| info.natural_size));

    let outcome = match decode_group(backend, &key, draw_size, &mut probe) {
        Ok(frame) => JobOutcome::Loaded {
            image: Arc::new(frame.image),
            natural_size: frame.natural_size,
        },
        Err(e) => {
            tracing::warn!("Failed to load image {}: {}", key, e);
            JobOutcome::Failed(e.to_string())
        }
    };

    let delivered = group
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|job| job.complete(outcome.clone()))
        .count();

    tracing::debug!(
        "Loaded {} with draw size {} for {} of {} requests in {:?}",
        key,
        draw_size,
        delivered,
        group.len(),
        started.elapsed()
    );
}

/// Combined draw size for a group.
///
/// Takes the per-axis maximum. A size with one zero dimension is completed
/// from the natural aspect ratio; a size with both dimensions zero asks for
/// the full image and overrides everything else (returned as `Size::ZERO`).
fn union_draw_size(sizes: &[Size], mut natural_size: impl FnMut() -> Option<Size>) -> Size {
    let mut union = Size::ZERO;
    for &size in sizes {
        if size.is_null() {
            return Size::ZERO;
        }
        let size = if size.is_partial() {
            match natural_size() {
                Some(natural) => size.fill_aspect(natural),
                None => return Size::ZERO,
            }
        } else {
            size
        };
        union = union.max(size);
    }
    union
}

fn decode_group(
    backend: &dyn DecodeBackend,
    key: &str,
    draw_size: Size,
    probe: &mut GroupProbe<'_>,
) -> Result<DecodedFrame, AppError> {
    if draw_size.is_empty() {
        return backend.decode(key, None);
    }
    let Some(info) = probe.info() else {
        return backend.decode(key, None);
    };

    let scale = choose_decode_scale(info.natural_size, draw_size);
    if scale.is_full() {
        return backend.decode(key, None);
    }

    tracing::debug!(
        "Using scaled decode for {} {} -> {} at {}/8",
        key,
        info.natural_size,
        draw_size,
        scale.eighths
    );
    backend.decode(key, Some(info.to_stored_axes(scale.size)))
}

/// Probes a group's image at most once.
struct GroupProbe<'a> {
    backend: &'a dyn DecodeBackend,
    key: &'a str,
    info: Option<Option<ImageInfo>>,
}

impl<'a> GroupProbe<'a> {
    fn new(backend: &'a dyn DecodeBackend, key: &'a str) -> Self {
        Self {
            backend,
            key,
            info: None,
        }
    }

    fn info(&mut self) -> Option<ImageInfo> {
        let (backend, key) = (self.backend, self.key);
        *self.info.get_or_insert_with(|| match backend.probe(key) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!("Could not read size of {}: {}", key, e);
                None
            }
        })
    }
}
