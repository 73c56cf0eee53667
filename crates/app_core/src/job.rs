//! Load jobs
//!
//! A [`Job`] is a strong reference to a pending or completed request made to
//! the [`ImageLoader`](crate::ImageLoader). The queue only keeps weak
//! references, so a job whose handles are all dropped before a worker
//! reaches it is skipped silently.

use crate::geometry::Size;
use crate::resource::DecodedImage;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Completion callback, invoked at most once on a worker thread.
pub type JobCallback = Box<dyn FnOnce(&Job) + Send + 'static>;

/// Timing and queue statistics for a job.
#[derive(Debug, Clone, Copy)]
pub struct JobStats {
    pub created: Instant,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
    /// Index of the job's group in the queue when it was enqueued.
    pub queue_position: usize,
}

impl JobStats {
    /// Time spent waiting in the queue before a worker picked the job up.
    pub fn queue_wait(&self) -> Option<Duration> {
        self.started.map(|s| s.duration_since(self.created))
    }

    /// Time the worker spent decoding.
    pub fn decode_time(&self) -> Option<Duration> {
        match (self.started, self.finished) {
            (Some(s), Some(f)) => Some(f.duration_since(s)),
            _ => None,
        }
    }

    /// Time from enqueue to completion.
    pub fn total(&self) -> Option<Duration> {
        self.finished.map(|f| f.duration_since(self.created))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum JobOutcome {
    Loaded {
        image: Arc<DecodedImage>,
        natural_size: Size,
    },
    Failed(String),
}

pub(crate) struct JobData {
    pub(crate) key: String,
    pub(crate) priority: i32,
    draw_size: Mutex<Size>,
    callback: Mutex<Option<JobCallback>>,
    outcome: OnceCell<JobOutcome>,
    stats: Mutex<JobStats>,
}

impl JobData {
    pub(crate) fn new(key: String, draw_size: Size, priority: i32, callback: Option<JobCallback>) -> Self {
        Self {
            key,
            priority,
            draw_size: Mutex::new(draw_size),
            callback: Mutex::new(callback),
            outcome: OnceCell::new(),
            stats: Mutex::new(JobStats {
                created: Instant::now(),
                started: None,
                finished: None,
                queue_position: 0,
            }),
        }
    }

    pub(crate) fn draw_size(&self) -> Size {
        *self.draw_size.lock()
    }

    pub(crate) fn set_queue_position(&self, position: usize) {
        self.stats.lock().queue_position = position;
    }

    pub(crate) fn mark_started(&self, at: Instant) {
        self.stats.lock().started.get_or_insert(at);
    }

    /// Store the outcome and run the callback. Returns false if the job was
    /// already finished.
    pub(crate) fn complete(self: &Arc<Self>, outcome: JobOutcome) -> bool {
        if self.outcome.set(outcome).is_err() {
            return false;
        }
        self.stats.lock().finished = Some(Instant::now());

        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(&Job { d: self.clone() });
        }
        true
    }
}

/// Handle to a load request.
#[derive(Clone)]
pub struct Job {
    pub(crate) d: Arc<JobData>,
}

impl Job {
    pub fn key(&self) -> &str {
        &self.d.key
    }

    pub fn priority(&self) -> i32 {
        self.d.priority
    }

    pub fn draw_size(&self) -> Size {
        self.d.draw_size()
    }

    /// Change the requested draw size. Best effort: it has no effect once a
    /// worker has started on the job's group.
    pub fn set_draw_size(&self, size: Size) {
        *self.d.draw_size.lock() = size;
    }

    pub fn is_finished(&self) -> bool {
        self.d.outcome.get().is_some()
    }

    /// The decoded image, if the job finished successfully.
    pub fn image(&self) -> Option<Arc<DecodedImage>> {
        match self.d.outcome.get() {
            Some(JobOutcome::Loaded { image, .. }) => Some(image.clone()),
            _ => None,
        }
    }

    /// Natural size of the source image, if the job finished successfully.
    pub fn natural_size(&self) -> Option<Size> {
        match self.d.outcome.get() {
            Some(JobOutcome::Loaded { natural_size, .. }) => Some(*natural_size),
            _ => None,
        }
    }

    /// Error message, if the job failed.
    pub fn error(&self) -> Option<&str> {
        match self.d.outcome.get() {
            Some(JobOutcome::Failed(msg)) => Some(msg),
            _ => None,
        }
    }

    pub fn stats(&self) -> JobStats {
        *self.d.stats.lock()
    }

    /// Both handles refer to the same request.
    pub fn ptr_eq(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.d, &other.d)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.d.key)
            .field("draw_size", &self.draw_size())
            .field("priority", &self.d.priority)
            .field("finished", &self.is_finished())
            .finish()
    }
}
