//! Dedicated thread that owns render resources
//!
//! Texture creation and destruction must happen on one thread. Other threads
//! reach it by posting closures through a task channel.

use crate::AppError;
use crossbeam_channel::{SendError, Sender};
use std::thread::{JoinHandle, ThreadId};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Stop,
}

pub struct RenderThread {
    handle: RenderHandle,
    thread: Option<JoinHandle<()>>,
}

/// Cloneable sender for the render thread's task queue.
///
/// A handle does not keep the thread alive; once the [`RenderThread`] is
/// dropped, posting fails with [`AppError::RenderThreadStopped`].
#[derive(Clone)]
pub struct RenderHandle {
    tx: Sender<Message>,
    id: ThreadId,
}

impl RenderThread {
    /// Start the thread. It runs until the `RenderThread` is dropped.
    pub fn spawn(name: &str) -> Result<Self, AppError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Message>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::debug!("Render thread started");
                for message in rx {
                    match message {
                        Message::Run(task) => task(),
                        Message::Stop => break,
                    }
                }
                tracing::debug!("Render thread stopped");
            })
            .map_err(|e| AppError::Init(format!("Failed to spawn render thread: {}", e)))?;

        Ok(Self {
            handle: RenderHandle {
                tx,
                id: thread.thread().id(),
            },
            thread: Some(thread),
        })
    }

    /// Thread id to hand to caches created for this thread.
    pub fn id(&self) -> ThreadId {
        self.handle.id
    }

    pub fn handle(&self) -> RenderHandle {
        self.handle.clone()
    }

    pub fn is_current(&self) -> bool {
        self.handle.is_current()
    }

    /// Run `task` on the render thread without waiting for it.
    pub fn post<T>(&self, task: T) -> Result<(), AppError>
    where
        T: FnOnce() + Send + 'static,
    {
        self.handle.post(task)
    }

    /// Run `task` on the render thread and wait for its result.
    ///
    /// Called from the render thread itself, the task runs inline.
    pub fn call<T, R>(&self, task: T) -> Result<R, AppError>
    where
        T: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(task());
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.post(move || {
            let _ = reply_tx.send(task());
        })?;
        reply_rx.recv().map_err(|_| AppError::RenderThreadStopped)
    }
}

impl RenderHandle {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.id
    }

    /// Run `task` on the render thread without waiting for it.
    pub fn post<T>(&self, task: T) -> Result<(), AppError>
    where
        T: FnOnce() + Send + 'static,
    {
        self.try_post(Box::new(task))
            .map_err(|_| AppError::RenderThreadStopped)
    }

    /// Like `post`, but hands the task back if the thread has stopped.
    pub(crate) fn try_post(&self, task: Task) -> Result<(), Task> {
        match self.tx.send(Message::Run(task)) {
            Err(SendError(Message::Run(task))) => Err(task),
            _ => Ok(()),
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        // Tasks posted before this point still run; later posts fail once
        // the loop exits and drops the receiver.
        let _ = self.handle.tx.send(Message::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("Render thread panicked");
            }
        }
    }
}
