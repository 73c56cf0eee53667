//! Shared fixtures for integration tests

#![allow(dead_code)]

use app_core::{AppError, DecodeBackend, DecodedFrame, DecodedImage, ImageInfo, Size};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory backend with fixed natural sizes, given in displayed axes.
/// Keys marked `rotated` are stored transposed, as with an EXIF
/// orientation of 5 to 8.
///
/// Decodes block while the gate is closed, and every decode announces its
/// key on `entered` first so tests know which job a worker is holding.
pub struct ScriptedBackend {
    images: HashMap<String, Size>,
    rotated: HashSet<String>,
    probes: AtomicUsize,
    decodes: Mutex<Vec<(String, Option<Size>)>>,
    gate: Mutex<bool>,
    gate_cv: Condvar,
    entered_tx: Sender<String>,
    entered_rx: Receiver<String>,
}

impl ScriptedBackend {
    pub fn new(images: &[(&str, Size)]) -> Self {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        Self {
            images: images.iter().map(|(k, s)| (k.to_string(), *s)).collect(),
            rotated: HashSet::new(),
            probes: AtomicUsize::new(0),
            decodes: Mutex::new(Vec::new()),
            gate: Mutex::new(true),
            gate_cv: Condvar::new(),
            entered_tx,
            entered_rx,
        }
    }

    /// Start with the gate closed.
    pub fn gated(images: &[(&str, Size)]) -> Self {
        let backend = Self::new(images);
        *backend.gate.lock() = false;
        backend
    }

    /// Mark `key` as stored with its axes swapped.
    pub fn rotated(mut self, key: &str) -> Self {
        self.rotated.insert(key.to_string());
        self
    }

    pub fn open_gate(&self) {
        *self.gate.lock() = true;
        self.gate_cv.notify_all();
    }

    /// Wait until a worker starts decoding `key`.
    pub fn wait_entered(&self, key: &str) {
        loop {
            let entered = self
                .entered_rx
                .recv_timeout(TIMEOUT)
                .expect("no decode started");
            if entered == key {
                return;
            }
        }
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Every decode so far with the size it was asked for, in stored axes.
    pub fn decodes(&self) -> Vec<(String, Option<Size>)> {
        self.decodes.lock().clone()
    }

    pub fn decode_count(&self, key: &str) -> usize {
        self.decodes.lock().iter().filter(|(k, _)| k == key).count()
    }

    fn natural(&self, key: &str) -> Result<Size, AppError> {
        self.images
            .get(key)
            .copied()
            .ok_or_else(|| AppError::FileNotFound(key.to_string()))
    }
}

impl DecodeBackend for ScriptedBackend {
    fn probe(&self, key: &str) -> Result<ImageInfo, AppError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(ImageInfo {
            natural_size: self.natural(key)?,
            transposed: self.rotated.contains(key),
        })
    }

    fn decode(&self, key: &str, scaled_size: Option<Size>) -> Result<DecodedFrame, AppError> {
        let _ = self.entered_tx.send(key.to_string());
        {
            let mut open = self.gate.lock();
            while !*open {
                self.gate_cv.wait(&mut open);
            }
        }

        self.decodes.lock().push((key.to_string(), scaled_size));
        let natural = self.natural(key)?;
        let size = match scaled_size {
            Some(stored) if self.rotated.contains(key) => stored.transposed(),
            Some(stored) => stored,
            None => natural,
        };
        Ok(DecodedFrame {
            image: DecodedImage::filled(size.width, size.height, [255, 0, 0, 255]),
            natural_size: natural,
        })
    }
}
