use crate::store::{StorePoint, WriteApi};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Store double that records every submitted point and counts flushes.
#[derive(Clone, Default)]
pub struct RecordingStore {
    points: Arc<Mutex<Vec<StorePoint>>>,
    flushes: Arc<AtomicUsize>,
}

impl RecordingStore {
    pub fn points(&self) -> Vec<StorePoint> {
        self.points.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl WriteApi for RecordingStore {
    fn write_point(&self, point: StorePoint) {
        self.points.lock().unwrap().push(point);
    }

    async fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}
