//! Cache of cast module buffers, keyed by module, device and dtype.
//!
//! Bounded by entry count and cleared wholesale when full. Any placement
//! change invalidates every entry.

use std::collections::HashMap;
use std::sync::Arc;

use super::engine::CastBuffers;
use crate::device::{DType, DeviceId};
use crate::models::WeightsId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CastKey {
    pub weights: WeightsId,
    pub module: String,
    pub device: DeviceId,
    pub dtype: DType,
}

#[derive(Debug)]
pub struct CastCache {
    capacity: usize,
    entries: HashMap<CastKey, Arc<CastBuffers>>,
    hits: u64,
    misses: u64,
}

impl CastCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &CastKey) -> Option<Arc<CastBuffers>> {
        match self.entries.get(key) {
            Some(buffers) => {
                self.hits += 1;
                Some(Arc::clone(buffers))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: CastKey, buffers: Arc<CastBuffers>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            tracing::debug!(entries = self.entries.len(), "cast cache full, clearing");
            self.entries.clear();
        }
        self.entries.insert(key, buffers);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
