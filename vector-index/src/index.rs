use std::cmp::Ordering;

use common::error::AppError;

/// One search result: a live slot, its chunk id and the dot-product score.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub slot: u64,
    pub chunk_id: String,
    pub score: f32,
}

/// Append-only inner-product index over unit vectors for a single tenant.
///
/// Slots are stable between compactions. Removal tombstones a slot; once
/// more than a quarter of the slots are tombstoned, `compact` rewrites the
/// storage densely and returns the slot remap for the chunk-row rewrite.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
    slots: Vec<Option<String>>,
    tombstones: usize,
}

const COMPACTION_THRESHOLD: f64 = 0.25;

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
            slots: Vec::new(),
            tombstones: 0,
        }
    }

    pub(crate) fn from_parts(
        dimension: usize,
        data: Vec<f32>,
        slots: Vec<Option<String>>,
    ) -> Result<Self, AppError> {
        if data.len() != slots.len() * dimension {
            return Err(AppError::Unavailable(format!(
                "vector index shape mismatch: {} floats for {} slots of dimension {}",
                data.len(),
                slots.len(),
                dimension
            )));
        }
        let tombstones = slots.iter().filter(|s| s.is_none()).count();
        Ok(Self {
            dimension,
            data,
            slots,
            tombstones,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Total slots including tombstones.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.tombstones
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    pub fn chunk_id_at(&self, slot: u64) -> Option<&str> {
        self.slots
            .get(usize::try_from(slot).ok()?)
            .and_then(|entry| entry.as_deref())
    }

    pub(crate) fn raw_data(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn raw_slots(&self) -> &[Option<String>] {
        &self.slots
    }

    /// Appends vectors contiguously and returns the assigned slots.
    pub fn upsert(
        &mut self,
        vectors: &[Vec<f32>],
        chunk_ids: &[String],
    ) -> Result<Vec<u64>, AppError> {
        if vectors.len() != chunk_ids.len() {
            return Err(AppError::Validation(format!(
                "{} vectors for {} chunk ids",
                vectors.len(),
                chunk_ids.len()
            )));
        }

        let mut assigned = Vec::with_capacity(vectors.len());
        for (vector, chunk_id) in vectors.iter().zip(chunk_ids) {
            if vector.len() != self.dimension {
                return Err(AppError::Validation(format!(
                    "vector dimension {} does not match index dimension {}",
                    vector.len(),
                    self.dimension
                )));
            }
            let slot = self.slots.len() as u64;
            self.data.extend_from_slice(vector);
            self.slots.push(Some(chunk_id.clone()));
            assigned.push(slot);
        }
        Ok(assigned)
    }

    /// Top-k by dot product over live slots. Ties break toward the smaller
    /// slot, which keeps result order reproducible across runs.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, AppError> {
        if query.len() != self.dimension {
            return Err(AppError::Validation(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                let chunk_id = entry.as_ref()?;
                let offset = slot * self.dimension;
                let score = dot(&self.data[offset..offset + self.dimension], query);
                Some(SearchHit {
                    slot: slot as u64,
                    chunk_id: chunk_id.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.slot.cmp(&b.slot))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Logically removes slots; unknown or already-dead slots are ignored.
    pub fn remove(&mut self, slots: &[u64]) {
        for slot in slots {
            if let Ok(i) = usize::try_from(*slot) {
                if let Some(entry) = self.slots.get_mut(i) {
                    if entry.take().is_some() {
                        self.tombstones += 1;
                    }
                }
            }
        }
    }

    pub fn needs_compaction(&self) -> bool {
        !self.slots.is_empty()
            && (self.tombstones as f64) / (self.slots.len() as f64) > COMPACTION_THRESHOLD
    }

    /// Rewrites storage densely. Returns `(chunk_id, old_slot, new_slot)`
    /// for every surviving vector so callers can rewrite chunk rows in one
    /// transaction before the new pair is persisted.
    pub fn compact(&mut self) -> Vec<(String, u64, u64)> {
        let mut remap = Vec::with_capacity(self.live_count());
        let mut data = Vec::with_capacity(self.live_count() * self.dimension);
        let mut slots = Vec::with_capacity(self.live_count());

        for (old_slot, entry) in self.slots.iter().enumerate() {
            if let Some(chunk_id) = entry {
                let new_slot = slots.len() as u64;
                let offset = old_slot * self.dimension;
                data.extend_from_slice(&self.data[offset..offset + self.dimension]);
                slots.push(Some(chunk_id.clone()));
                remap.push((chunk_id.clone(), old_slot as u64, new_slot));
            }
        }

        self.data = data;
        self.slots = slots;
        self.tombstones = 0;
        remap
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
