use crate::error::{QuernError, QuernResult};

/// Model-derived dimensions a cache entry is allocated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheShape {
    pub n_layers: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

impl CacheShape {
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Bytes a cache entry of this shape takes at a given capacity.
    pub fn size_bytes(&self, capacity: usize) -> u64 {
        (self.n_layers * 2 * capacity * self.kv_dim() * std::mem::size_of::<f32>()) as u64
    }
}

/// One session's K/V history.
///
/// Layout per layer: `capacity x kv_dim`, contiguous, keys and values in
/// separate buffers. A forward pass appends the same token count to every
/// layer and then commits once; `current_tokens` moves only at commit, so
/// a cancelled or failed pass leaves the committed history intact.
#[derive(Debug)]
pub struct KvCache {
    shape: CacheShape,
    capacity: usize,
    k: Vec<f32>,
    v: Vec<f32>,
    current: usize,
    pending: usize,
    layers_pending: usize,
}

impl KvCache {
    pub fn new(shape: CacheShape, capacity: usize) -> Self {
        let total = shape.n_layers * capacity * shape.kv_dim();
        Self {
            shape,
            capacity,
            k: vec![0.0; total],
            v: vec![0.0; total],
            current: 0,
            pending: 0,
            layers_pending: 0,
        }
    }

    pub fn shape(&self) -> CacheShape {
        self.shape
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Committed token count. Readers outside an in-flight forward pass see
    /// exactly `[0, current_tokens)`.
    pub fn current_tokens(&self) -> usize {
        self.current
    }

    pub fn size_bytes(&self) -> u64 {
        self.shape.size_bytes(self.capacity)
    }

    fn layer_offset(&self, layer: usize, pos: usize) -> usize {
        (layer * self.capacity + pos) * self.shape.kv_dim()
    }

    /// Stage `count` new positions for `layer` at the append point.
    ///
    /// Every layer of the forward pass appends the same count; the append
    /// point does not move until [`commit`](Self::commit). Fails with
    /// `CacheOverflow` when the entry is full.
    pub fn append_kv(
        &mut self,
        layer: usize,
        keys: &[f32],
        values: &[f32],
        count: usize,
    ) -> QuernResult<()> {
        let kv_dim = self.shape.kv_dim();
        if keys.len() != count * kv_dim || values.len() != count * kv_dim {
            return Err(QuernError::ShapeMismatch(format!(
                "append of {} positions wants {} values per plane, got {}/{}",
                count,
                count * kv_dim,
                keys.len(),
                values.len()
            )));
        }
        if self.current + count > self.capacity {
            return Err(QuernError::CacheOverflow {
                used: self.current,
                appended: count,
                capacity: self.capacity,
            });
        }
        if self.pending != 0 && self.pending != count {
            return Err(QuernError::InvariantViolation(format!(
                "layer {} appended {} positions, earlier layers appended {}",
                layer, count, self.pending
            )));
        }

        let start = self.layer_offset(layer, self.current);
        self.k[start..start + count * kv_dim].copy_from_slice(keys);
        self.v[start..start + count * kv_dim].copy_from_slice(values);
        self.pending = count;
        self.layers_pending += 1;
        Ok(())
    }

    /// Advance the append point after every layer has written.
    pub fn commit(&mut self, count: usize) -> QuernResult<()> {
        if count != self.pending || self.layers_pending != self.shape.n_layers {
            return Err(QuernError::InvariantViolation(format!(
                "commit of {} positions with {} pending across {}/{} layers",
                count, self.pending, self.layers_pending, self.shape.n_layers
            )));
        }
        self.current += count;
        self.pending = 0;
        self.layers_pending = 0;
        Ok(())
    }

    /// Keys for positions `[start, start + len)` of one layer.
    ///
    /// During a forward pass the staged (uncommitted) positions are
    /// readable too; that is how queries attend to the keys their own pass
    /// just produced.
    pub fn get_keys(&self, layer: usize, start: usize, len: usize) -> &[f32] {
        debug_assert!(start + len <= self.current + self.pending);
        let a = self.layer_offset(layer, start);
        let b = self.layer_offset(layer, start + len);
        &self.k[a..b]
    }

    pub fn get_values(&self, layer: usize, start: usize, len: usize) -> &[f32] {
        debug_assert!(start + len <= self.current + self.pending);
        let a = self.layer_offset(layer, start);
        let b = self.layer_offset(layer, start + len);
        &self.v[a..b]
    }

    /// Keep only the most recent `window` positions.
    ///
    /// A pure block copy per layer: the tail moves to the start of the
    /// layer's plane and `current_tokens` becomes `window`. A no-op when
    /// the history already fits.
    pub fn slide(&mut self, window: usize) {
        if self.current <= window {
            return;
        }
        let kv_dim = self.shape.kv_dim();
        let dropped = self.current - window;
        for layer in 0..self.shape.n_layers {
            let src = self.layer_offset(layer, dropped);
            let dst = self.layer_offset(layer, 0);
            self.k.copy_within(src..src + window * kv_dim, dst);
            self.v.copy_within(src..src + window * kv_dim, dst);
        }
        self.current = window;
    }

    /// Drop staged positions after a failed or cancelled forward pass,
    /// leaving the committed history intact.
    pub fn rollback_pending(&mut self) {
        self.pending = 0;
        self.layers_pending = 0;
    }

    /// Forget the history without touching the backing buffers.
    pub fn reset(&mut self) {
        self.current = 0;
        self.pending = 0;
        self.layers_pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> CacheShape {
        CacheShape {
            n_layers: 2,
            n_kv_heads: 2,
            head_dim: 2,
        }
    }

    /// One position of K or V data with a recognizable value.
    fn plane(tag: f32, count: usize) -> Vec<f32> {
        (0..count * 4).map(|i| tag + i as f32 * 0.001).collect()
    }

    fn append_all_layers(cache: &mut KvCache, tag: f32, count: usize) {
        let k = plane(tag, count);
        let v = plane(tag + 0.5, count);
        for layer in 0..2 {
            cache.append_kv(layer, &k, &v, count).unwrap();
        }
        cache.commit(count).unwrap();
    }

    #[test]
    fn test_size_bytes_formula() {
        let cache = KvCache::new(shape(), 8);
        // 2 layers * 2 planes * 8 positions * 4 kv_dim * 4 bytes
        assert_eq!(cache.size_bytes(), 2 * 2 * 8 * 4 * 4);
    }

    #[test]
    fn test_append_then_read_back() {
        let mut cache = KvCache::new(shape(), 8);
        let k = plane(1.0, 3);
        let v = plane(2.0, 3);
        for layer in 0..2 {
            cache.append_kv(layer, &k, &v, 3).unwrap();
        }
        cache.commit(3).unwrap();

        assert_eq!(cache.current_tokens(), 3);
        assert_eq!(cache.get_keys(0, 0, 3), &k[..]);
        assert_eq!(cache.get_values(1, 0, 3), &v[..]);
    }

    #[test]
    fn test_overflow_detected_before_write() {
        let mut cache = KvCache::new(shape(), 4);
        append_all_layers(&mut cache, 0.0, 3);
        let k = plane(9.0, 2);
        let err = cache.append_kv(0, &k, &k, 2).unwrap_err();
        assert!(matches!(
            err,
            QuernError::CacheOverflow {
                used: 3,
                appended: 2,
                capacity: 4
            }
        ));
        // committed history untouched
        assert_eq!(cache.current_tokens(), 3);
    }

    #[test]
    fn test_commit_requires_all_layers() {
        let mut cache = KvCache::new(shape(), 8);
        let k = plane(0.0, 1);
        cache.append_kv(0, &k, &k, 1).unwrap();
        // layer 1 never wrote
        assert!(cache.commit(1).is_err());
    }

    #[test]
    fn test_mismatched_layer_counts_rejected() {
        let mut cache = KvCache::new(shape(), 8);
        let one = plane(0.0, 1);
        let two = plane(0.0, 2);
        cache.append_kv(0, &one, &one, 1).unwrap();
        assert!(cache.append_kv(1, &two, &two, 2).is_err());
    }

    #[test]
    fn test_slide_keeps_tail() {
        let mut cache = KvCache::new(shape(), 8);
        // 8 positions, each tagged by index
        for i in 0..8 {
            append_all_layers(&mut cache, i as f32 * 10.0, 1);
        }
        let expected_tail: Vec<f32> = (4..8)
            .flat_map(|i| plane(i as f32 * 10.0, 1))
            .collect();

        cache.slide(4);
        assert_eq!(cache.current_tokens(), 4);
        assert_eq!(cache.get_keys(0, 0, 4), &expected_tail[..]);
        assert_eq!(cache.get_keys(1, 0, 4), &expected_tail[..]);
    }

    #[test]
    fn test_slide_noop_when_under_window() {
        let mut cache = KvCache::new(shape(), 8);
        append_all_layers(&mut cache, 1.0, 2);
        cache.slide(4);
        assert_eq!(cache.current_tokens(), 2);
    }

    #[test]
    fn test_reset_keeps_buffers() {
        let mut cache = KvCache::new(shape(), 8);
        append_all_layers(&mut cache, 1.0, 4);
        cache.reset();
        assert_eq!(cache.current_tokens(), 0);
        assert_eq!(cache.capacity(), 8);
        // appendable again from position zero
        append_all_layers(&mut cache, 2.0, 1);
        assert_eq!(cache.current_tokens(), 1);
    }

    #[test]
    fn test_pending_positions_readable_before_commit() {
        let mut cache = KvCache::new(shape(), 8);
        let k = plane(3.0, 2);
        cache.append_kv(0, &k, &k, 2).unwrap();
        // attention in the same pass reads the staged span
        assert_eq!(cache.get_keys(0, 0, 2), &k[..]);
        assert_eq!(cache.current_tokens(), 0);
    }
}
