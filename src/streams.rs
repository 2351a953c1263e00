use std::collections::HashSet;

/// Tracks which streams have an unfinished kernel.
///
/// Kernels of one stream execute in launch order: a kernel may only launch
/// once its stream is idle.
#[derive(Debug, Default)]
pub struct StreamManager {
    busy_streams: HashSet<u64>,
}

impl StreamManager {
    pub fn reserve_stream(&mut self, id: u64) {
        self.busy_streams.insert(id);
    }

    pub fn release_stream(&mut self, id: u64) {
        self.busy_streams.remove(&id);
    }

    #[must_use]
    pub fn is_busy(&self, id: u64) -> bool {
        self.busy_streams.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::StreamManager;

    #[test]
    fn stream_serialization() {
        let mut streams = StreamManager::default();
        assert!(!streams.is_busy(0));
        streams.reserve_stream(0);
        assert!(streams.is_busy(0));
        assert!(!streams.is_busy(1));
        streams.release_stream(0);
        assert!(!streams.is_busy(0));
    }
}
