/// Forwards every Nth raw frame to recognition and discards the rest.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    every_n: u64,
    seen: u64,
}

impl FrameSampler {
    /// `every_n` of 0 is treated as 1 (process every frame).
    pub fn new(every_n: u32) -> Self {
        Self {
            every_n: u64::from(every_n.max(1)),
            seen: 0,
        }
    }

    /// Count one raw frame; returns true if it should be processed.
    pub fn admit(&mut self) -> bool {
        self.seen = self.seen.wrapping_add(1);
        self.seen % self.every_n == 0
    }

    /// Total raw frames counted so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }
}
