use std::sync::atomic::{AtomicU64, Ordering};

use dmf_common::error::{MfError, Result};

/// ~2^31 tags per run before `ResourceExhaustion` (spec §7). Tags identify
/// channel endpoints; they are never reused within a run.
pub const MAX_TAGS: u64 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

/// Monotonic tag generator, one per `TaskManager` (spec §4.1).
#[derive(Debug, Default)]
pub struct TagAllocator {
    next: AtomicU64,
}

impl TagAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn alloc(&self) -> Result<Tag> {
        let tag = self.next.fetch_add(1, Ordering::Relaxed);
        if tag >= MAX_TAGS {
            return Err(MfError::ResourceExhaustion(
                "tag allocator exhausted its ~2^31 tag budget for this run".into(),
            ));
        }
        Ok(Tag(tag))
    }

    pub fn alloc_n(&self, n: usize) -> Result<Vec<Tag>> {
        (0..n).map(|_| self.alloc()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_monotonic_and_unique() {
        let a = TagAllocator::new();
        let tags = a.alloc_n(10).unwrap();
        for w in tags.windows(2) {
            assert!(w[0].0 < w[1].0);
        }
    }

    #[test]
    fn exhaustion_is_reported() {
        let a = TagAllocator {
            next: AtomicU64::new(MAX_TAGS),
        };
        assert!(a.alloc().is_err());
    }
}
