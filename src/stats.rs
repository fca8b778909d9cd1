use std::sync::atomic::{AtomicU64, Ordering};

// Session-wide transfer totals, shared between the coordinator and every
// peer session. They feed tracker accounting, so eventual consistency is
// all that is required.
#[derive(Debug, Default)]
pub struct Counters {

    uploaded: AtomicU64,

    downloaded: AtomicU64,

}

impl Counters {

    pub fn add_uploaded(&self, n: u64) {
        self.uploaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = Counters::default();
        counters.add_downloaded(0x4000);
        counters.add_downloaded(100);
        counters.add_uploaded(7);
        assert_eq!(counters.downloaded(), 0x4000 + 100);
        assert_eq!(counters.uploaded(), 7);
    }
}
