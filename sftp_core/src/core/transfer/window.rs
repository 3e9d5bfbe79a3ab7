use std::collections::BTreeMap;

/// Acknowledged byte ranges of one transfer.
///
/// `resumable_offset` is the end of the contiguous acknowledged prefix. Acks
/// past a gap are remembered in `ranges` (start → end, disjoint, all beyond
/// the prefix) and join the prefix once the gap is filled.
#[derive(Debug, Clone, Default)]
pub struct AckWindow {
    prefix: u64,
    ranges: BTreeMap<u64, u64>,
    acknowledged: u64,
}

impl AckWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resumable_offset(&self) -> u64 {
        self.prefix
    }

    /// Total acknowledged bytes, gaps notwithstanding.
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    /// Record `[offset, offset + len)` as acknowledged. Re-acking bytes is
    /// harmless and does not count them twice.
    pub fn ack(&mut self, offset: u64, len: u64) {
        let mut start = offset.max(self.prefix);
        let mut end = offset.saturating_add(len);
        if start >= end {
            return;
        }

        let mut fresh = end - start;
        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .filter(|(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in touching {
            let overlap = e.min(end).saturating_sub(s.max(start));
            fresh -= overlap;
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.acknowledged += fresh;

        if start <= self.prefix {
            self.prefix = end;
        } else {
            self.ranges.insert(start, end);
        }
    }

    /// First offset at or after `cursor` not yet acknowledged.
    pub fn next_unacked(&self, cursor: u64) -> u64 {
        let cursor = cursor.max(self.prefix);
        match self.ranges.range(..=cursor).next_back() {
            Some((_, &end)) if end > cursor => end,
            _ => cursor,
        }
    }

    /// Start of the first acknowledged range beginning after `cursor`.
    pub fn next_acked_after(&self, cursor: u64) -> Option<u64> {
        self.ranges.range(cursor + 1..).next().map(|(&start, _)| start)
    }

    /// Whether every byte below `total` is acknowledged.
    pub fn is_complete(&self, total: u64) -> bool {
        self.prefix >= total
    }
}
