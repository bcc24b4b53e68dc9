//! Head/tail retention of a line stream for diagnostics.
//!
//! When a process fails, the first and last lines of its output are usually
//! what matter; everything in between is replaced by a skip marker. The
//! gatherer keeps the first `H` and last `T` lines and counts the rest,
//! like a ring buffer that also remembers how much it evicted.

use std::collections::VecDeque;

/// Retains the first `head_limit` and last `tail_limit` lines pushed into
/// it, counting everything discarded in between.
#[derive(Debug)]
pub struct HeadTailGatherer {
    head_limit: usize,
    tail_limit: usize,
    head: Vec<String>,
    tail: VecDeque<String>,
    skipped: u64,
}

impl HeadTailGatherer {
    pub fn new(head_limit: usize, tail_limit: usize) -> Self {
        Self {
            head_limit,
            tail_limit,
            head: Vec::new(),
            tail: VecDeque::new(),
            skipped: 0,
        }
    }

    /// Record one line.
    pub fn push(&mut self, line: String) {
        if self.head.len() < self.head_limit {
            self.head.push(line);
            return;
        }
        if self.tail_limit == 0 {
            self.skipped += 1;
            return;
        }
        if self.tail.len() == self.tail_limit {
            self.tail.pop_front();
            self.skipped += 1;
        }
        self.tail.push_back(line);
    }

    /// Whether nothing was ever pushed.
    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.tail.is_empty() && self.skipped == 0
    }

    /// Number of lines discarded between head and tail.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Assemble head, an optional skip marker, and tail into one list.
    ///
    /// The marker is present iff lines were skipped and reads
    /// `… (skipped N line(s)) …`.
    pub fn into_lines(self) -> Vec<String> {
        let mut out = self.head;
        if self.skipped > 0 {
            out.push(format!("… (skipped {} line(s)) …", self.skipped));
        }
        out.extend(self.tail);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gather(count: usize, head: usize, tail: usize) -> HeadTailGatherer {
        let mut g = HeadTailGatherer::new(head, tail);
        for i in 1..=count {
            g.push(format!("L{i}"));
        }
        g
    }

    #[test]
    fn test_under_capacity_keeps_everything() {
        let g = gather(3, 2, 2);
        assert_eq!(g.skipped(), 0);
        assert_eq!(g.into_lines(), vec!["L1", "L2", "L3"]);
    }

    #[test]
    fn test_exactly_full_has_no_marker() {
        let g = gather(4, 2, 2);
        assert_eq!(g.into_lines(), vec!["L1", "L2", "L3", "L4"]);
    }

    #[test]
    fn test_overflow_inserts_marker_with_count() {
        let g = gather(10, 2, 2);
        assert_eq!(
            g.into_lines(),
            vec!["L1", "L2", "… (skipped 6 line(s)) …", "L9", "L10"]
        );
    }

    #[test]
    fn test_zero_tail_counts_all_overflow() {
        let g = gather(5, 1, 0);
        assert_eq!(g.skipped(), 4);
        assert_eq!(g.into_lines(), vec!["L1", "… (skipped 4 line(s)) …"]);
    }

    #[test]
    fn test_zero_head_zero_tail_is_marker_only() {
        let g = gather(7, 0, 0);
        assert_eq!(g.into_lines(), vec!["… (skipped 7 line(s)) …"]);
    }

    #[test]
    fn test_entry_count_formula() {
        // For K lines with head H and tail T the output has exactly
        // min(K, H) + (K > H + T) + min(max(K - H, 0), T) entries.
        for (k, h, t) in [(0, 2, 2), (1, 0, 3), (5, 2, 2), (9, 3, 0), (20, 5, 5)] {
            let lines = gather(k, h, t).into_lines();
            let expected =
                k.min(h) + usize::from(k > h + t) + k.saturating_sub(h).min(t);
            assert_eq!(lines.len(), expected, "k={k} h={h} t={t}");
        }
    }
}
