use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Restores original input order from results that arrive in arbitrary
/// completion order. The finalized output always has exactly `expected`
/// entries; indices that never arrived are filled with a synthesized
/// placeholder so downstream merges never see a short table.
pub struct OrderedResultCollector<T> {
    slots: Vec<Option<T>>,
    received: usize,
    duplicates: u64,
}

impl<T> OrderedResultCollector<T> {
    pub fn new(expected: usize) -> Self {
        Self {
            slots: (0..expected).map(|_| None).collect(),
            received: 0,
            duplicates: 0,
        }
    }

    pub fn expected(&self) -> usize {
        self.slots.len()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    /// Record a result for `index`. Duplicate arrivals keep the newest value
    /// and are logged as a data-integrity anomaly; out-of-range indices are
    /// dropped. Returns whether the value was stored.
    pub fn insert(&mut self, index: usize, value: T) -> bool {
        let expected = self.slots.len();
        let Some(slot) = self.slots.get_mut(index) else {
            warn!(index, expected, "result index out of range, dropped");
            return false;
        };
        if slot.is_some() {
            self.duplicates += 1;
            warn!(index, "duplicate result for index, keeping the newest");
        } else {
            self.received += 1;
        }
        *slot = Some(value);
        true
    }

    pub fn missing(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.is_none().then_some(i))
            .collect()
    }

    /// Consume the collector, returning results sorted by index ascending
    /// with every gap filled by `placeholder`.
    pub fn into_ordered(self, mut placeholder: impl FnMut(usize) -> T) -> Vec<T> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| placeholder(i)))
            .collect()
    }
}

/// Drain `(index, value)` pairs from a channel until every expected index has
/// arrived, the senders are gone, or the terminal deadline elapses.
pub async fn collect<T>(
    rx: &mut mpsc::Receiver<(usize, T)>,
    expected: usize,
    deadline: Duration,
    placeholder: impl FnMut(usize) -> T,
) -> Vec<T> {
    let mut collector = OrderedResultCollector::new(expected);

    if expected > 0 {
        let drain = async {
            while let Some((index, value)) = rx.recv().await {
                collector.insert(index, value);
                if collector.is_complete() {
                    break;
                }
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!(
                deadline_secs = deadline.as_secs(),
                "collection deadline elapsed before all results arrived"
            );
        }
        if collector.duplicates() > 0 {
            warn!(
                duplicates = collector.duplicates(),
                "duplicate indices observed during collection"
            );
        }
        if !collector.is_complete() {
            warn!(
                received = collector.received(),
                expected = collector.expected(),
                missing = ?collector.missing(),
                "filling missing indices with failure placeholders"
            );
        }
    }

    collector.into_ordered(placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_arrival_restored() {
        let mut c = OrderedResultCollector::new(4);
        assert!(c.insert(2, "c"));
        assert!(c.insert(0, "a"));
        assert!(c.insert(3, "d"));
        assert!(c.insert(1, "b"));
        assert!(c.is_complete());

        let ordered = c.into_ordered(|_| "?");
        assert_eq!(ordered, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_missing_index_filled_with_placeholder() {
        let mut c = OrderedResultCollector::new(3);
        c.insert(0, "a".to_string());
        c.insert(2, "c".to_string());
        assert_eq!(c.missing(), vec![1]);

        let ordered = c.into_ordered(|i| format!("missing-{i}"));
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[1], "missing-1");
    }

    #[test]
    fn test_duplicate_last_write_wins() {
        let mut c = OrderedResultCollector::new(2);
        c.insert(0, "first");
        c.insert(0, "second");
        c.insert(1, "b");
        assert_eq!(c.duplicates(), 1);
        assert_eq!(c.received(), 2);

        let ordered = c.into_ordered(|_| "?");
        assert_eq!(ordered, vec!["second", "b"]);
    }

    #[test]
    fn test_out_of_range_dropped() {
        let mut c = OrderedResultCollector::new(2);
        assert!(!c.insert(5, "x"));
        assert_eq!(c.received(), 0);
    }

    #[test]
    fn test_zero_expected() {
        let c = OrderedResultCollector::<u32>::new(0);
        assert!(c.is_complete());
        assert!(c.into_ordered(|_| 0).is_empty());
    }

    #[tokio::test]
    async fn test_collect_completes_before_deadline() {
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for i in [1usize, 0, 2] {
                tx.send((i, i * 10)).await.unwrap();
            }
        });

        let out = collect(&mut rx, 3, Duration::from_secs(5), |_| usize::MAX).await;
        assert_eq!(out, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_collect_deadline_fills_gaps() {
        let (tx, mut rx) = mpsc::channel::<(usize, usize)>(4);
        // only one of three results ever arrives; the sender stays open so
        // the drain must be cut off by the deadline
        tokio::spawn(async move {
            tx.send((1, 11)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(tx);
        });

        let out = collect(&mut rx, 3, Duration::from_millis(100), |i| i + 1000).await;
        assert_eq!(out, vec![1000, 11, 1002]);
    }

    #[tokio::test]
    async fn test_collect_senders_dropped_early() {
        let (tx, mut rx) = mpsc::channel::<(usize, &str)>(2);
        drop(tx);

        let out = collect(&mut rx, 2, Duration::from_secs(5), |_| "gone").await;
        assert_eq!(out, vec!["gone", "gone"]);
    }
}
