//! # Sequence Integrity Monitor
//!
//! Diagnoses gaps, duplicates and reordering in a turn's fragment indices.
//! It never blocks or reorders: on a mismatch it reports the anomaly and
//! realigns to whatever index actually arrived. Lost audio stays lost.

use tracing::warn;

/// What the monitor concluded about one fragment's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    /// Index jumped forward; `missing` fragments never arrived
    Gap { expected: u64, received: u64, missing: u64 },
    /// Index went backwards or repeated
    Regression { expected: u64, received: u64 },
}

impl SequenceCheck {
    pub fn is_anomaly(&self) -> bool {
        !matches!(self, SequenceCheck::InOrder)
    }
}

#[derive(Debug, Default)]
pub struct SequenceMonitor {
    expected_next: u64,
    anomalies: u64,
}

impl SequenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_next(&self) -> u64 {
        self.expected_next
    }

    /// Anomalies seen since the monitor was created (survives resets).
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Check one fragment. A fragment without an index counts as in order.
    pub fn observe(&mut self, context_id: &str, index: Option<u64>) -> SequenceCheck {
        let expected = self.expected_next;
        let check = match index {
            None => SequenceCheck::InOrder,
            Some(received) if received == expected => SequenceCheck::InOrder,
            Some(received) if received > expected => SequenceCheck::Gap {
                expected,
                received,
                missing: received - expected,
            },
            Some(received) => SequenceCheck::Regression { expected, received },
        };

        if check.is_anomaly() {
            self.anomalies += 1;
            warn!(
                context_id = %context_id,
                expected = expected,
                received = ?index,
                check = ?check,
                "Fragment sequence anomaly, realigning"
            );
        }

        let realigned = index.unwrap_or(expected);
        self.expected_next = realigned.saturating_add(1);
        check
    }

    /// Start over for a new turn.
    pub fn reset(&mut self) {
        self.expected_next = 0;
    }
}
