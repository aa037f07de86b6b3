use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::modules::agent::AgentId;
use crate::modules::records::{DialogueRecord, PairKey};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Turn {
    pub speaker_id: AgentId,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Bounded per-pair conversation history, oldest turn first. Lives in
/// memory only and is rebuilt from stored dialogues at startup.
#[derive(Debug)]
pub struct ContinuityTracker {
    limit: usize,
    histories: HashMap<PairKey, VecDeque<Turn>>,
}

impl ContinuityTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            histories: HashMap::new(),
        }
    }

    pub fn record(&mut self, a: &str, b: &str, turn: Turn) {
        let history = self.histories.entry(PairKey::new(a, b)).or_default();
        history.push_back(turn);
        while history.len() > self.limit {
            history.pop_front();
        }
    }

    pub fn history(&self, a: &str, b: &str) -> Vec<Turn> {
        self.histories
            .get(&PairKey::new(a, b))
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The newest `limit` turns of the pair, oldest first.
    pub fn recent(&self, a: &str, b: &str, limit: usize) -> Vec<Turn> {
        let history = self.history(a, b);
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub fn pairs(&self) -> usize {
        self.histories.len()
    }

    /// Replaces all histories with the finalized `dialogues`, in time order.
    pub fn rebuild_from(&mut self, dialogues: &[DialogueRecord]) {
        self.histories.clear();
        let mut finalized: Vec<&DialogueRecord> =
            dialogues.iter().filter(|d| d.is_finalized()).collect();
        finalized.sort_by_key(|d| (d.timestamp, d.id));
        for dialogue in finalized {
            self.record(
                &dialogue.speaker,
                &dialogue.target,
                Turn {
                    speaker_id: dialogue.speaker_id,
                    text: dialogue.message.clone(),
                    at: dialogue.timestamp,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::records::DialogueKind;

    fn turn(speaker_id: AgentId, text: &str) -> Turn {
        Turn {
            speaker_id,
            text: text.to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn history_is_shared_by_both_orders_and_capped() {
        let mut tracker = ContinuityTracker::new(20);
        for i in 0..25 {
            let (a, b) = if i % 2 == 0 { ("x", "y") } else { ("y", "x") };
            tracker.record(a, b, turn(i, &format!("t{i}")));
        }

        let history = tracker.history("y", "x");
        assert_eq!(history.len(), 20);
        assert_eq!(history.first().unwrap().text, "t5");
        assert_eq!(history.last().unwrap().text, "t24");
        assert_eq!(tracker.recent("x", "y", 3).len(), 3);
        assert_eq!(tracker.recent("x", "y", 3)[0].text, "t22");
        assert!(tracker.history("x", "z").is_empty());
    }

    #[test]
    fn rebuild_skips_placeholders() {
        let now = Utc::now();
        let mut done = DialogueRecord::placeholder(DialogueKind::PendingPlaceholder, (1, "x"), (2, "y"), 1, now, None);
        done.kind = DialogueKind::AiResponse;
        done.message = "hello".into();
        let waiting = DialogueRecord::placeholder(DialogueKind::TypingPlaceholder, (2, "y"), (1, "x"), 2, now, None);

        let mut tracker = ContinuityTracker::new(20);
        tracker.record("a", "b", turn(9, "gone after rebuild"));
        tracker.rebuild_from(&[done, waiting]);

        assert_eq!(tracker.pairs(), 1);
        let history = tracker.history("x", "y");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "hello");
    }
}
