//! # Context Lifecycle
//!
//! A context is one conversational turn's worth of streamed audio. At most
//! one is current. The tracker only decides *what happened*; the engine
//! performs the flush that a switch requires.
//!
//! ## State Machine:
//! - `NoContext` → `Active(id)` on the first fragment
//! - `Active(a)` → `Active(b)` when a fragment for `b ≠ a` arrives (flush first)
//! - `Active(id)` → `NoContext` on interrupt or confirmed drain of `id`

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "context_id", rename_all = "snake_case")]
pub enum ContextState {
    NoContext,
    Active(String),
}

/// Result of feeding a fragment's context id to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextTransition {
    /// First fragment after `NoContext`
    Started,
    /// Same turn as before
    Continued,
    /// A new turn superseded `previous`; its audio must be flushed
    Switched { previous: String },
}

#[derive(Debug)]
pub struct ContextTracker {
    state: ContextState,
    /// Turns started since creation
    started: u64,
}

impl Default for ContextTracker {
    fn default() -> Self {
        Self {
            state: ContextState::NoContext,
            started: 0,
        }
    }
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ContextState {
        &self.state
    }

    pub fn current(&self) -> Option<&str> {
        match &self.state {
            ContextState::Active(id) => Some(id),
            ContextState::NoContext => None,
        }
    }

    pub fn is_current(&self, context_id: &str) -> bool {
        self.current() == Some(context_id)
    }

    pub fn started(&self) -> u64 {
        self.started
    }

    pub fn observe(&mut self, context_id: &str) -> ContextTransition {
        let transition = match &self.state {
            ContextState::NoContext => ContextTransition::Started,
            ContextState::Active(current) if current == context_id => ContextTransition::Continued,
            ContextState::Active(current) => ContextTransition::Switched {
                previous: current.clone(),
            },
        };

        if transition != ContextTransition::Continued {
            self.state = ContextState::Active(context_id.to_string());
            self.started += 1;
        }
        transition
    }

    /// Return to `NoContext`, handing back the turn that ended.
    pub fn end(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, ContextState::NoContext) {
            ContextState::Active(id) => Some(id),
            ContextState::NoContext => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let mut tracker = ContextTracker::new();
        assert_eq!(tracker.observe("a"), ContextTransition::Started);
        assert_eq!(tracker.observe("a"), ContextTransition::Continued);
        assert_eq!(
            tracker.observe("b"),
            ContextTransition::Switched { previous: "a".to_string() }
        );
        assert!(tracker.is_current("b"));
        assert_eq!(tracker.started(), 2);
    }

    #[test]
    fn test_end_returns_to_no_context() {
        let mut tracker = ContextTracker::new();
        tracker.observe("a");
        assert_eq!(tracker.end(), Some("a".to_string()));
        assert_eq!(tracker.state(), &ContextState::NoContext);
        assert_eq!(tracker.end(), None);
        // the same id may start again later
        assert_eq!(tracker.observe("a"), ContextTransition::Started);
    }

    #[test]
    fn test_state_serializes_for_status_reports() {
        let mut tracker = ContextTracker::new();
        tracker.observe("turn-7");
        let json = serde_json::to_value(tracker.state()).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["context_id"], "turn-7");
    }
}
