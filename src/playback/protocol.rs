//! # Wire Protocol
//!
//! JSON text frames exchanged with the remote voice pipeline. Every frame
//! carries a `type` tag; payload fields are camelCase. Older pipeline
//! builds use `ai-*` event names, which are accepted as aliases.

use serde::{Deserialize, Serialize};

/// Events the remote sender pushes to us.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundEvent {
    /// One encoded audio fragment. Missing ids or audio are tolerated here
    /// and rejected by the engine with a warning.
    #[serde(alias = "ai-audio-chunk", rename_all = "camelCase")]
    AudioFragment {
        #[serde(default)]
        context_id: Option<String>,
        #[serde(default)]
        audio: Option<String>,
        #[serde(default)]
        sequence_index: Option<u64>,
        #[serde(default)]
        is_final: bool,
    },

    /// Out-of-band end-of-turn marker
    #[serde(alias = "ai-audio-complete", rename_all = "camelCase")]
    StreamComplete {
        #[serde(default)]
        context_id: Option<String>,
    },

    /// Barge-in: silence everything now
    #[serde(alias = "ai-interrupt")]
    Interrupt,

    ReengagementCheck,

    /// One-shot clip played right away (session greeting)
    Greeting { audio: String },

    #[serde(alias = "ai-response-done", rename_all = "camelCase")]
    ResponseDone {
        #[serde(default)]
        context_id: Option<String>,
    },

    #[serde(alias = "ai-error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },

    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },

    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

impl InboundEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Tag of the drain notification before the configured name is applied.
pub const DEFAULT_DRAINED_EVENT: &str = "playback-drained";

/// Events we send back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundEvent {
    /// A turn finished playing. The tag is replaced by the configured
    /// event name on the way out (see `to_json`).
    #[serde(rename = "playback-drained", rename_all = "camelCase")]
    Drained { context_id: String },

    ReengagementCheckResult { audible: bool },

    GreetingFinished,

    Error { code: String, message: String },

    #[serde(rename_all = "camelCase")]
    SessionStarted { session_id: String, sample_rate: u32 },

    Ping { timestamp: i64 },

    Pong { timestamp: i64 },
}

impl OutboundEvent {
    /// Serialize to a text frame, renaming the drain notification to
    /// `drained_event_name`.
    pub fn to_json(&self, drained_event_name: &str) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let OutboundEvent::Drained { .. } = self {
            if drained_event_name != DEFAULT_DRAINED_EVENT {
                value["type"] = serde_json::Value::String(drained_event_name.to_string());
            }
        }
        serde_json::to_string(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_audio_fragment() {
        let event = InboundEvent::parse(
            r#"{"type":"audio-fragment","contextId":"c1","audio":"AAA=","sequenceIndex":4,"isFinal":true}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::AudioFragment {
                context_id: Some("c1".to_string()),
                audio: Some("AAA=".to_string()),
                sequence_index: Some(4),
                is_final: true,
            }
        );
    }

    #[test]
    fn test_legacy_names_are_accepted() {
        let chunk = InboundEvent::parse(r#"{"type":"ai-audio-chunk","contextId":"c1","audio":"AAA="}"#).unwrap();
        assert!(matches!(
            chunk,
            InboundEvent::AudioFragment { sequence_index: None, is_final: false, .. }
        ));

        let interrupt = InboundEvent::parse(r#"{"type":"ai-interrupt"}"#).unwrap();
        assert_eq!(interrupt, InboundEvent::Interrupt);

        let complete = InboundEvent::parse(r#"{"type":"ai-audio-complete","contextId":"c9"}"#).unwrap();
        assert_eq!(
            complete,
            InboundEvent::StreamComplete { context_id: Some("c9".to_string()) }
        );

        let done = InboundEvent::parse(r#"{"type":"ai-response-done","text":"hi"}"#).unwrap();
        assert_eq!(done, InboundEvent::ResponseDone { context_id: None });
    }

    #[test]
    fn test_fragment_with_missing_fields_still_parses() {
        let event = InboundEvent::parse(r#"{"type":"audio-fragment","sequenceIndex":null}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::AudioFragment {
                context_id: None,
                audio: None,
                sequence_index: None,
                is_final: false,
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(InboundEvent::parse(r#"{"type":"transcript","text":"hi"}"#).is_err());
        assert!(InboundEvent::parse("not json").is_err());
    }

    #[test]
    fn test_drained_event_uses_configured_name() {
        let event = OutboundEvent::Drained { context_id: "c1".to_string() };

        let default: serde_json::Value =
            serde_json::from_str(&event.to_json(DEFAULT_DRAINED_EVENT).unwrap()).unwrap();
        assert_eq!(default, json!({"type": "playback-drained", "contextId": "c1"}));

        let legacy: serde_json::Value =
            serde_json::from_str(&event.to_json("ai-audio-done").unwrap()).unwrap();
        assert_eq!(legacy, json!({"type": "ai-audio-done", "contextId": "c1"}));
    }

    #[test]
    fn test_outbound_shapes() {
        let audible = serde_json::to_value(OutboundEvent::ReengagementCheckResult { audible: true }).unwrap();
        assert_eq!(audible, json!({"type": "reengagement-check-result", "audible": true}));

        let started = serde_json::to_value(OutboundEvent::SessionStarted {
            session_id: "s".to_string(),
            sample_rate: 24000,
        })
        .unwrap();
        assert_eq!(
            started,
            json!({"type": "session-started", "sessionId": "s", "sampleRate": 24000})
        );

        let finished = serde_json::to_value(OutboundEvent::GreetingFinished).unwrap();
        assert_eq!(finished, json!({"type": "greeting-finished"}));
    }
}
