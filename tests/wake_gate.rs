//! Wake phrase gating on transcripts.

use voxbridge::config::WakeConfig;
use voxbridge::wake::{GateDecision, WakeGate};

fn gate() -> WakeGate {
    WakeGate::new(&WakeConfig {
        enabled: true,
        phrases: vec!["hey atlas".into()],
        threshold: 0.8,
        session_timeout_secs: 45,
    })
}

#[test]
fn test_leading_phrase_is_matched_and_stripped() {
    match gate().evaluate("hey atlas what's the weather", false) {
        GateDecision::Wake { text, score } => {
            assert_eq!(text, "what's the weather");
            assert!(score >= 0.8);
        }
        other => panic!("expected wake, got {other:?}"),
    }
}

#[test]
fn test_different_name_does_not_wake() {
    assert_eq!(gate().evaluate("hey Alice", false), GateDecision::Drop);
}

#[test]
fn test_open_conversation_forwards_without_phrase() {
    assert_eq!(
        gate().evaluate("and tomorrow?", true),
        GateDecision::Continue {
            text: "and tomorrow?".into()
        }
    );
}

#[test]
fn test_disabled_gate_forwards_everything() {
    let gate = WakeGate::new(&WakeConfig {
        enabled: false,
        ..WakeConfig::default()
    });
    assert!(matches!(
        gate.evaluate("anything at all", false),
        GateDecision::Continue { .. }
    ));
}
