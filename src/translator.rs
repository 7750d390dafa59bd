use crate::models::{Category, CommandMessage, ControlCommand, ControlMessage, LaneSet};
use serde_json::Value;
use thiserror::Error;

/// Why an inbound control payload produced no command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("failed to decode control payload: {0}")]
    Decode(String),
    #[error("unknown command: {}", .0.as_deref().unwrap_or("<absent>"))]
    UnknownCommand(Option<String>),
    #[error("invalid lane: {}", .0.as_deref().unwrap_or("<absent>"))]
    InvalidLane(Option<String>),
}

/// An accepted control message: the command to publish and the audit category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub command: CommandMessage,
    pub category: Category,
}

pub fn decode(raw: &[u8]) -> Result<ControlMessage, Rejection> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| Rejection::Decode(e.to_string()))?;
    match value {
        Value::Object(object) => Ok(ControlMessage::from_object(&object)),
        other => Err(Rejection::Decode(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Maps a raw control payload onto the command for the actuator.
///
/// Pure and deterministic: the same bytes and lane set always give the same result.
pub fn translate(raw: &[u8], lanes: &LaneSet) -> Result<Translation, Rejection> {
    let message = decode(raw)?;

    match message.command {
        ControlCommand::Manual => {
            let lane = message
                .lane
                .as_deref()
                .and_then(|name| lanes.resolve(name))
                .ok_or_else(|| Rejection::InvalidLane(message.lane.clone()))?;
            Ok(Translation {
                category: Category::Lane(lane.clone()),
                command: CommandMessage::Manual { lane },
            })
        }
        ControlCommand::Smart => Ok(Translation {
            command: CommandMessage::Smart,
            category: Category::ModeSwitch,
        }),
        ControlCommand::Unrecognized(command) => Err(Rejection::UnknownCommand(command)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Mode, SMART_CATEGORY};

    fn lanes() -> LaneSet {
        LaneSet::default()
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        let payloads: [&[u8]; 6] = [
            b"not valid json",
            b"",
            b"{\"command\":",
            b"[\"manual\",\"Lane A\"]",
            b"\"smart\"",
            &[0xff, 0xfe, 0x7b],
        ];
        for payload in payloads {
            assert!(
                matches!(translate(payload, &lanes()), Err(Rejection::Decode(_))),
                "payload {:?} should not decode",
                payload
            );
        }
    }

    #[test]
    fn manual_with_known_lane_is_forwarded() {
        for name in ["Lane A", "Lane B"] {
            let payload = format!(r#"{{"command":"manual","lane":"{}"}}"#, name);
            let translation = translate(payload.as_bytes(), &lanes()).unwrap();
            assert_eq!(translation.command.mode(), Mode::Manual);
            assert_eq!(translation.command.lane().map(|l| l.name()), Some(name));
            assert_eq!(translation.category.as_str(), name);
        }
    }

    #[test]
    fn manual_without_valid_lane_is_rejected() {
        assert_eq!(
            translate(br#"{"command":"manual"}"#, &lanes()),
            Err(Rejection::InvalidLane(None))
        );
        assert_eq!(
            translate(br#"{"command":"manual","lane":"Lane Z"}"#, &lanes()),
            Err(Rejection::InvalidLane(Some("Lane Z".to_string())))
        );
        assert_eq!(
            translate(br#"{"command":"manual","lane":1}"#, &lanes()),
            Err(Rejection::InvalidLane(None))
        );
    }

    #[test]
    fn smart_ignores_extraneous_fields() {
        for payload in [
            &br#"{"command":"smart"}"#[..],
            &br#"{"command":"smart","lane":"Lane A","speed":3}"#[..],
        ] {
            let translation = translate(payload, &lanes()).unwrap();
            assert_eq!(translation.command, CommandMessage::Smart);
            assert_eq!(translation.category, Category::ModeSwitch);
            assert_eq!(translation.category.as_str(), SMART_CATEGORY);
        }
    }

    #[test]
    fn absent_or_unknown_commands_are_rejected() {
        assert_eq!(
            translate(br#"{"lane":"Lane A"}"#, &lanes()),
            Err(Rejection::UnknownCommand(None))
        );
        assert_eq!(
            translate(br#"{"command":"MANUAL"}"#, &lanes()),
            Err(Rejection::UnknownCommand(Some("MANUAL".to_string())))
        );
        assert!(matches!(
            translate(br#"{"command":null}"#, &lanes()),
            Err(Rejection::UnknownCommand(_))
        ));
    }

    #[test]
    fn translation_has_no_hidden_state() {
        let payload = br#"{"command":"manual","lane":"Lane B"}"#;
        assert_eq!(translate(payload, &lanes()), translate(payload, &lanes()));
    }

    #[test]
    fn configured_lane_sets_are_honoured() {
        let lanes = LaneSet::parse("North,South").unwrap();
        assert!(translate(br#"{"command":"manual","lane":"North"}"#, &lanes).is_ok());
        assert_eq!(
            translate(br#"{"command":"manual","lane":"Lane A"}"#, &lanes),
            Err(Rejection::InvalidLane(Some("Lane A".to_string())))
        );
    }
}
