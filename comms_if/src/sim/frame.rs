//! # Simulator event framing
//!
//! The simulator speaks socket.io over a websocket. Each text frame carrying
//! an event starts with `42` (`4` = message, `2` = event) followed by a JSON
//! array `["event_name", {payload}]`. This module converts between those
//! frames and the typed messages.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;
use serde_json::Value;

use super::{SteerCmd, Telemetry};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Prefix of socket.io event frames
pub const EVENT_PREFIX: &str = "42";

/// Name of the telemetry event
pub const TELEMETRY_EVENT: &str = "telemetry";

/// Frame sent when there is no telemetry, handing control back to manual driving
pub const MANUAL_FRAME: &str = "42[\"manual\",{}]";

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// An event decoded from a simulator frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// The simulator sent telemetry which needs a steering command in return
    Telemetry(Telemetry),

    /// The simulator sent an event without data and expects a manual-mode reply
    Manual,
}

/// Errors which can occur while framing simulator messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Event payload is not valid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Event payload is not a [name, data] array")]
    MalformedEvent,

    #[error("Unexpected event \"{0}\"")]
    UnexpectedEvent(String),

    #[error("Could not deserialize the telemetry: {0}")]
    TelemetryError(serde_json::Error),

    #[error("Could not serialize the steering command: {0}")]
    SerializationError(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Decode a text frame from the simulator.
///
/// Returns `Ok(None)` for frames which are not events (socket.io pings and other housekeeping),
/// these must not be answered.
pub fn decode_frame(frame: &str) -> Result<Option<SimEvent>, FrameError> {
    if frame.len() <= EVENT_PREFIX.len() || !frame.starts_with(EVENT_PREFIX) {
        return Ok(None);
    }

    let payload = match event_payload(frame) {
        Some(p) => p,
        None => return Ok(Some(SimEvent::Manual)),
    };

    let value: Value = serde_json::from_str(payload).map_err(FrameError::InvalidJson)?;

    let (name, data) = match value.as_array().map(|a| a.as_slice()) {
        Some([Value::String(name), data, ..]) => (name, data),
        _ => return Err(FrameError::MalformedEvent),
    };

    if name != TELEMETRY_EVENT {
        return Err(FrameError::UnexpectedEvent(name.clone()));
    }

    let telem = Telemetry::deserialize_value(data)?;

    Ok(Some(SimEvent::Telemetry(telem)))
}

/// Encode a steering command into a simulator frame.
pub fn encode_steer(cmd: &SteerCmd) -> Result<String, FrameError> {
    let json = serde_json::to_string(cmd).map_err(FrameError::SerializationError)?;

    Ok(format!("{}[\"steer\",{}]", EVENT_PREFIX, json))
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Extract the JSON event array from a frame.
///
/// Any frame mentioning `null` carries no usable data, the simulator sends these when it is in
/// manual mode.
fn event_payload(frame: &str) -> Option<&str> {
    if frame.contains("null") {
        return None;
    }

    let start = frame.find('[')?;
    let end = frame.rfind("}]")?;

    if end < start {
        return None;
    }

    Some(&frame[start..end + 2])
}

impl Telemetry {
    fn deserialize_value(data: &Value) -> Result<Self, FrameError> {
        Telemetry::deserialize(data).map_err(FrameError::TelemetryError)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    const TELEM_FRAME: &str = "42[\"telemetry\",{\"ptsx\":[-32.16173,-43.49173,-61.09,-78.29172],\
        \"ptsy\":[113.361,105.941,92.88499,78.73102],\"psi_unity\":4.12033,\"psi\":3.733651,\
        \"x\":-40.62,\"y\":108.73,\"steering_angle\":0,\"throttle\":0,\"speed\":0}]";

    #[test]
    fn test_decode_telemetry() {
        let event = decode_frame(TELEM_FRAME).unwrap();

        let telem = match event {
            Some(SimEvent::Telemetry(t)) => t,
            e => panic!("Expected telemetry, got {:?}", e),
        };

        assert_eq!(telem.ptsx.len(), 4);
        assert_eq!(telem.ptsy[1], 105.941);
        assert_eq!(telem.psi, 3.733651);
        assert_eq!(telem.x, -40.62);
        assert_eq!(telem.speed, 0.0);
    }

    #[test]
    fn test_decode_housekeeping_and_manual() {
        // Pings and other non-event frames are ignored
        assert!(decode_frame("2").unwrap().is_none());
        assert!(decode_frame("40").unwrap().is_none());
        assert!(decode_frame("3probe").unwrap().is_none());

        // Null data is manual mode
        assert_eq!(
            decode_frame("42[\"telemetry\",null]").unwrap(),
            Some(SimEvent::Manual)
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_frame("42[\"steer\",{\"a\":1}]"),
            Err(FrameError::UnexpectedEvent(ref n)) if n == "steer"
        ));
        assert!(matches!(
            decode_frame("42[\"telemetry\",{\"x\":1}]"),
            Err(FrameError::TelemetryError(_))
        ));
        assert!(matches!(
            decode_frame("42[{\"x\":1}]"),
            Err(FrameError::MalformedEvent)
        ));
    }

    #[test]
    fn test_encode_steer() {
        let cmd = SteerCmd {
            steering_angle: -0.25,
            throttle: 0.5,
            next_x: vec![1.0],
            next_y: vec![0.0],
            ..Default::default()
        };

        let frame = encode_steer(&cmd).unwrap();
        assert!(frame.starts_with("42[\"steer\",{"));
        assert!(frame.ends_with("}]"));

        let json = &frame[frame.find('{').unwrap()..frame.len() - 1];
        let decoded: SteerCmd = serde_json::from_str(json).unwrap();
        assert_eq!(decoded, cmd);
    }
}
