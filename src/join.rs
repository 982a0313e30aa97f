//! Validation and normalization of caller-supplied session options into
//! the wire-level join payload.
//!
//! The embedding application hands over a loosely-typed option object.
//! Identity and duration are mandatory; every optional field is either a
//! value of its expected type or entirely absent from the payload, never
//! a null placeholder.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::VideoFormat;
use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: String,
    pub user_id: String,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_fx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_fx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<bool>,
}

impl JoinPayload {
    /// Validate and normalize raw peer options.
    ///
    /// Fails only when `roomId`, `userId` or `duration` are missing or of
    /// the wrong type. Malformed optional fields (non-numeric sizes, an
    /// unsupported codec name) are dropped rather than rejected.
    pub fn build(raw: &Value) -> Result<JoinPayload, SessionError> {
        let room_id = required_string(raw, "roomId")?;
        let user_id = required_string(raw, "userId")?;
        let duration = number(raw, "duration").ok_or_else(|| {
            SessionError::InvalidOptions("missing or non-numeric duration".to_owned())
        })?;

        let video_format = string(raw, "videoFormat")
            .and_then(|name| VideoFormat::from_name(&name))
            .map(|format| format.name().to_owned());

        // gpu is a flag: anything falsy is treated as unset.
        let gpu = raw.get("gpu").and_then(Value::as_bool).filter(|&on| on);

        Ok(JoinPayload {
            room_id,
            user_id,
            duration,
            namespace: string(raw, "namespace"),
            video_format,
            recording_mode: string(raw, "recordingMode"),
            size: number(raw, "size"),
            audio_fx: string(raw, "audioFx"),
            video_fx: string(raw, "videoFx"),
            width: number(raw, "width"),
            height: number(raw, "height"),
            frame_rate: number(raw, "frameRate"),
            gpu,
        })
    }
}

fn required_string(raw: &Value, key: &str) -> Result<String, SessionError> {
    string(raw, key)
        .ok_or_else(|| SessionError::InvalidOptions(format!("missing or non-string {key}")))
}

fn string(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_owned)
}

// Numbers pass through as supplied; fractional values are not truncated.
fn number(raw: &Value, key: &str) -> Option<f64> {
    raw.get(key)?.as_f64().filter(|f| f.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(payload: &JoinPayload) -> Vec<String> {
        match serde_json::to_value(payload).unwrap() {
            Value::Object(map) => map.keys().cloned().collect(),
            other => panic!("join payload serialized as {other:?}"),
        }
    }

    #[test]
    fn requires_room_user_and_duration() {
        for raw in [
            json!({}),
            json!({"userId": "u", "duration": 30}),
            json!({"roomId": "r", "duration": 30}),
            json!({"roomId": "r", "userId": "u"}),
            json!({"roomId": "r", "userId": "u", "duration": "soon"}),
            json!({"roomId": 7, "userId": "u", "duration": 30}),
        ] {
            assert!(JoinPayload::build(&raw).is_err(), "accepted {raw}");
        }
    }

    #[test]
    fn minimal_options_build() {
        let payload =
            JoinPayload::build(&json!({"roomId": "r", "userId": "u", "duration": 30})).unwrap();
        assert_eq!(payload.room_id, "r");
        assert_eq!(payload.user_id, "u");
        assert_eq!(payload.duration, 30.0);
    }

    #[test]
    fn float_duration_is_numeric() {
        let payload =
            JoinPayload::build(&json!({"roomId": "r", "userId": "u", "duration": 30.5})).unwrap();
        assert_eq!(payload.duration, 30.5);
    }

    #[test]
    fn fractional_options_are_not_truncated() {
        let payload = JoinPayload::build(&json!({
            "roomId": "r",
            "userId": "u",
            "duration": 30,
            "frameRate": 29.97,
        }))
        .unwrap();
        assert_eq!(payload.frame_rate, Some(29.97));

        let serialized = serde_json::to_value(&payload).unwrap();
        assert_eq!(serialized["frameRate"], 29.97);
    }

    #[test]
    fn malformed_optionals_are_absent_not_null() {
        let payload = JoinPayload::build(&json!({
            "roomId": "r",
            "userId": "u",
            "duration": 30,
            "size": "big",
            "width": "wide",
            "frameRate": [30],
            "videoFormat": "AV1",
            "gpu": false,
        }))
        .unwrap();

        assert_eq!(payload.size, None);
        assert_eq!(payload.width, None);
        assert_eq!(payload.frame_rate, None);
        assert_eq!(payload.video_format, None);
        assert_eq!(payload.gpu, None);

        let serialized = keys(&payload);
        for dropped in ["size", "width", "frameRate", "videoFormat", "gpu"] {
            assert!(!serialized.contains(&dropped.to_owned()), "{dropped} still present");
        }
    }

    #[test]
    fn valid_optionals_survive() {
        let payload = JoinPayload::build(&json!({
            "roomId": "r",
            "userId": "u",
            "duration": 30,
            "size": 2,
            "width": 640,
            "height": 480,
            "frameRate": 25,
            "videoFormat": "VP8",
            "audioFx": "reverb",
            "gpu": true,
        }))
        .unwrap();

        assert_eq!(payload.size, Some(2.0));
        assert_eq!(payload.width, Some(640.0));
        assert_eq!(payload.height, Some(480.0));
        assert_eq!(payload.frame_rate, Some(25.0));
        assert_eq!(payload.video_format.as_deref(), Some("VP8"));
        assert_eq!(payload.audio_fx.as_deref(), Some("reverb"));
        assert_eq!(payload.gpu, Some(true));
    }

    #[test]
    fn wire_names_are_camel_case() {
        let payload = JoinPayload::build(&json!({
            "roomId": "r",
            "userId": "u",
            "duration": 30,
            "frameRate": 25,
        }))
        .unwrap();
        let serialized = keys(&payload);
        assert!(serialized.contains(&"roomId".to_owned()));
        assert!(serialized.contains(&"userId".to_owned()));
        assert!(serialized.contains(&"frameRate".to_owned()));
    }
}
