//! Kinesis Video signaling frames. Payloads travel as base64 encoded JSON
//! in both directions.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use kinesis_webrtc::rtc::IceCandidate;
use kinesis_webrtc::signaling::{OutboundSignal, SignalingEvent};
use kinesis_webrtc::SignalingError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundFrame<'a> {
    action: &'static str,
    message_payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient_client_id: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    message_type: String,
    #[serde(default)]
    message_payload: Option<String>,
    #[serde(default)]
    sender_client_id: Option<String>,
    #[serde(default)]
    status_response: Option<StatusResponse>,
}

/// Delivery report the service sends back for a message it rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Signal(SignalingEvent),
    Status(StatusResponse),
    GoAway,
    ReconnectIceServer,
    Unknown(String),
}

pub fn action(signal: &OutboundSignal) -> &'static str {
    match signal {
        OutboundSignal::SdpOffer(_) => "SDP_OFFER",
        OutboundSignal::SdpAnswer(_) => "SDP_ANSWER",
        OutboundSignal::IceCandidate(_) => "ICE_CANDIDATE",
    }
}

pub fn encode(signal: &OutboundSignal, recipient: Option<&str>) -> Result<String, SignalingError> {
    let payload = match signal {
        OutboundSignal::SdpOffer(description) | OutboundSignal::SdpAnswer(description) => {
            serde_json::to_vec(description)
        }
        OutboundSignal::IceCandidate(candidate) => serde_json::to_vec(candidate),
    }
    .map_err(|err| SignalingError::Encode(err.to_string()))?;

    serde_json::to_string(&OutboundFrame {
        action: action(signal),
        message_payload: STANDARD.encode(payload),
        recipient_client_id: recipient,
    })
    .map_err(|err| SignalingError::Encode(err.to_string()))
}

/// `Ok(None)` for the empty frames the service uses as keepalives.
pub fn decode(text: &str) -> Result<Option<InboundMessage>, SignalingError> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let frame: InboundFrame = serde_json::from_str(text)
        .map_err(|err| SignalingError::Transport(format!("malformed frame: {err}")))?;
    let sender_client_id = frame.sender_client_id.filter(|id| !id.is_empty());

    let message = match frame.message_type.as_str() {
        "SDP_OFFER" => InboundMessage::Signal(SignalingEvent::SdpOffer {
            description: payload(frame.message_payload.as_deref())?,
            sender_client_id,
        }),
        "SDP_ANSWER" => InboundMessage::Signal(SignalingEvent::SdpAnswer {
            description: payload(frame.message_payload.as_deref())?,
            sender_client_id,
        }),
        "ICE_CANDIDATE" => InboundMessage::Signal(SignalingEvent::IceCandidate {
            candidate: payload::<Option<IceCandidate>>(frame.message_payload.as_deref())?,
            sender_client_id,
        }),
        "STATUS_RESPONSE" => InboundMessage::Status(frame.status_response.unwrap_or_default()),
        "GO_AWAY" => InboundMessage::GoAway,
        "RECONNECT_ICE_SERVER" => InboundMessage::ReconnectIceServer,
        other => InboundMessage::Unknown(other.to_string()),
    };
    Ok(Some(message))
}

fn payload<T: serde::de::DeserializeOwned>(encoded: Option<&str>) -> Result<T, SignalingError> {
    let encoded = encoded.unwrap_or_default();
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| SignalingError::Transport(format!("payload is not base64: {err}")))?;
    if bytes.is_empty() {
        return serde_json::from_value(Value::Null)
            .map_err(|err| SignalingError::Transport(format!("empty payload: {err}")));
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| SignalingError::Transport(format!("payload is not valid json: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinesis_webrtc::rtc::SessionDescription;

    fn frame(message_type: &str, payload: &Value, sender: Option<&str>) -> String {
        let mut frame = serde_json::json!({
            "messageType": message_type,
            "messagePayload": STANDARD.encode(payload.to_string()),
        });
        if let Some(sender) = sender {
            frame["senderClientId"] = Value::from(sender);
        }
        frame.to_string()
    }

    #[test]
    fn encodes_answer_for_recipient() {
        let text = encode(
            &OutboundSignal::SdpAnswer(SessionDescription::answer("v=0")),
            Some("viewer-1"),
        )
        .expect("encoded");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["action"], "SDP_ANSWER");
        assert_eq!(value["recipientClientId"], "viewer-1");

        let payload = STANDARD
            .decode(value["messagePayload"].as_str().expect("payload"))
            .expect("base64");
        let description: Value = serde_json::from_slice(&payload).expect("json payload");
        assert_eq!(description, serde_json::json!({"type": "answer", "sdp": "v=0"}));
    }

    #[test]
    fn offer_without_recipient_omits_field() {
        let text = encode(&OutboundSignal::SdpOffer(SessionDescription::offer("v=0")), None)
            .expect("encoded");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["action"], "SDP_OFFER");
        assert!(value.get("recipientClientId").is_none());
    }

    #[test]
    fn candidate_payload_uses_browser_field_names() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_m_line_index = Some(0);
        let text = encode(&OutboundSignal::IceCandidate(candidate), None).expect("encoded");
        let value: Value = serde_json::from_str(&text).expect("json");
        let payload = STANDARD
            .decode(value["messagePayload"].as_str().expect("payload"))
            .expect("base64");
        let inner: Value = serde_json::from_slice(&payload).expect("json payload");
        assert_eq!(inner["sdpMid"], "0");
        assert_eq!(inner["sdpMLineIndex"], 0);
    }

    #[test]
    fn decodes_offer_with_sender() {
        let text = frame(
            "SDP_OFFER",
            &serde_json::json!({"type": "offer", "sdp": "v=0"}),
            Some("viewer-9"),
        );
        let message = decode(&text).expect("decoded").expect("message");
        assert_eq!(
            message,
            InboundMessage::Signal(SignalingEvent::SdpOffer {
                description: SessionDescription::offer("v=0"),
                sender_client_id: Some("viewer-9".into()),
            })
        );
    }

    #[test]
    fn null_candidate_decodes_as_missing() {
        let text = frame("ICE_CANDIDATE", &Value::Null, Some("viewer-9"));
        let message = decode(&text).expect("decoded").expect("message");
        assert_eq!(
            message,
            InboundMessage::Signal(SignalingEvent::IceCandidate {
                candidate: None,
                sender_client_id: Some("viewer-9".into()),
            })
        );
    }

    #[test]
    fn empty_sender_is_treated_as_absent() {
        let text = frame(
            "SDP_ANSWER",
            &serde_json::json!({"type": "answer", "sdp": "v=0"}),
            Some(""),
        );
        match decode(&text).expect("decoded") {
            Some(InboundMessage::Signal(SignalingEvent::SdpAnswer {
                sender_client_id, ..
            })) => assert_eq!(sender_client_id, None),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn service_messages_are_recognised() {
        let status = r#"{"messageType":"STATUS_RESPONSE","statusResponse":{"correlationId":"c1","errorType":"InvalidArgumentException","statusCode":"400","description":"bad"}}"#;
        match decode(status).expect("decoded") {
            Some(InboundMessage::Status(response)) => {
                assert_eq!(response.status_code.as_deref(), Some("400"));
                assert_eq!(response.correlation_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(
            decode(r#"{"messageType":"GO_AWAY"}"#).expect("decoded"),
            Some(InboundMessage::GoAway)
        );
        assert_eq!(
            decode(r#"{"messageType":"RECONNECT_ICE_SERVER"}"#).expect("decoded"),
            Some(InboundMessage::ReconnectIceServer)
        );
    }

    #[test]
    fn empty_frames_are_ignored_and_garbage_is_rejected() {
        assert_eq!(decode("").expect("decoded"), None);
        assert_eq!(decode("  \n").expect("decoded"), None);
        assert!(decode("not json").is_err());
        assert!(decode(&frame("SDP_OFFER", &Value::from(5), None)).is_err());
    }
}
