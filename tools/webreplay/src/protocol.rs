use crate::errors::ReplayError;
use crate::event::{Capture, Event};
use crate::event_store::FieldUpdate;
use crate::types::{AckType, PortId, RecordState, TabId};
use serde::{Deserialize, Serialize};
use serde_json::{Deserializer, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetIdRequest {
    #[serde(rename = "URL")]
    pub url: String,
    pub top: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEventRequest {
    pub page_event_id: u64,
    pub updates: Vec<FieldUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(rename = "type")]
    pub ack_type: AckType,
    #[serde(default)]
    pub set_timeout: bool,
    /// Number of events of the dispatched group the page executed. Only
    /// meaningful for `PARTIAL` acknowledgments.
    #[serde(default)]
    pub executed: Option<usize>,
}

/// Messages a page (content script) sends to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum PageMessage {
    GetId(GetIdRequest),
    Event(Event),
    UpdateEvent(UpdateEventRequest),
    Ack(Ack),
    Capture(Event),
    SaveCapture(Capture),
    Prompt(String),
    Url(String),
    Alert(String),
    GetRecording,
    GetParams,
    Disconnect,
}

impl PageMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetId(_) => "getId",
            Self::Event(_) => "event",
            Self::UpdateEvent(_) => "updateEvent",
            Self::Ack(_) => "ack",
            Self::Capture(_) => "capture",
            Self::SaveCapture(_) => "saveCapture",
            Self::Prompt(_) => "prompt",
            Self::Url(_) => "url",
            Self::Alert(_) => "alert",
            Self::GetRecording => "getRecording",
            Self::GetParams => "getParams",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Messages the core sends to a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum CoreMessage {
    Id(PortId),
    Dom(Vec<Event>),
    SimulateCapture(Event),
    Recording(RecordState),
    Reset,
    Stop,
    PauseReplay,
    Params(Value),
    PromptResponse(String),
}

impl CoreMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Id(_) => "id",
            Self::Dom(_) => "dom",
            Self::SimulateCapture(_) => "simulateCapture",
            Self::Recording(_) => "recording",
            Self::Reset => "reset",
            Self::Stop => "stop",
            Self::PauseReplay => "pauseReplay",
            Self::Params(_) => "params",
            Self::PromptResponse(_) => "promptResponse",
        }
    }
}

/// One message delivered by the host. Network events observed by the host
/// itself arrive without a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(default)]
    pub port: Option<PortId>,
    #[serde(default)]
    pub tab: Option<TabId>,
    /// Recording state the page believed it was in when it sent the message.
    #[serde(default)]
    pub state: Option<RecordState>,
    pub message: PageMessage,
}

impl Inbound {
    pub fn from_port(port: impl Into<PortId>, message: PageMessage) -> Self {
        Self {
            port: Some(port.into()),
            tab: None,
            state: None,
            message,
        }
    }

    pub fn network(event: Event) -> Self {
        Self {
            port: None,
            tab: None,
            state: None,
            message: PageMessage::Event(event),
        }
    }

    pub fn with_state(mut self, state: RecordState) -> Self {
        self.state = Some(state);
        self
    }
}

pub fn parse_inbound_jsonl(input: &str) -> Result<Vec<Inbound>, ReplayError> {
    parse_jsonl(input)?
        .into_iter()
        .map(|value| {
            serde_json::from_value::<Inbound>(value)
                .map_err(|e| ReplayError::ProtocolViolation(format!("invalid inbound message: {e}")))
        })
        .collect()
}

pub fn parse_jsonl(input: &str) -> Result<Vec<Value>, ReplayError> {
    let mut out = Vec::new();
    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        out.extend(parse_json_records(line)?);
    }
    Ok(out)
}

pub fn parse_json_records(input: &str) -> Result<Vec<Value>, ReplayError> {
    let out = Deserializer::from_str(input)
        .into_iter::<Value>()
        .collect::<serde_json::Result<Vec<_>>>()
        .map_err(|err| {
            ReplayError::ProtocolViolation(format!(
                "invalid json stream: {err}; input={}",
                input.chars().take(256).collect::<String>(),
            ))
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_messages_use_type_and_value_envelope() {
        let raw = json!({"type": "ack", "value": {"type": "SUCCESS", "setTimeout": true}});
        let message: PageMessage = serde_json::from_value(raw).expect("ack");
        assert_eq!(
            message,
            PageMessage::Ack(Ack {
                ack_type: AckType::Success,
                set_timeout: true,
                executed: None
            })
        );

        let raw = json!({"type": "updateEvent", "value": {"pageEventId": 3, "updates": [{"field": "data.value", "value": "x"}]}});
        let message: PageMessage = serde_json::from_value(raw).expect("update");
        assert_eq!(message.kind(), "updateEvent");
    }

    #[test]
    fn unit_messages_need_no_value() {
        let message: PageMessage =
            serde_json::from_value(json!({"type": "getParams"})).expect("getParams");
        assert_eq!(message, PageMessage::GetParams);
        let rendered = serde_json::to_value(CoreMessage::PauseReplay).expect("serialize");
        assert_eq!(rendered["type"], json!("pauseReplay"));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let err = parse_inbound_jsonl(
            "{\"port\":\"1\",\"message\":{\"type\":\"teleport\",\"value\":null}}",
        )
        .expect_err("unknown type");
        assert!(matches!(err, ReplayError::ProtocolViolation(_)));
    }

    #[test]
    fn inbound_stream_parses_ports_and_network_events() {
        let parsed = parse_inbound_jsonl(concat!(
            "{\"port\":\"2\",\"state\":\"replaying\",\"message\":{\"type\":\"url\",\"value\":\"http://a.test/\"}}\n",
            "{\"message\":{\"type\":\"event\",\"value\":{\"type\":\"completed\",\"data\":{\"timeStamp\":5,\"url\":\"http://a.test/api\"}}}}\n",
        ))
        .expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].state, Some(RecordState::Replaying));
        assert!(parsed[1].port.is_none());
    }

    #[test]
    fn jsonl_parser_rejects_malformed_lines() {
        let err = parse_jsonl("{\"type\":\"ack\"}\n{").expect_err("invalid");
        assert!(format!("{err}").contains("invalid json stream"));
    }
}
