use crate::errors::ReplayError;
use crate::types::{PortId, TabId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Dom,
    Capture,
    Completed,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dom => "dom",
            Self::Capture => "capture",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Kinds the replay engine dispatches to a page. Everything else is
    /// observed during replay but never re-executed.
    pub fn is_replayable(self) -> bool {
        matches!(self, Self::Dom | Self::Capture)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: EventData,
    #[serde(default)]
    pub frame: FrameInfo,
    #[serde(default)]
    pub meta: EventMeta,
    #[serde(default)]
    pub timing: EventTiming,
}

/// Semantic payload. Known fields are typed; DOM-specific fields
/// (`type`, `button`, `keyCode`, ...) ride along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventData {
    #[serde(default, rename = "timeStamp")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub cascading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    pub port: Option<PortId>,
    pub tab: Option<TabId>,
    pub top_frame: bool,
    pub iframe_index: i64,
    #[serde(rename = "topURL")]
    pub top_url: Option<String>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self {
            port: None,
            tab: None,
            top_frame: true,
            iframe_index: -1,
            top_url: None,
            url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub id: String,
    pub page_event_id: Option<u64>,
    /// Id of the scripted event this live event re-produces during replay.
    pub record_id: Option<String>,
    pub end_event_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerPredicate {
    pub event_id: String,
    pub start: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventTiming {
    pub wait_time: i64,
    pub trigger_condition: Option<Vec<TriggerPredicate>>,
    pub wait_event: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, timestamp: i64) -> Self {
        Self {
            kind,
            data: EventData {
                timestamp,
                ..EventData::default()
            },
            frame: FrameInfo::default(),
            meta: EventMeta::default(),
            timing: EventTiming::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Text a capture event scraped when it was recorded.
    pub fn recorded_inner_text(&self) -> Option<String> {
        self.data
            .target
            .as_ref()?
            .pointer("/snapshot/prop/innerText")?
            .as_str()
            .map(str::to_string)
    }

    /// Read a nested field by dotted path, e.g. `data.target.xpath`.
    pub fn get_field(&self, path: &str) -> Result<Value, ReplayError> {
        let root = self.to_value()?;
        let mut cursor = &root;
        for segment in path.split('.') {
            cursor = cursor
                .as_object()
                .and_then(|obj| obj.get(segment))
                .ok_or_else(|| self.field_not_found(path))?;
        }
        Ok(cursor.clone())
    }

    /// Set a nested field by dotted path.
    ///
    /// Every parent segment must already exist. The leaf must exist too,
    /// except under `data`, which carries open-ended page payload. The
    /// rewritten event must still fit the typed model; on any failure the
    /// event is left untouched.
    pub fn set_field(&mut self, path: &str, value: Value) -> Result<(), ReplayError> {
        let segments = path.split('.').collect::<Vec<_>>();
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(self.field_not_found(path));
        };
        if leaf.is_empty() {
            return Err(self.field_not_found(path));
        }

        let mut root = self.to_value()?;
        let mut cursor = &mut root;
        for segment in parents {
            cursor = cursor
                .as_object_mut()
                .and_then(|obj| obj.get_mut(*segment))
                .ok_or_else(|| self.field_not_found(path))?;
        }
        let parent = cursor
            .as_object_mut()
            .ok_or_else(|| self.field_not_found(path))?;
        let open_ended = segments.first() == Some(&"data") && segments.len() > 1;
        if !parent.contains_key(*leaf) && !open_ended {
            return Err(self.field_not_found(path));
        }
        parent.insert((*leaf).to_string(), value);

        let updated = from_value::<Event>(root).map_err(|reason| ReplayError::InvalidFieldValue {
            event_id: self.meta.id.clone(),
            path: path.to_string(),
            reason,
        })?;
        *self = updated;
        Ok(())
    }

    fn to_value(&self) -> Result<Value, ReplayError> {
        serde_json::to_value(self).map_err(|e| ReplayError::InvalidFieldValue {
            event_id: self.meta.id.clone(),
            path: String::new(),
            reason: e.to_string(),
        })
    }

    fn field_not_found(&self, path: &str) -> ReplayError {
        ReplayError::FieldNotFound {
            event_id: self.meta.id.clone(),
            path: path.to_string(),
        }
    }
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Free-form annotation attached to a script (notes, tags).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Annotation {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Script {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    pub events: Vec<Event>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Script {
    pub fn new(name: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            id: None,
            name: name.into(),
            events,
            annotations: Vec::new(),
        }
    }

    pub fn position_of(&self, event_id: &str) -> Option<usize> {
        self.events.iter().position(|e| e.meta.id == event_id)
    }

    pub fn event(&self, event_id: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.meta.id == event_id)
    }
}

/// Content scraped from the page for one capture-type event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub inner_text: Option<String>,
    #[serde(default, rename = "innerHTML")]
    pub inner_html: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
}
