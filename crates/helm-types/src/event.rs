use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    MessageInfo, Part, PermissionReply, PermissionRequest, QuestionRequest, Session,
    SessionStatus, Todo,
};

/// Envelope as it arrives on the engine's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

/// Every engine event the client acts on. Kinds outside this set are dropped when parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SessionCreated { info: Session },
    SessionUpdated { info: Session },
    SessionDeleted { info: Session },
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    SessionIdle {
        session_id: String,
    },
    SessionError {
        session_id: Option<String>,
        error: Option<Value>,
    },
    MessageUpdated { info: MessageInfo },
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    PartUpdated { part: Part },
    PartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },
    TodoUpdated {
        session_id: String,
        todos: Vec<Todo>,
    },
    QuestionAsked(QuestionRequest),
    QuestionReplied {
        session_id: String,
        request_id: String,
    },
    QuestionRejected {
        session_id: String,
        request_id: String,
    },
    PermissionAsked(PermissionRequest),
    PermissionReplied {
        session_id: String,
        request_id: String,
        reply: Option<PermissionReply>,
    },
    McpToolsChanged { server: Option<String> },
}

#[derive(Deserialize)]
struct InfoProps<T> {
    info: T,
}

#[derive(Deserialize)]
struct SessionRefProps {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct StatusProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: SessionStatus,
}

#[derive(Deserialize)]
struct SessionErrorProps {
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct MessageRefProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
}

#[derive(Deserialize)]
struct PartProps {
    part: Part,
}

#[derive(Deserialize)]
struct PartRefProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "partID")]
    part_id: String,
}

#[derive(Deserialize)]
struct TodoProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    todos: Vec<Todo>,
}

#[derive(Deserialize)]
struct RequestRefProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "requestID")]
    request_id: String,
    #[serde(default)]
    reply: Option<PermissionReply>,
}

#[derive(Deserialize)]
struct McpProps {
    #[serde(default)]
    server: Option<String>,
}

fn props<T: DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

impl EngineEvent {
    /// Converts a raw envelope. `Ok(None)` means the kind is not one the client handles.
    pub fn from_raw(raw: RawEvent) -> Result<Option<Self>, serde_json::Error> {
        let p = raw.properties;
        let event = match raw.event_type.trim() {
            "session.created" => EngineEvent::SessionCreated {
                info: props::<InfoProps<Session>>(p)?.info,
            },
            "session.updated" => EngineEvent::SessionUpdated {
                info: props::<InfoProps<Session>>(p)?.info,
            },
            "session.deleted" => EngineEvent::SessionDeleted {
                info: props::<InfoProps<Session>>(p)?.info,
            },
            "session.status" => {
                let StatusProps { session_id, status } = props(p)?;
                EngineEvent::SessionStatusChanged { session_id, status }
            }
            "session.idle" => EngineEvent::SessionIdle {
                session_id: props::<SessionRefProps>(p)?.session_id,
            },
            "session.error" => {
                let SessionErrorProps { session_id, error } = props(p)?;
                EngineEvent::SessionError { session_id, error }
            }
            "message.updated" => EngineEvent::MessageUpdated {
                info: props::<InfoProps<MessageInfo>>(p)?.info,
            },
            "message.removed" => {
                let MessageRefProps {
                    session_id,
                    message_id,
                } = props(p)?;
                EngineEvent::MessageRemoved {
                    session_id,
                    message_id,
                }
            }
            "message.part.updated" => EngineEvent::PartUpdated {
                part: props::<PartProps>(p)?.part,
            },
            "message.part.removed" => {
                let PartRefProps {
                    session_id,
                    message_id,
                    part_id,
                } = props(p)?;
                EngineEvent::PartRemoved {
                    session_id,
                    message_id,
                    part_id,
                }
            }
            "todo.updated" => {
                let TodoProps { session_id, todos } = props(p)?;
                EngineEvent::TodoUpdated { session_id, todos }
            }
            "question.asked" => EngineEvent::QuestionAsked(props(p)?),
            "question.replied" => {
                let r: RequestRefProps = props(p)?;
                EngineEvent::QuestionReplied {
                    session_id: r.session_id,
                    request_id: r.request_id,
                }
            }
            "question.rejected" => {
                let r: RequestRefProps = props(p)?;
                EngineEvent::QuestionRejected {
                    session_id: r.session_id,
                    request_id: r.request_id,
                }
            }
            "permission.asked" => EngineEvent::PermissionAsked(props(p)?),
            "permission.replied" => {
                let r: RequestRefProps = props(p)?;
                EngineEvent::PermissionReplied {
                    session_id: r.session_id,
                    request_id: r.request_id,
                    reply: r.reply,
                }
            }
            "mcp.tools.changed" => EngineEvent::McpToolsChanged {
                server: props::<McpProps>(p)?.server,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Parses one `data:` payload from the event stream.
    pub fn parse(data: &str) -> Result<Option<Self>, serde_json::Error> {
        let raw: RawEvent = serde_json::from_str(data)?;
        Self::from_raw(raw)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::SessionCreated { .. } => "session.created",
            EngineEvent::SessionUpdated { .. } => "session.updated",
            EngineEvent::SessionDeleted { .. } => "session.deleted",
            EngineEvent::SessionStatusChanged { .. } => "session.status",
            EngineEvent::SessionIdle { .. } => "session.idle",
            EngineEvent::SessionError { .. } => "session.error",
            EngineEvent::MessageUpdated { .. } => "message.updated",
            EngineEvent::MessageRemoved { .. } => "message.removed",
            EngineEvent::PartUpdated { .. } => "message.part.updated",
            EngineEvent::PartRemoved { .. } => "message.part.removed",
            EngineEvent::TodoUpdated { .. } => "todo.updated",
            EngineEvent::QuestionAsked(_) => "question.asked",
            EngineEvent::QuestionReplied { .. } => "question.replied",
            EngineEvent::QuestionRejected { .. } => "question.rejected",
            EngineEvent::PermissionAsked(_) => "permission.asked",
            EngineEvent::PermissionReplied { .. } => "permission.replied",
            EngineEvent::McpToolsChanged { .. } => "mcp.tools.changed",
        }
    }

    /// Session the event is scoped to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            EngineEvent::SessionCreated { info }
            | EngineEvent::SessionUpdated { info }
            | EngineEvent::SessionDeleted { info } => Some(&info.id),
            EngineEvent::SessionStatusChanged { session_id, .. }
            | EngineEvent::SessionIdle { session_id }
            | EngineEvent::MessageRemoved { session_id, .. }
            | EngineEvent::PartRemoved { session_id, .. }
            | EngineEvent::TodoUpdated { session_id, .. }
            | EngineEvent::QuestionReplied { session_id, .. }
            | EngineEvent::QuestionRejected { session_id, .. }
            | EngineEvent::PermissionReplied { session_id, .. } => Some(session_id),
            EngineEvent::SessionError { session_id, .. } => session_id.as_deref(),
            EngineEvent::MessageUpdated { info } => Some(&info.session_id),
            EngineEvent::PartUpdated { part } => Some(&part.session_id),
            EngineEvent::QuestionAsked(request) => Some(&request.session_id),
            EngineEvent::PermissionAsked(request) => Some(&request.session_id),
            EngineEvent::McpToolsChanged { .. } => None,
        }
    }
}
