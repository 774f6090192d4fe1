use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const PROTOCOL_KIND: &str = "api/v1";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "hck-ping")]
    Ping,
    #[serde(rename = "hck-box-create")]
    BoxCreate,
    #[serde(rename = "hck-box-exec")]
    BoxExec,
    #[serde(rename = "hck-box-describe")]
    BoxDescribe,
    #[serde(rename = "hck-box-list")]
    BoxList,
    #[serde(rename = "hck-box-delete")]
    BoxDelete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "hck-ping",
            Self::BoxCreate => "hck-box-create",
            Self::BoxExec => "hck-box-exec",
            Self::BoxDescribe => "hck-box-describe",
            Self::BoxList => "hck-box-list",
            Self::BoxDelete => "hck-box-delete",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope shared by every request and reply.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    pub kind: String,
    pub origin: String,
    pub method: Method,
    pub body: T,
}

impl<T> Message<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(origin: impl Into<String>, method: Method, body: T) -> Self {
        Self {
            kind: PROTOCOL_KIND.to_string(),
            origin: origin.into(),
            method,
            body,
        }
    }

    /// Request name on the wire, e.g. `api/v1/hck-box-create`.
    pub fn protocol(&self) -> String {
        format!("{}/{}", self.kind, self.method)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .with_context(|| format!("failed to encode {} message", self.method))
    }

    /// Decodes one message and rejects a foreign envelope kind or a reply to
    /// a different method.
    pub fn decode(raw: &[u8], expected: Method) -> Result<Self> {
        let message = serde_json::from_slice::<Self>(raw)
            .with_context(|| format!("failed to decode {expected} message"))?;
        if message.kind != PROTOCOL_KIND {
            anyhow::bail!(
                "unexpected message kind {} for {expected}, expected {PROTOCOL_KIND}",
                message.kind
            );
        }
        if message.method != expected {
            anyhow::bail!(
                "unexpected method {} in reply, expected {expected}",
                message.method
            );
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PingBody {
    pub value: String,
}

impl PingBody {
    pub fn ping() -> Self {
        Self {
            value: "ping".to_string(),
        }
    }

    pub fn pong() -> Self {
        Self {
            value: "pong".to_string(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxCreateRequestBody {
    pub template_name: String,
    pub size: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxCreateResponseBody {
    pub name: String,
    pub size: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxExecRequestBody {
    pub name: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxDescribeRequestBody {
    pub name: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxDescribeResponseBody {
    pub id: String,
    pub name: String,
    pub created: String,
    pub healthy: bool,
    pub size: String,
    pub template: BoxTemplateInfo,
    pub env: Vec<String>,
    pub ports: Vec<String>,
}

/// Git provenance of the template the remote service resolved.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxTemplateInfo {
    pub url: String,
    pub revision: String,
    pub commit: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxListRequestBody {}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxListResponseBody {
    pub items: Vec<BoxListItem>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxListItem {
    pub id: String,
    pub name: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxDeleteRequestBody {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoxDeleteResponseBody {
    pub names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{
        BoxCreateRequestBody, BoxDeleteRequestBody, BoxDescribeResponseBody, BoxListItem,
        BoxListResponseBody, BoxTemplateInfo, Message, Method, PingBody,
    };
    use serde_json::json;

    #[test]
    fn ping_wire_shape() {
        let message = Message::new("hck-v0.1.0", Method::Ping, PingBody::ping());
        assert_eq!(message.protocol(), "api/v1/hck-ping");

        let encoded: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({
                "kind": "api/v1",
                "origin": "hck-v0.1.0",
                "method": "hck-ping",
                "body": { "value": "ping" }
            })
        );
    }

    #[test]
    fn create_request_uses_camel_case_fields() {
        let message = Message::new(
            "hck-v0.1.0",
            Method::BoxCreate,
            BoxCreateRequestBody {
                template_name: "alpine".to_string(),
                size: "S".to_string(),
            },
        );
        let encoded: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(encoded["body"], json!({ "templateName": "alpine", "size": "S" }));
    }

    #[test]
    fn messages_survive_a_round_trip() {
        let describe = Message::new(
            "server",
            Method::BoxDescribe,
            BoxDescribeResponseBody {
                id: "42".to_string(),
                name: "box-alpine-abcde".to_string(),
                created: "2024-03-01T10:00:00Z".to_string(),
                healthy: true,
                size: "S".to_string(),
                template: BoxTemplateInfo {
                    url: "https://github.com/hckops/megalopolis".to_string(),
                    revision: "main".to_string(),
                    commit: "abc123".to_string(),
                    name: "alpine".to_string(),
                },
                env: vec!["TTYD_USERNAME=hck".to_string()],
                ports: vec!["tty:7681".to_string()],
            },
        );
        let raw = describe.encode().unwrap();
        assert_eq!(Message::decode(raw.as_bytes(), Method::BoxDescribe).unwrap(), describe);

        let list = Message::new(
            "server",
            Method::BoxList,
            BoxListResponseBody {
                items: vec![BoxListItem {
                    id: "42".to_string(),
                    name: "box-alpine-abcde".to_string(),
                    healthy: false,
                }],
            },
        );
        let raw = list.encode().unwrap();
        assert_eq!(Message::decode(raw.as_bytes(), Method::BoxList).unwrap(), list);

        let delete = Message::new(
            "client",
            Method::BoxDelete,
            BoxDeleteRequestBody {
                names: vec!["box-alpine-abcde".to_string()],
            },
        );
        let raw = delete.encode().unwrap();
        assert_eq!(Message::decode(raw.as_bytes(), Method::BoxDelete).unwrap(), delete);
    }

    #[test]
    fn decode_rejects_foreign_envelopes() {
        let wrong_kind = br#"{"kind":"api/v2","origin":"x","method":"hck-ping","body":{"value":"pong"}}"#;
        let error = Message::<PingBody>::decode(wrong_kind, Method::Ping).unwrap_err();
        assert!(error.to_string().contains("unexpected message kind"));

        let unknown = br#"{"kind":"api/v1","origin":"x","method":"hck-nope","body":{"value":"pong"}}"#;
        assert!(Message::<PingBody>::decode(unknown, Method::Ping).is_err());

        let other = br#"{"kind":"api/v1","origin":"x","method":"hck-box-list","body":{"value":"pong"}}"#;
        let error = Message::<PingBody>::decode(other, Method::Ping).unwrap_err();
        assert!(error.to_string().contains("unexpected method"));

        assert!(Message::<PingBody>::decode(b"not json", Method::Ping).is_err());
    }
}
