//! NIP-01 relay wire frames.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::event::Event;

/// Subscription filter shared by every relay connection.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscriptionFilter {
    pub kinds: Vec<u32>,
    /// Tag filters keyed by their `#` prefix (e.g. `#p`).
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: u64,
}

impl SubscriptionFilter {
    /// Same filter with a different lower bound.
    pub fn with_since(&self, since: u64) -> Self {
        Self {
            since,
            ..self.clone()
        }
    }
}

/// Frames sent from this client to a relay.
#[derive(Debug)]
pub enum ClientMessage<'a> {
    Req {
        sub_id: &'a str,
        filter: &'a SubscriptionFilter,
    },
    Close {
        sub_id: &'a str,
    },
    Event(&'a Event),
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::Req { sub_id, filter } => json!(["REQ", sub_id, filter]),
            ClientMessage::Close { sub_id } => json!(["CLOSE", sub_id]),
            ClientMessage::Event(ev) => json!(["EVENT", ev]),
        }
        .to_string()
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <sub id>, <event>]`
    Event { sub_id: String, event: Box<Event> },
    /// `["NOTICE", <message>]`
    Notice(String),
    /// `["OK", <event id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", <sub id>]`
    Eose(String),
    /// `["CLOSED", <sub id>, <message>]`
    Closed { sub_id: String, message: String },
}

impl RelayMessage {
    /// Decode a text frame. Anything that is not a well-formed, recognized
    /// frame yields `None`; relays misbehaving must never take the reader
    /// down with them.
    pub fn parse(text: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(text).ok()?;
        let arr = val.as_array()?;
        let str_at = |i: usize| arr.get(i).and_then(Value::as_str).map(str::to_string);
        match arr.first().and_then(Value::as_str)? {
            "EVENT" => {
                let event = serde_json::from_value::<Event>(arr.get(2)?.clone()).ok()?;
                Some(RelayMessage::Event {
                    sub_id: str_at(1)?,
                    event: Box::new(event),
                })
            }
            "NOTICE" => Some(RelayMessage::Notice(str_at(1)?)),
            "OK" => Some(RelayMessage::Ok {
                event_id: str_at(1)?,
                accepted: arr.get(2)?.as_bool()?,
                message: str_at(3).unwrap_or_default(),
            }),
            "EOSE" => Some(RelayMessage::Eose(str_at(1)?)),
            "CLOSED" => Some(RelayMessage::Closed {
                sub_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_json(pubkey: &str) -> Value {
        json!({
            "id": "e1", "pubkey": pubkey, "kind": 1, "created_at": 1700000000,
            "tags": [["p", "22".repeat(32)]], "content": "hi", "sig": "00"
        })
    }

    #[test]
    fn req_frame_shape() {
        let filter = SubscriptionFilter {
            kinds: vec![1, 4],
            tags: BTreeMap::from([("#p".to_string(), vec!["ab".to_string()])]),
            since: 5,
        };
        let msg = ClientMessage::Req {
            sub_id: "s1",
            filter: &filter,
        };
        let val: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(
            val,
            json!(["REQ", "s1", {"kinds": [1, 4], "#p": ["ab"], "since": 5}])
        );
        assert_eq!(
            ClientMessage::Close { sub_id: "s1" }.to_json(),
            r#"["CLOSE","s1"]"#
        );
    }

    #[test]
    fn parses_event_frame() {
        let text = json!(["EVENT", "sub1", event_json(&"11".repeat(32))]).to_string();
        match RelayMessage::parse(&text) {
            Some(RelayMessage::Event { sub_id, event }) => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(event.id, "e1");
                assert_eq!(event.kind, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_informational_frames() {
        assert_eq!(
            RelayMessage::parse(r#"["NOTICE","slow down"]"#),
            Some(RelayMessage::Notice("slow down".into()))
        );
        assert_eq!(
            RelayMessage::parse(r#"["OK","e1",false,"blocked: spam"]"#),
            Some(RelayMessage::Ok {
                event_id: "e1".into(),
                accepted: false,
                message: "blocked: spam".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","sub1"]"#),
            Some(RelayMessage::Eose("sub1".into()))
        );
        assert_eq!(
            RelayMessage::parse(r#"["CLOSED","sub1","auth-required: no"]"#),
            Some(RelayMessage::Closed {
                sub_id: "sub1".into(),
                message: "auth-required: no".into()
            })
        );
    }

    #[test]
    fn drops_malformed_frames() {
        for text in [
            "",
            "not json",
            r#"["EVENT","sub1""#,
            r#"{"EVENT":1}"#,
            r#"[]"#,
            r#"["AUTH","challenge"]"#,
            r#"["EVENT","sub1"]"#,
            r#"["EVENT","sub1",{"id":"e1"}]"#,
            r#"["OK","e1","yes"]"#,
            r#"[1,2,3]"#,
        ] {
            assert_eq!(RelayMessage::parse(text), None, "{text}");
        }
        let bad_key = json!(["EVENT", "sub1", event_json("zz")]).to_string();
        assert_eq!(RelayMessage::parse(&bad_key), None);
    }
}
