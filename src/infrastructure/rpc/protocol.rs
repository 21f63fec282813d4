//! RPC Wire Protocol
//!
//! Clients and the daemon exchange newline-delimited JSON objects over a
//! local socket. A call looks like
//!
//! ```text
//! {"serial":7,"method":"SetProperty","adapter":0,"name":"Powered","value":true}
//! ```
//!
//! and is answered by a `reply` carrying the same serial. Signals are pushed
//! to clients as they happen and are interleaved with replies.

use crate::domain::error::ErrorReply;
use crate::domain::models::{BdAddr, ClientId, Mode, PropertyValue, Signal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum RpcCall {
    ListAdapters,
    DefaultAdapter,
    GetProperties {
        adapter: u16,
    },
    SetProperty {
        adapter: u16,
        name: String,
        value: PropertyValue,
    },
    /// Hold the adapter in at least `mode`, or its remembered on-mode.
    RequestSession {
        adapter: u16,
        #[serde(default)]
        mode: Option<Mode>,
    },
    ReleaseSession {
        adapter: u16,
    },
    StartDiscovery {
        adapter: u16,
    },
    StopDiscovery {
        adapter: u16,
    },
    CreateDevice {
        adapter: u16,
        address: BdAddr,
    },
    RemoveDevice {
        adapter: u16,
        path: String,
    },
    FindDevice {
        adapter: u16,
        address: BdAddr,
    },
    ListDevices {
        adapter: u16,
    },
    RegisterAgent {
        adapter: u16,
        path: String,
        #[serde(default)]
        capability: String,
    },
    UnregisterAgent {
        adapter: u16,
        path: String,
    },
    /// Agent's answer to an `AgentRequest` signal.
    AgentReply {
        adapter: u16,
        request_id: u64,
        accepted: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub serial: u64,
    #[serde(flatten)]
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Reply {
        serial: u64,
        result: Result<Value, ErrorReply>,
    },
    Signal {
        signal: Signal,
    },
}

/// What the transport hands to the event loop.
#[derive(Debug)]
pub enum RpcInbound {
    Connected {
        client: ClientId,
        outbox: UnboundedSender<ServerMessage>,
    },
    Call {
        client: ClientId,
        serial: u64,
        call: RpcCall,
    },
    Disconnected {
        client: ClientId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_call() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"serial":7,"method":"SetProperty","adapter":0,"name":"Powered","value":true}"#,
        )
        .unwrap();
        assert_eq!(msg.serial, 7);
        assert_eq!(
            msg.call,
            RpcCall::SetProperty {
                adapter: 0,
                name: "Powered".into(),
                value: PropertyValue::Bool(true)
            }
        );
    }

    #[test]
    fn test_optional_fields() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"serial":1,"method":"RequestSession","adapter":2}"#).unwrap();
        assert_eq!(msg.call, RpcCall::RequestSession { adapter: 2, mode: None });

        let msg: ClientMessage = serde_json::from_str(
            r#"{"serial":2,"method":"RequestSession","adapter":2,"mode":"discoverable"}"#,
        )
        .unwrap();
        assert_eq!(
            msg.call,
            RpcCall::RequestSession {
                adapter: 2,
                mode: Some(Mode::Discoverable)
            }
        );
    }

    #[test]
    fn test_address_field() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"serial":3,"method":"CreateDevice","adapter":0,"address":"00:11:22:33:44:55"}"#,
        )
        .unwrap();
        match msg.call {
            RpcCall::CreateDevice { address, .. } => {
                assert_eq!(address.to_string(), "00:11:22:33:44:55")
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_reply_encoding() {
        let reply = ServerMessage::Reply {
            serial: 4,
            result: Ok(Value::Null),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "reply");
        assert_eq!(json["serial"], 4);

        let signal = ServerMessage::Signal {
            signal: Signal::AdapterAdded { adapter: 1 },
        };
        let json = serde_json::to_string(&signal).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
    }
}
