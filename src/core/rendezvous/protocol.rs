//! Rendezvous wire messages.
//!
//! Every message is a JSON envelope `{"type": "...", "payload": ...}`.
//! Outbound messages are a closed enum serialized by serde; inbound messages
//! are decoded by hand so that unknown types can be skipped instead of
//! failing the whole connection.

use crate::core::error::RendezvousError;
use crate::core::transport::{IceCandidate, SessionDescription};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room by id, or ask the relay for a fresh room with `None`.
    Join { room_id: Option<String> },
    Ready {
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    Offer {
        peer_id: String,
        offer: SessionDescription,
    },
    Answer {
        peer_id: String,
        answer: SessionDescription,
    },
    Candidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    Bye {},
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Ready { .. } => "ready",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Bye {} => "bye",
        }
    }

    pub fn encode(&self) -> Result<String, RendezvousError> {
        serde_json::to_string(self).map_err(|e| RendezvousError::Parse(e.to_string()))
    }
}

/// Messages the relay (or the remote party through it) sends to us.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// The room was empty; we are its creator.
    Create { client_id: String },
    /// The room had a waiting party; `peer_id` is that party.
    Join {
        client_id: String,
        peer_id: Option<String>,
    },
    Ready { peer_id: Option<String> },
    Offer {
        peer_id: String,
        offer: SessionDescription,
    },
    Answer {
        peer_id: String,
        answer: SessionDescription,
    },
    Candidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    Bye,
    Error { message: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct CreatePayload {
    client_id: String,
}

#[derive(Deserialize)]
struct JoinPayload {
    client_id: String,
    #[serde(default)]
    peer_id: Option<String>,
}

#[derive(Deserialize)]
struct ReadyPayload {
    #[serde(default)]
    peer_id: Option<String>,
}

#[derive(Deserialize)]
struct OfferPayload {
    peer_id: String,
    #[serde(alias = "sdp")]
    offer: SessionDescription,
}

#[derive(Deserialize)]
struct AnswerPayload {
    peer_id: String,
    #[serde(alias = "sdp")]
    answer: SessionDescription,
}

#[derive(Deserialize)]
struct CandidatePayload {
    peer_id: String,
    candidate: IceCandidate,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorPayload {
    Structured { message: String },
    Bare(String),
}

fn payload<T: DeserializeOwned>(kind: &str, mut value: Value) -> Result<T, RendezvousError> {
    if value.is_null() {
        value = Value::Object(Default::default());
    }
    serde_json::from_value(value).map_err(|e| RendezvousError::Parse(format!("{kind}: {e}")))
}

impl RelayMessage {
    /// Decode one text frame. Unknown message types yield `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<Self>, RendezvousError> {
        let env: Envelope =
            serde_json::from_str(text).map_err(|e| RendezvousError::Parse(e.to_string()))?;
        let kind = env.kind.as_str();

        let msg = match kind {
            "create" => {
                let p: CreatePayload = payload(kind, env.payload)?;
                Self::Create {
                    client_id: p.client_id,
                }
            }
            "join" => {
                let p: JoinPayload = payload(kind, env.payload)?;
                Self::Join {
                    client_id: p.client_id,
                    peer_id: p.peer_id,
                }
            }
            "ready" => {
                let p: ReadyPayload = payload(kind, env.payload)?;
                Self::Ready { peer_id: p.peer_id }
            }
            "offer" => {
                let p: OfferPayload = payload(kind, env.payload)?;
                Self::Offer {
                    peer_id: p.peer_id,
                    offer: p.offer,
                }
            }
            "answer" => {
                let p: AnswerPayload = payload(kind, env.payload)?;
                Self::Answer {
                    peer_id: p.peer_id,
                    answer: p.answer,
                }
            }
            "candidate" => {
                let p: CandidatePayload = payload(kind, env.payload)?;
                Self::Candidate {
                    peer_id: p.peer_id,
                    candidate: p.candidate,
                }
            }
            "bye" => Self::Bye,
            "error" => {
                let message = match serde_json::from_value::<ErrorPayload>(env.payload.clone()) {
                    Ok(ErrorPayload::Structured { message }) | Ok(ErrorPayload::Bare(message)) => {
                        message
                    }
                    Err(_) => env.payload.to_string(),
                };
                Self::Error { message }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}
