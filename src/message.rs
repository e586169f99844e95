//! The twelve query/response shapes carried over the wire (§4.3), built on
//! top of the bencode codec (§4.2).
//!
//! Every message carries a transaction token `t`, a discriminator `y`, and
//! an `a` (query) or `r` (reply) dictionary whose `id` holds the sender's
//! [`NodeId`]. Compact node/peer encodings follow the Mainline DHT
//! convention: 20-byte id (only for nodes) ++ 4-byte IPv4 ++ 2-byte port.

use crate::bencode::{dict, Value};
use crate::error::DhtError;
use crate::id::{Contact, Endpoint, NodeId, ID_LEN};
use std::net::Ipv4Addr;

/// Bytes per compact node entry: 20-byte id + 4-byte IPv4 + 2-byte port.
pub const COMPACT_NODE_LEN: usize = ID_LEN + 4 + 2;
/// Bytes per compact peer entry: 4-byte IPv4 + 2-byte port (no id).
pub const COMPACT_PEER_LEN: usize = 4 + 2;

/// Opaque transaction token. Carried verbatim; matched byte-for-byte, never
/// interpreted numerically by a correspondent (§4.7: "an atomic
/// monotonically increasing counter formatted as a two-digit decimal token"
/// on the *sending* side, but any bytes are legal to receive).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TransactionId(pub Vec<u8>);

/// Opaque announce/hash capability token (§4.3, GET_HASH/POST_HASH).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Token(pub Vec<u8>);

/// One of the twelve message shapes, decoded into a typed, validated form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Ping {
        t: TransactionId,
        id: NodeId,
    },
    Pong {
        t: TransactionId,
        id: NodeId,
        v: Option<Vec<u8>>,
    },
    FindNode {
        t: TransactionId,
        id: NodeId,
        target: NodeId,
    },
    ReplyNode {
        t: TransactionId,
        id: NodeId,
        nodes: Vec<Contact>,
    },
    GetHash {
        t: TransactionId,
        id: NodeId,
        info_hash: NodeId,
    },
    ReplyHash {
        t: TransactionId,
        id: NodeId,
        token: Token,
        values: Vec<Endpoint>,
    },
    ReplyNear {
        t: TransactionId,
        id: NodeId,
        token: Token,
        nodes: Vec<Contact>,
    },
    PostHash {
        t: TransactionId,
        id: NodeId,
        info_hash: NodeId,
        port: u16,
        token: Token,
    },
    ReplyPost {
        t: TransactionId,
        id: NodeId,
    },
    NewConn {
        t: TransactionId,
        id: NodeId,
    },
    ReplyNewConn {
        t: TransactionId,
        id: NodeId,
        pid: Contact,
    },
    BroadcastConn {
        t: TransactionId,
        id: NodeId,
        nid: NodeId,
        pid: Contact,
    },
    AskConn {
        t: TransactionId,
        id: NodeId,
        nid: NodeId,
        pid: Contact,
    },
    ReplyConn {
        t: TransactionId,
        id: NodeId,
        nid: NodeId,
        pid: Contact,
    },
}

impl Message {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            Message::Ping { t, .. }
            | Message::Pong { t, .. }
            | Message::FindNode { t, .. }
            | Message::ReplyNode { t, .. }
            | Message::GetHash { t, .. }
            | Message::ReplyHash { t, .. }
            | Message::ReplyNear { t, .. }
            | Message::PostHash { t, .. }
            | Message::ReplyPost { t, .. }
            | Message::NewConn { t, .. }
            | Message::ReplyNewConn { t, .. }
            | Message::BroadcastConn { t, .. }
            | Message::AskConn { t, .. }
            | Message::ReplyConn { t, .. } => t,
        }
    }

    pub fn sender_id(&self) -> NodeId {
        match self {
            Message::Ping { id, .. }
            | Message::Pong { id, .. }
            | Message::FindNode { id, .. }
            | Message::ReplyNode { id, .. }
            | Message::GetHash { id, .. }
            | Message::ReplyHash { id, .. }
            | Message::ReplyNear { id, .. }
            | Message::PostHash { id, .. }
            | Message::ReplyPost { id, .. }
            | Message::NewConn { id, .. }
            | Message::ReplyNewConn { id, .. }
            | Message::BroadcastConn { id, .. }
            | Message::AskConn { id, .. }
            | Message::ReplyConn { id, .. } => *id,
        }
    }

    /// `true` for query (`y=q`) shapes, `false` for replies (`y=r`).
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Message::Ping { .. }
                | Message::FindNode { .. }
                | Message::GetHash { .. }
                | Message::PostHash { .. }
                | Message::NewConn { .. }
                | Message::BroadcastConn { .. }
                | Message::AskConn { .. }
        )
    }

    /// Encodes this message as a bencoded dictionary, writing at most
    /// `max_len` bytes (the node core's 10 KiB scratch buffer, §4.7).
    pub fn encode(&self, max_len: usize) -> Result<Vec<u8>, DhtError> {
        self.to_value().encode(max_len)
    }

    fn to_value(&self) -> Value {
        match self {
            Message::Ping { t, id } => query_value(t, "ping", vec![("id", id_value(id))]),
            Message::Pong { t, id, v } => {
                let mut fields = vec![("id", id_value(id))];
                if let Some(v) = v {
                    fields.push(("v", Value::bytes(v.clone())));
                }
                reply_value(t, fields)
            }
            Message::FindNode { t, id, target } => query_value(
                t,
                "find_node",
                vec![("id", id_value(id)), ("target", id_value(target))],
            ),
            Message::ReplyNode { t, id, nodes } => reply_value(
                t,
                vec![
                    ("id", id_value(id)),
                    ("nodes", Value::bytes(encode_compact_nodes(nodes))),
                ],
            ),
            Message::GetHash { t, id, info_hash } => query_value(
                t,
                "get_peers",
                vec![("id", id_value(id)), ("info_hash", id_value(info_hash))],
            ),
            Message::ReplyHash {
                t,
                id,
                token,
                values,
            } => reply_value(
                t,
                vec![
                    ("id", id_value(id)),
                    ("token", Value::bytes(token.0.clone())),
                    (
                        "values",
                        Value::List(
                            values
                                .iter()
                                .map(|e| Value::bytes(encode_compact_peer(e)))
                                .collect(),
                        ),
                    ),
                ],
            ),
            Message::ReplyNear {
                t,
                id,
                token,
                nodes,
            } => reply_value(
                t,
                vec![
                    ("id", id_value(id)),
                    ("token", Value::bytes(token.0.clone())),
                    ("nodes", Value::bytes(encode_compact_nodes(nodes))),
                ],
            ),
            Message::PostHash {
                t,
                id,
                info_hash,
                port,
                token,
            } => query_value(
                t,
                "announce_peer",
                vec![
                    ("id", id_value(id)),
                    ("info_hash", id_value(info_hash)),
                    ("port", Value::Int(*port as i64)),
                    ("token", Value::bytes(token.0.clone())),
                ],
            ),
            Message::ReplyPost { t, id } => reply_value(t, vec![("id", id_value(id))]),
            Message::NewConn { t, id } => query_value(t, "newconn", vec![("id", id_value(id))]),
            Message::ReplyNewConn { t, id, pid } => reply_value(
                t,
                vec![
                    ("id", id_value(id)),
                    ("newconn", Value::bytes(b"hello".to_vec())),
                    ("pid", Value::bytes(encode_compact_node(pid))),
                ],
            ),
            Message::BroadcastConn { t, id, nid, pid } => query_value(
                t,
                "brconn",
                vec![
                    ("id", id_value(id)),
                    ("nid", id_value(nid)),
                    ("pid", Value::bytes(encode_compact_node(pid))),
                ],
            ),
            Message::AskConn { t, id, nid, pid } => query_value(
                t,
                "askconn",
                vec![
                    ("id", id_value(id)),
                    ("nid", id_value(nid)),
                    ("pid", Value::bytes(encode_compact_node(pid))),
                ],
            ),
            Message::ReplyConn { t, id, nid, pid } => reply_value(
                t,
                vec![
                    ("id", id_value(id)),
                    ("nid", id_value(nid)),
                    ("pid", Value::bytes(encode_compact_node(pid))),
                ],
            ),
        }
    }

    /// Decodes and validates a datagram into one of the twelve shapes
    /// (§4.7, receive path steps 1-3).
    pub fn decode(input: &[u8]) -> Result<Message, DhtError> {
        let (value, _) = Value::decode(input)?;
        let t = value
            .get("t")
            .and_then(Value::as_bytes)
            .ok_or(DhtError::MissingField("t"))?
            .to_vec();
        let t = TransactionId(t);
        let y = value
            .get("y")
            .and_then(Value::as_bytes)
            .ok_or(DhtError::MissingField("y"))?;

        match y {
            b"q" => decode_query(&value, t),
            b"r" => decode_reply(&value, t),
            _ => Err(DhtError::UnknownMessageType),
        }
    }
}

fn query_value(t: &TransactionId, q: &str, a_fields: Vec<(&str, Value)>) -> Value {
    dict(vec![
        ("a", dict(a_fields)),
        ("q", Value::bytes(q.as_bytes().to_vec())),
        ("t", Value::bytes(t.0.clone())),
        ("y", Value::bytes(b"q".to_vec())),
    ])
}

fn reply_value(t: &TransactionId, r_fields: Vec<(&str, Value)>) -> Value {
    dict(vec![
        ("r", dict(r_fields)),
        ("t", Value::bytes(t.0.clone())),
        ("y", Value::bytes(b"r".to_vec())),
    ])
}

fn id_value(id: &NodeId) -> Value {
    Value::bytes(id.as_bytes().to_vec())
}

fn field_id(args: &Value, key: &str) -> Result<NodeId, DhtError> {
    let bytes = args
        .get(key)
        .and_then(Value::as_bytes)
        .ok_or(DhtError::MissingField("id"))?;
    NodeId::from_bytes(bytes).ok_or(DhtError::MissingField("id"))
}

fn decode_query(value: &Value, t: TransactionId) -> Result<Message, DhtError> {
    let q = value
        .get("q")
        .and_then(Value::as_bytes)
        .ok_or(DhtError::MissingField("q"))?;
    let args = value.get("a").ok_or(DhtError::MissingField("a"))?;
    let id = field_id(args, "id")?;

    match q {
        b"ping" => Ok(Message::Ping { t, id }),
        b"find_node" => {
            let target = field_id(args, "target")?;
            Ok(Message::FindNode { t, id, target })
        }
        b"get_peers" => {
            let info_hash = field_id(args, "info_hash")?;
            Ok(Message::GetHash { t, id, info_hash })
        }
        b"announce_peer" => {
            let info_hash = field_id(args, "info_hash")?;
            let port = args
                .get("port")
                .and_then(Value::as_int)
                .ok_or(DhtError::MissingField("port"))? as u16;
            let token = args
                .get("token")
                .and_then(Value::as_bytes)
                .ok_or(DhtError::MissingField("token"))?
                .to_vec();
            Ok(Message::PostHash {
                t,
                id,
                info_hash,
                port,
                token: Token(token),
            })
        }
        b"newconn" => Ok(Message::NewConn { t, id }),
        b"brconn" => {
            let nid = field_id(args, "nid")?;
            let pid = decode_compact_node_field(args, "pid")?;
            Ok(Message::BroadcastConn { t, id, nid, pid })
        }
        b"askconn" => {
            let nid = field_id(args, "nid")?;
            let pid = decode_compact_node_field(args, "pid")?;
            Ok(Message::AskConn { t, id, nid, pid })
        }
        _ => Err(DhtError::UnknownMessageType),
    }
}

fn decode_compact_node_field(args: &Value, key: &str) -> Result<Contact, DhtError> {
    let bytes = args
        .get(key)
        .and_then(Value::as_bytes)
        .ok_or(DhtError::MissingField(key))?;
    decode_compact_node(bytes)
}

/// For replies, the message schema is disambiguated not by a `q`-like
/// field but by which of `{token, values, nodes, newconn, askconn}` are
/// present in the `r` dictionary (§4.3, "Message-type recognition").
fn decode_reply(value: &Value, t: TransactionId) -> Result<Message, DhtError> {
    let r = value.get("r").ok_or(DhtError::MissingField("r"))?;
    let id = field_id(r, "id")?;

    if r.get("newconn").is_some() {
        let pid = decode_compact_node_field(r, "pid")?;
        return Ok(Message::ReplyNewConn { t, id, pid });
    }
    if let Some(nid_bytes) = r.get("nid").and_then(Value::as_bytes) {
        let nid = NodeId::from_bytes(nid_bytes).ok_or(DhtError::MissingField("nid"))?;
        let pid = decode_compact_node_field(r, "pid")?;
        return Ok(Message::ReplyConn { t, id, nid, pid });
    }
    if let Some(token_bytes) = r.get("token").and_then(Value::as_bytes) {
        let token = Token(token_bytes.to_vec());
        if let Some(values) = r.get("values").and_then(Value::as_list) {
            let mut out = Vec::with_capacity(values.len());
            for v in values {
                let bytes = v.as_bytes().ok_or(DhtError::MalformedCompactList)?;
                out.push(decode_compact_peer(bytes)?);
            }
            return Ok(Message::ReplyHash {
                t,
                id,
                token,
                values: out,
            });
        }
        let nodes_bytes = r
            .get("nodes")
            .and_then(Value::as_bytes)
            .ok_or(DhtError::MissingField("nodes"))?;
        let nodes = decode_compact_nodes(nodes_bytes)?;
        return Ok(Message::ReplyNear {
            t,
            id,
            token,
            nodes,
        });
    }
    if let Some(nodes_bytes) = r.get("nodes").and_then(Value::as_bytes) {
        let nodes = decode_compact_nodes(nodes_bytes)?;
        return Ok(Message::ReplyNode { t, id, nodes });
    }
    if r.as_dict().map_or(false, |d| d.len() == 1) {
        // Only `id` present: either PONG or REPLY_POST. Both shapes are
        // wire-identical; callers that need to disambiguate do so via the
        // pending-request table keyed by transaction id (§9, resolved).
        return Ok(Message::Pong { t, id, v: None });
    }
    let v = r.get("v").and_then(Value::as_bytes).map(|b| b.to_vec());
    Ok(Message::Pong { t, id, v })
}

/// Encodes a compact node entry: 20-byte id ++ 4-byte IPv4 ++ 2-byte port.
pub fn encode_compact_node(contact: &Contact) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMPACT_NODE_LEN);
    out.extend_from_slice(contact.id.as_bytes());
    out.extend_from_slice(&contact.endpoint.ip.octets());
    out.extend_from_slice(&contact.endpoint.port.to_be_bytes());
    out
}

pub fn decode_compact_node(bytes: &[u8]) -> Result<Contact, DhtError> {
    if bytes.len() != COMPACT_NODE_LEN {
        return Err(DhtError::MalformedCompactList);
    }
    let id = NodeId::from_bytes(&bytes[0..ID_LEN]).ok_or(DhtError::MalformedCompactList)?;
    let ip = Ipv4Addr::new(bytes[ID_LEN], bytes[ID_LEN + 1], bytes[ID_LEN + 2], bytes[ID_LEN + 3]);
    let port = u16::from_be_bytes([bytes[ID_LEN + 4], bytes[ID_LEN + 5]]);
    Ok(Contact::new(id, Endpoint::new(ip, port)))
}

pub fn encode_compact_nodes(nodes: &[Contact]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for n in nodes {
        out.extend_from_slice(&encode_compact_node(n));
    }
    out
}

pub fn decode_compact_nodes(bytes: &[u8]) -> Result<Vec<Contact>, DhtError> {
    if bytes.len() % COMPACT_NODE_LEN != 0 {
        return Err(DhtError::MalformedCompactList);
    }
    bytes
        .chunks(COMPACT_NODE_LEN)
        .map(decode_compact_node)
        .collect()
}

/// Encodes a compact peer entry: 4-byte IPv4 ++ 2-byte port (no id).
pub fn encode_compact_peer(endpoint: &Endpoint) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMPACT_PEER_LEN);
    out.extend_from_slice(&endpoint.ip.octets());
    out.extend_from_slice(&endpoint.port.to_be_bytes());
    out
}

pub fn decode_compact_peer(bytes: &[u8]) -> Result<Endpoint, DhtError> {
    if bytes.len() != COMPACT_PEER_LEN {
        return Err(DhtError::MalformedCompactList);
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Ok(Endpoint::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        NodeId([byte; ID_LEN])
    }

    fn contact(byte: u8, port: u16) -> Contact {
        Contact::new(id(byte), Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), port))
    }

    #[test]
    fn ping_round_trip() {
        let msg = Message::Ping {
            t: TransactionId(b"aa".to_vec()),
            id: id(1),
        };
        let bytes = msg.encode(10 * 1024).unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn find_node_round_trip_matches_scenario_1() {
        let msg = Message::FindNode {
            t: TransactionId(b"aa".to_vec()),
            id: id(1),
            target: id(2),
        };
        let bytes = msg.encode(10 * 1024).unwrap();
        let expected = format!(
            "d1:ad2:id20:{}6:target20:{}e1:q9:find_node1:t2:aa1:y1:qe",
            "\u{1}".repeat(20),
            "\u{2}".repeat(20)
        );
        assert_eq!(bytes, expected.into_bytes());
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn reply_node_round_trip_with_compact_list() {
        let nodes = vec![contact(3, 1000), contact(4, 2000)];
        let msg = Message::ReplyNode {
            t: TransactionId(b"bb".to_vec()),
            id: id(1),
            nodes: nodes.clone(),
        };
        let bytes = msg.encode(10 * 1024).unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        if let Message::ReplyNode { nodes: got, .. } = decoded {
            assert_eq!(got, nodes);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn reply_hash_round_trip() {
        let values = vec![
            Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 6775),
            Endpoint::new(Ipv4Addr::new(5, 6, 7, 8), 6776),
        ];
        let msg = Message::ReplyHash {
            t: TransactionId(b"cc".to_vec()),
            id: id(9),
            token: Token(b"tok1".to_vec()),
            values,
        };
        let bytes = msg.encode(10 * 1024).unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn reply_new_conn_round_trip() {
        let msg = Message::ReplyNewConn {
            t: TransactionId(b"dd".to_vec()),
            id: id(1),
            pid: contact(5, 1234),
        };
        let bytes = msg.encode(10 * 1024).unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn three_party_triad_round_trip() {
        let broadcast = Message::BroadcastConn {
            t: TransactionId(b"ee".to_vec()),
            id: id(1),
            nid: id(2),
            pid: contact(3, 55),
        };
        let ask = Message::AskConn {
            t: TransactionId(b"ff".to_vec()),
            id: id(2),
            nid: id(1),
            pid: contact(3, 55),
        };
        let reply = Message::ReplyConn {
            t: TransactionId(b"ff".to_vec()),
            id: id(3),
            nid: id(1),
            pid: contact(3, 55),
        };
        for msg in [&broadcast, &ask, &reply] {
            let bytes = msg.encode(10 * 1024).unwrap();
            let decoded = Message::decode(&bytes).unwrap();
            assert_eq!(&decoded, *msg);
        }
    }

    #[test]
    fn decode_missing_field_is_rejected() {
        // find_node without a target.
        let bad = dict(vec![
            ("a", dict(vec![("id", Value::bytes(vec![1u8; 20]))])),
            ("q", Value::bytes(b"find_node".to_vec())),
            ("t", Value::bytes(b"aa".to_vec())),
            ("y", Value::bytes(b"q".to_vec())),
        ]);
        let bytes = bad.encode(10 * 1024).unwrap();
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn decode_unknown_query_type_is_rejected() {
        let bad = dict(vec![
            ("a", dict(vec![("id", Value::bytes(vec![1u8; 20]))])),
            ("q", Value::bytes(b"bogus".to_vec())),
            ("t", Value::bytes(b"aa".to_vec())),
            ("y", Value::bytes(b"q".to_vec())),
        ]);
        let bytes = bad.encode(10 * 1024).unwrap();
        assert!(Message::decode(&bytes).is_err());
    }
}
