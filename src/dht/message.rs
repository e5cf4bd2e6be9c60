//! DHT message module
//!
//! Typed construction of outgoing KRPC messages and sanitization of
//! incoming ones. Outgoing messages are pre-bencoded templates with a
//! single slot for the transaction id; incoming responses are kept raw
//! until the originating query kind is known.

use crate::dht::bencode::{self, BencodeDict, Value};
use crate::dht::compact::{pack_nodes, pack_peers, unpack_nodes, unpack_nodes2, unpack_peers};
use crate::dht::node::{Node, NodeId};
use crate::error::DhtError;
use std::fmt;
use std::net::SocketAddrV4;
use tracing::debug;

/// Version advertised in the `v` key of every outgoing message
pub const CLIENT_VERSION: [u8; 4] = *b"DT\x00\x01";

/// Generic error, also used for unknown methods
pub const GENERIC_ERROR: i64 = 201;
/// Server error
pub const SERVER_ERROR: i64 = 202;
/// Protocol error (malformed packet, bad token)
pub const PROTOCOL_ERROR: i64 = 203;

pub const METHOD_UNKNOWN_MSG: &str = "Method Unknown";
pub const PROTOCOL_ERROR_MSG: &str = "Protocol Error";

const KEY_TID: &[u8] = b"t";
/// Longest transaction id accepted from the wire
pub const MAX_TID_LEN: usize = 8;
const KEY_KIND: &[u8] = b"y";
const KEY_VERSION: &[u8] = b"v";
const KEY_QUERY: &[u8] = b"q";
const KEY_ARGS: &[u8] = b"a";
const KEY_RESPONSE: &[u8] = b"r";
const KEY_ERROR: &[u8] = b"e";
const KEY_PRIVATE: &[u8] = b"d";

/// DHT query types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryType {
    /// Wire name of the query
    pub fn name(&self) -> &'static str {
        match self {
            QueryType::Ping => "ping",
            QueryType::FindNode => "find_node",
            QueryType::GetPeers => "get_peers",
            QueryType::AnnouncePeer => "announce_peer",
        }
    }

    /// Parse a wire name, `None` for unknown methods
    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(QueryType::Ping),
            b"find_node" => Some(QueryType::FindNode),
            b"get_peers" => Some(QueryType::GetPeers),
            b"announce_peer" => Some(QueryType::AnnouncePeer),
            _ => None,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A query with its arguments (the sender id is carried separately)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: NodeId,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
    /// A method this node does not implement
    Unknown {
        name: Vec<u8>,
    },
}

impl Query {
    /// The query type, `None` for unknown methods
    pub fn query_type(&self) -> Option<QueryType> {
        match self {
            Query::Ping => Some(QueryType::Ping),
            Query::FindNode { .. } => Some(QueryType::FindNode),
            Query::GetPeers { .. } => Some(QueryType::GetPeers),
            Query::AnnouncePeer { .. } => Some(QueryType::AnnouncePeer),
            Query::Unknown { .. } => None,
        }
    }
}

/// A response interpreted against the query that caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping,
    FindNode {
        nodes: Vec<Node>,
    },
    GetPeers {
        token: Option<Vec<u8>>,
        peers: Vec<SocketAddrV4>,
        nodes: Vec<Node>,
    },
    AnnouncePeer,
}

impl Response {
    /// Nodes observed inside the response
    pub fn nodes(&self) -> &[Node] {
        match self {
            Response::FindNode { nodes } | Response::GetPeers { nodes, .. } => nodes,
            _ => &[],
        }
    }
}

/// Body of a sanitized incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query {
        sender_id: NodeId,
        query: Query,
    },
    /// Response fields stay raw until matched with a pending query
    Response {
        sender_id: NodeId,
        fields: BencodeDict,
    },
    Error {
        code: i64,
        message: Vec<u8>,
    },
}

/// A sanitized incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Transaction id (non-empty; the first byte is significant for matching)
    pub tid: Vec<u8>,
    /// Client version, preserved verbatim
    pub version: Option<Vec<u8>>,
    pub body: Body,
}

impl IncomingMessage {
    /// Decode and sanitize a datagram.
    ///
    /// With a private label set, messages not carrying the same label
    /// under `d` are rejected.
    pub fn decode(data: &[u8], private_label: Option<&[u8]>) -> Result<Self, DhtError> {
        let value = bencode::decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::message_error("message is not a dictionary"))?;

        let tid = dict
            .get(KEY_TID)
            .and_then(Value::as_bytes)
            .filter(|t| (1..=MAX_TID_LEN).contains(&t.len()))
            .ok_or_else(|| DhtError::message_error_with_field("missing or bad transaction id", "t"))?
            .to_vec();

        let kind = dict
            .get(KEY_KIND)
            .and_then(Value::as_bytes)
            .ok_or_else(|| DhtError::message_error_with_field("missing message kind", "y"))?;

        if let Some(label) = private_label {
            let carried = dict.get(KEY_PRIVATE).and_then(Value::as_bytes);
            if carried != Some(label) {
                return Err(DhtError::message_error_with_field("private label mismatch", "d"));
            }
        }

        let body = match kind {
            b"q" => parse_query(dict)?,
            b"r" => {
                let fields = dict
                    .get(KEY_RESPONSE)
                    .and_then(Value::as_dict)
                    .ok_or_else(|| DhtError::message_error_with_field("response body is not a dictionary", "r"))?;
                Body::Response {
                    sender_id: required_id(fields, "id")?,
                    fields: fields.clone(),
                }
            }
            b"e" => parse_error(dict)?,
            other => {
                return Err(DhtError::message_error_with_field(
                    format!("unknown message kind {:?}", String::from_utf8_lossy(other)),
                    "y",
                ))
            }
        };

        let version = match dict.get(KEY_VERSION) {
            Some(v) => Some(
                v.as_bytes()
                    .ok_or_else(|| DhtError::message_error_with_field("version is not a byte string", "v"))?
                    .to_vec(),
            ),
            None => None,
        };

        Ok(Self { tid, version, body })
    }

    /// The sending node, known for queries and responses only
    pub fn sender(&self, addr: SocketAddrV4) -> Option<Node> {
        let id = match &self.body {
            Body::Query { sender_id, .. } | Body::Response { sender_id, .. } => *sender_id,
            Body::Error { .. } => return None,
        };
        Some(Node::new(id, addr).with_version(self.version.as_deref()))
    }
}

fn required_id(dict: &BencodeDict, key: &str) -> Result<NodeId, DhtError> {
    let bytes = dict
        .get(key.as_bytes())
        .and_then(Value::as_bytes)
        .ok_or_else(|| DhtError::message_error_with_field("missing id", key))?;
    NodeId::from_bytes(bytes).map_err(|e| DhtError::message_error_with_field(e.to_string(), key))
}

fn parse_query(dict: &BencodeDict) -> Result<Body, DhtError> {
    let name = dict
        .get(KEY_QUERY)
        .and_then(Value::as_bytes)
        .ok_or_else(|| DhtError::message_error_with_field("missing query name", "q"))?;
    let args = dict
        .get(KEY_ARGS)
        .and_then(Value::as_dict)
        .ok_or_else(|| DhtError::message_error_with_field("query arguments are not a dictionary", "a"))?;
    let sender_id = required_id(args, "id")?;

    let query = match QueryType::from_name(name) {
        Some(QueryType::Ping) => Query::Ping,
        Some(QueryType::FindNode) => Query::FindNode {
            target: required_id(args, "target")?,
        },
        Some(QueryType::GetPeers) => Query::GetPeers {
            info_hash: required_id(args, "info_hash")?,
        },
        Some(QueryType::AnnouncePeer) => {
            let info_hash = required_id(args, "info_hash")?;
            let port = args
                .get(b"port".as_slice())
                .and_then(Value::as_integer)
                .filter(|p| (1..=65535).contains(p))
                .ok_or_else(|| DhtError::message_error_with_field("port missing or out of range", "port"))?;
            let token = args
                .get(b"token".as_slice())
                .and_then(Value::as_bytes)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| DhtError::message_error_with_field("missing or empty token", "token"))?
                .to_vec();
            let implied_port = args
                .get(b"implied_port".as_slice())
                .and_then(Value::as_integer)
                .map_or(false, |v| v == 1);
            Query::AnnouncePeer {
                info_hash,
                port: port as u16,
                token,
                implied_port,
            }
        }
        None => Query::Unknown { name: name.to_vec() },
    };

    Ok(Body::Query { sender_id, query })
}

fn parse_error(dict: &BencodeDict) -> Result<Body, DhtError> {
    let items = dict
        .get(KEY_ERROR)
        .and_then(Value::as_list)
        .filter(|items| items.len() == 2)
        .ok_or_else(|| DhtError::message_error_with_field("error body is not a two-element list", "e"))?;
    let code = items[0]
        .as_integer()
        .ok_or_else(|| DhtError::message_error_with_field("error code is not an integer", "e"))?;
    let message = items[1]
        .as_bytes()
        .ok_or_else(|| DhtError::message_error_with_field("error message is not a byte string", "e"))?
        .to_vec();
    if !matches!(code, GENERIC_ERROR | SERVER_ERROR | PROTOCOL_ERROR) {
        debug!("Unknown error code {} ({})", code, String::from_utf8_lossy(&message));
    }
    Ok(Body::Error { code, message })
}

/// Interpret raw response fields against the kind of the originating query
pub fn interpret_response(kind: QueryType, fields: &BencodeDict) -> Result<Response, DhtError> {
    match kind {
        QueryType::Ping => Ok(Response::Ping),
        QueryType::AnnouncePeer => Ok(Response::AnnouncePeer),
        QueryType::FindNode => {
            let nodes = response_nodes(fields)?
                .ok_or_else(|| DhtError::message_error_with_field("find_node response without nodes", "nodes"))?;
            Ok(Response::FindNode { nodes })
        }
        QueryType::GetPeers => {
            let token = match fields.get(b"token".as_slice()) {
                Some(v) => Some(
                    v.as_bytes()
                        .ok_or_else(|| DhtError::message_error_with_field("token is not a byte string", "token"))?
                        .to_vec(),
                ),
                None => None,
            };
            let peers = match fields.get(b"values".as_slice()) {
                Some(v) => {
                    let list = v
                        .as_list()
                        .ok_or_else(|| DhtError::message_error_with_field("values is not a list", "values"))?;
                    let mut entries = Vec::with_capacity(list.len());
                    for item in list {
                        entries.push(
                            item.as_bytes()
                                .ok_or_else(|| DhtError::message_error_with_field("peer is not a byte string", "values"))?,
                        );
                    }
                    Some(unpack_peers(entries))
                }
                None => None,
            };
            let nodes = response_nodes(fields)?;
            if peers.is_none() && nodes.is_none() {
                return Err(DhtError::message_error("get_peers response without values or nodes"));
            }
            Ok(Response::GetPeers {
                token,
                peers: peers.unwrap_or_default(),
                nodes: nodes.unwrap_or_default(),
            })
        }
    }
}

/// Nodes from `nodes` and/or `nodes2`; `None` when neither key is present
fn response_nodes(fields: &BencodeDict) -> Result<Option<Vec<Node>>, DhtError> {
    let mut found = None;
    if let Some(v) = fields.get(b"nodes".as_slice()) {
        let data = v
            .as_bytes()
            .ok_or_else(|| DhtError::message_error_with_field("nodes is not a byte string", "nodes"))?;
        found = Some(unpack_nodes(data)?);
    }
    if let Some(v) = fields.get(b"nodes2".as_slice()) {
        let data = v
            .as_bytes()
            .ok_or_else(|| DhtError::message_error_with_field("nodes2 is not a byte string", "nodes2"))?;
        let extra = unpack_nodes2(data).map_err(|e| e.with_context("nodes2"))?;
        let nodes: &mut Vec<Node> = found.get_or_insert_with(Vec::new);
        for node in extra {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
    }
    Ok(found)
}

/// What a get_peers reply carries besides `id` and `token`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetPeersReply {
    Values(Vec<SocketAddrV4>),
    Nodes(Vec<Node>),
}

/// A pre-bencoded message with one slot for the transaction id.
///
/// `t` sorts after every key preceding it in a KRPC message and before
/// `v`/`y`, so the canonical encoding is `prefix || tid || suffix`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    query_type: Option<QueryType>,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl OutgoingMessage {
    /// Build the template from a canonical dictionary lacking `t`
    fn from_dict(query_type: Option<QueryType>, dict: &BencodeDict) -> Self {
        let mut prefix = vec![b'd'];
        let before_tid = dict.iter().filter(|(key, _)| key.as_slice() < KEY_TID);
        bencode::encode_dict_entries_into(before_tid, &mut prefix);
        bencode::encode_bytes_into(KEY_TID, &mut prefix);

        let mut suffix = Vec::new();
        let after_tid = dict.iter().filter(|(key, _)| key.as_slice() > KEY_TID);
        bencode::encode_dict_entries_into(after_tid, &mut suffix);
        suffix.push(b'e');

        Self {
            query_type,
            prefix,
            suffix,
        }
    }

    /// Query type for queries, `None` for responses and errors
    pub fn query_type(&self) -> Option<QueryType> {
        self.query_type
    }

    /// Splice the transaction id into the template
    pub fn encode(&self, tid: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(self.prefix.len() + tid.len() + 4 + self.suffix.len());
        datagram.extend_from_slice(&self.prefix);
        bencode::encode_bytes_into(tid, &mut datagram);
        datagram.extend_from_slice(&self.suffix);
        datagram
    }
}

/// Builds outgoing messages on behalf of the local node
#[derive(Debug, Clone)]
pub struct MessageFactory {
    local_id: NodeId,
    private_label: Option<Vec<u8>>,
    ping_query: OutgoingMessage,
    ping_response: OutgoingMessage,
}

impl MessageFactory {
    /// Create a new factory for the local id
    pub fn new(local_id: NodeId, private_label: Option<Vec<u8>>) -> Self {
        let mut factory = Self {
            local_id,
            private_label,
            ping_query: OutgoingMessage::default(),
            ping_response: OutgoingMessage::default(),
        };
        factory.ping_query = factory.build_query(&Query::Ping);
        factory.ping_response = factory.response(BencodeDict::new());
        factory
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn envelope(&self, kind: &str) -> BencodeDict {
        let mut dict = BencodeDict::new();
        dict.insert(KEY_KIND.to_vec(), Value::from(kind));
        dict.insert(KEY_VERSION.to_vec(), Value::bytes(CLIENT_VERSION));
        if let Some(label) = &self.private_label {
            dict.insert(KEY_PRIVATE.to_vec(), Value::bytes(label));
        }
        dict
    }

    /// Build any query
    pub fn query(&self, query: &Query) -> OutgoingMessage {
        match query {
            Query::Ping => self.ping_query.clone(),
            _ => self.build_query(query),
        }
    }

    fn build_query(&self, query: &Query) -> OutgoingMessage {
        let mut args = BencodeDict::new();
        args.insert(b"id".to_vec(), Value::bytes(self.local_id.as_bytes()));
        let name: Vec<u8> = match query {
            Query::Ping => b"ping".to_vec(),
            Query::FindNode { target } => {
                args.insert(b"target".to_vec(), Value::bytes(target.as_bytes()));
                b"find_node".to_vec()
            }
            Query::GetPeers { info_hash } => {
                args.insert(b"info_hash".to_vec(), Value::bytes(info_hash.as_bytes()));
                b"get_peers".to_vec()
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                args.insert(b"info_hash".to_vec(), Value::bytes(info_hash.as_bytes()));
                args.insert(b"port".to_vec(), Value::Integer(i64::from(*port)));
                args.insert(b"token".to_vec(), Value::bytes(token));
                if *implied_port {
                    args.insert(b"implied_port".to_vec(), Value::Integer(1));
                }
                b"announce_peer".to_vec()
            }
            Query::Unknown { name } => name.clone(),
        };

        let mut dict = self.envelope("q");
        dict.insert(KEY_ARGS.to_vec(), Value::Dict(args));
        dict.insert(KEY_QUERY.to_vec(), Value::Bytes(name));
        OutgoingMessage::from_dict(query.query_type(), &dict)
    }

    pub fn ping_query(&self) -> OutgoingMessage {
        self.ping_query.clone()
    }

    pub fn find_node_query(&self, target: NodeId) -> OutgoingMessage {
        self.build_query(&Query::FindNode { target })
    }

    pub fn get_peers_query(&self, info_hash: NodeId) -> OutgoingMessage {
        self.build_query(&Query::GetPeers { info_hash })
    }

    pub fn announce_peer_query(&self, info_hash: NodeId, port: u16, token: Vec<u8>) -> OutgoingMessage {
        self.build_query(&Query::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port: false,
        })
    }

    fn response(&self, mut fields: BencodeDict) -> OutgoingMessage {
        fields.insert(b"id".to_vec(), Value::bytes(self.local_id.as_bytes()));
        let mut dict = self.envelope("r");
        dict.insert(KEY_RESPONSE.to_vec(), Value::Dict(fields));
        OutgoingMessage::from_dict(None, &dict)
    }

    pub fn ping_response(&self) -> OutgoingMessage {
        self.ping_response.clone()
    }

    pub fn find_node_response(&self, nodes: &[Node]) -> OutgoingMessage {
        let mut fields = BencodeDict::new();
        fields.insert(b"nodes".to_vec(), Value::Bytes(pack_nodes(nodes)));
        self.response(fields)
    }

    pub fn get_peers_response(&self, token: &[u8], reply: &GetPeersReply) -> OutgoingMessage {
        let mut fields = BencodeDict::new();
        fields.insert(b"token".to_vec(), Value::bytes(token));
        match reply {
            GetPeersReply::Values(peers) => {
                let values = pack_peers(peers).into_iter().map(Value::Bytes).collect();
                fields.insert(b"values".to_vec(), Value::List(values));
            }
            GetPeersReply::Nodes(nodes) => {
                fields.insert(b"nodes".to_vec(), Value::Bytes(pack_nodes(nodes)));
            }
        }
        self.response(fields)
    }

    pub fn announce_peer_response(&self) -> OutgoingMessage {
        self.ping_response.clone()
    }

    pub fn error(&self, code: i64, message: &str) -> OutgoingMessage {
        let mut dict = self.envelope("e");
        dict.insert(
            KEY_ERROR.to_vec(),
            Value::List(vec![Value::Integer(code), Value::from(message)]),
        );
        OutgoingMessage::from_dict(None, &dict)
    }
}
