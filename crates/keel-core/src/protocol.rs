//! Wire protocol definitions
//!
//! Messages of the reference store. Each request travels on its own QUIC
//! stream and is answered by exactly one reply. Messages are serialized with
//! bincode and prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::types::{ObjectStat, OpenFlags, QueryPage, RemoteFd};

/// All possible network messages
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NetMessage {
    // Handshake
    Hello(HelloMessage),
    HelloAck(HelloAckMessage),
    Login(LoginRequest),

    // Catalog
    Stat(PathRequest),
    StatResponse(ObjectStat),
    QueryDataObjects(QueryRequest),
    QueryCollections(QueryRequest),
    QueryResponse(QueryPage),
    CreateCollection(PathRequest),
    RemoveCollection(PathRequest),
    Unlink(PathRequest),
    Rename(RenameRequest),
    Truncate(TruncateRequest),
    Checksum(PathRequest),
    ChecksumResponse(ChecksumResponse),

    // Descriptors
    Open(OpenRequest),
    Create(CreateRequest),
    OpenResponse(OpenResponse),
    Seek(SeekRequest),
    SeekResponse(SeekResponse),
    Read(ReadRequest),
    ReadResponse(ReadResponse),
    Write(WriteRequest),
    WriteResponse(WriteResponse),
    Close(CloseRequest),

    // Control
    Ok,
    Error(ErrorMessage),
    Goodbye,
}

impl NetMessage {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            NetMessage::Hello(_) => "Hello",
            NetMessage::HelloAck(_) => "HelloAck",
            NetMessage::Login(_) => "Login",
            NetMessage::Stat(_) => "Stat",
            NetMessage::StatResponse(_) => "StatResponse",
            NetMessage::QueryDataObjects(_) => "QueryDataObjects",
            NetMessage::QueryCollections(_) => "QueryCollections",
            NetMessage::QueryResponse(_) => "QueryResponse",
            NetMessage::CreateCollection(_) => "CreateCollection",
            NetMessage::RemoveCollection(_) => "RemoveCollection",
            NetMessage::Unlink(_) => "Unlink",
            NetMessage::Rename(_) => "Rename",
            NetMessage::Truncate(_) => "Truncate",
            NetMessage::Checksum(_) => "Checksum",
            NetMessage::ChecksumResponse(_) => "ChecksumResponse",
            NetMessage::Open(_) => "Open",
            NetMessage::Create(_) => "Create",
            NetMessage::OpenResponse(_) => "OpenResponse",
            NetMessage::Seek(_) => "Seek",
            NetMessage::SeekResponse(_) => "SeekResponse",
            NetMessage::Read(_) => "Read",
            NetMessage::ReadResponse(_) => "ReadResponse",
            NetMessage::Write(_) => "Write",
            NetMessage::WriteResponse(_) => "WriteResponse",
            NetMessage::Close(_) => "Close",
            NetMessage::Ok => "Ok",
            NetMessage::Error(_) => "Error",
            NetMessage::Goodbye => "Goodbye",
        }
    }
}

// === Handshake Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub client_id: [u8; 16],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloAckMessage {
    pub protocol_version: u32,
    /// Fresh per connection; bound into the login proof
    pub nonce: [u8; 32],
    pub host_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user: String,
    pub zone: String,
    pub proof: [u8; 32],
}

// === Catalog Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Collection whose children are listed
    pub collection: String,
    /// Continuation from the previous page, `None` for the first
    pub continuation: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenameRequest {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TruncateRequest {
    pub path: String,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChecksumResponse {
    /// Hex digest
    pub checksum: String,
}

// === Descriptor Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenRequest {
    pub path: String,
    pub flags: OpenFlags,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateRequest {
    pub path: String,
    pub flags: OpenFlags,
    pub mode: u32,
    pub resource: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenResponse {
    pub fd: RemoteFd,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeekRequest {
    pub fd: RemoteFd,
    pub offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeekResponse {
    pub offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    pub fd: RemoteFd,
    pub len: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub fd: RemoteFd,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub written: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseRequest {
    pub fd: RemoteFd,
}

// === Control Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Backend result code (see `RemoteCode`)
    pub code: i32,
    pub message: String,
}

/// Serialize a message with length prefix
pub fn serialize_message(msg: &NetMessage) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(msg)?;
    let len = payload.len() as u32;

    let mut result = Vec::with_capacity(4 + payload.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&payload);

    Ok(result)
}

/// Deserialize a message (without length prefix)
pub fn deserialize_message(data: &[u8]) -> Result<NetMessage, bincode::Error> {
    bincode::deserialize(data)
}
