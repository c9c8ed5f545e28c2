//! Client backend for the Keel store
//!
//! Speaks the QUIC protocol served by [`StoreHost`](crate::store_host::StoreHost).
//! Transport failures come back as connection resets so the retry engine
//! reconnects; errors reported by the host carry its result code unchanged.

use async_trait::async_trait;
use bytes::Bytes;
use quinn::Endpoint;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

use keel_core::crypto::{login_proof, NONCE_LEN};
use keel_core::{
    CloseRequest, Config, ContinuationToken, CreateRequest, DriverConfig, HelloMessage, HostKey,
    LoginRequest, NetMessage, NetworkConfig, ObjectStat, OpenFlags, OpenRequest, PathRequest,
    ProtocolError, QueryPage, QueryRequest, ReadRequest, RemoteCode, RemoteFd, RenameRequest,
    SeekRequest, SessionEnv, TruncateRequest, WriteRequest, MAX_TRANSFER_SIZE, PROTOCOL_VERSION,
};

use crate::backend::{ReadReply, RemoteBackend, RemoteResult, Session};
use crate::net::{self, NetError, QuicConnection};

/// Result code for a transport-level failure
fn net_code(e: &NetError) -> RemoteCode {
    match e {
        NetError::Protocol(err) => RemoteCode::from(err),
        _ => RemoteCode::from_errno(libc::ECONNRESET),
    }
}

fn unexpected(reply: &NetMessage) -> RemoteCode {
    RemoteCode::from(&ProtocolError::UnexpectedMessage(reply.name().into()))
}

/// Backend for Keel store hosts
pub struct StoreBackend {
    driver: DriverConfig,
    network: NetworkConfig,
    client_id: [u8; 16],
}

impl StoreBackend {
    pub fn new(config: &Config) -> Self {
        Self::from_parts(config.driver.clone(), config.network.clone())
    }

    pub fn from_parts(driver: DriverConfig, network: NetworkConfig) -> Self {
        let mut client_id = [0u8; 16];
        client_id.copy_from_slice(&keel_core::crypto::generate_nonce()[..16]);
        Self {
            driver,
            network,
            client_id,
        }
    }
}

#[async_trait]
impl RemoteBackend for StoreBackend {
    fn name(&self) -> &str {
        "store"
    }

    async fn load_environment(&self) -> RemoteResult<SessionEnv> {
        let Some(path) = self.driver.credential_path() else {
            return Err(RemoteCode::from_errno(libc::ENOENT));
        };
        let mut secret = tokio::fs::read(&path).await.map_err(|e| {
            warn!("couldn't read credentials from {:?}: {}", path, e);
            RemoteCode::from_errno(e.raw_os_error().unwrap_or(libc::EIO))
        })?;
        // A trailing newline is not part of the secret
        let end = secret
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        secret.truncate(end);

        let Some(user_name) = self.driver.user_name() else {
            warn!("no user name; set driver.user or $USER");
            return Err(RemoteCode::from_errno(libc::EINVAL));
        };

        Ok(SessionEnv {
            user_name,
            zone: self.driver.zone.clone(),
            default_resource: self.driver.default_resource.clone(),
            secret,
        })
    }

    async fn connect(&self, host: &HostKey, _env: &SessionEnv) -> RemoteResult<Box<dyn Session>> {
        let addr = lookup_host(host.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                warn!("couldn't resolve {}", host);
                RemoteCode::from_errno(libc::EHOSTUNREACH)
            })?;

        let endpoint = net::create_client_endpoint(addr, &self.network).map_err(|e| net_code(&e))?;
        let conn = net::connect(&endpoint, addr, &self.network)
            .await
            .map_err(|e| net_code(&e))?;

        let hello = NetMessage::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            client_id: self.client_id,
        });
        let ack = match conn.request(&hello).await.map_err(|e| net_code(&e))? {
            NetMessage::HelloAck(ack) => ack,
            NetMessage::Error(err) => return Err(RemoteCode(err.code)),
            other => return Err(unexpected(&other)),
        };
        if ack.protocol_version != PROTOCOL_VERSION {
            return Err(RemoteCode::from(&ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: ack.protocol_version,
            }));
        }

        info!("connected to store {} at {}", ack.host_name, addr);
        Ok(Box::new(StoreSession {
            host: host.clone(),
            conn,
            endpoint,
            nonce: ack.nonce,
        }))
    }
}

/// One session with a store host
pub struct StoreSession {
    host: HostKey,
    conn: QuicConnection,
    endpoint: Endpoint,
    nonce: [u8; NONCE_LEN],
}

impl StoreSession {
    /// Send one request; a host error becomes its result code
    async fn call(&mut self, request: NetMessage) -> RemoteResult<NetMessage> {
        let name = request.name();
        match self.conn.request(&request).await {
            Ok(NetMessage::Error(err)) => {
                debug!("{} on {}: {} ({})", name, self.host, err.message, err.code);
                Err(RemoteCode(err.code))
            }
            Ok(reply) => Ok(reply),
            Err(e) => {
                debug!("{} on {}: {}", name, self.host, e);
                Err(net_code(&e))
            }
        }
    }

    async fn call_ok(&mut self, request: NetMessage) -> RemoteResult<()> {
        match self.call(request).await? {
            NetMessage::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn query(&mut self, request: NetMessage) -> RemoteResult<QueryPage> {
        match self.call(request).await? {
            NetMessage::QueryResponse(page) => Ok(page),
            other => Err(unexpected(&other)),
        }
    }

    async fn open_reply(&mut self, request: NetMessage) -> RemoteResult<RemoteFd> {
        match self.call(request).await? {
            NetMessage::OpenResponse(resp) => Ok(resp.fd),
            other => Err(unexpected(&other)),
        }
    }
}

fn path_request(path: &str) -> PathRequest {
    PathRequest { path: path.to_string() }
}

fn query_request(collection: &str, continuation: Option<ContinuationToken>) -> QueryRequest {
    QueryRequest {
        collection: collection.to_string(),
        continuation: continuation.map(|c| c.0),
    }
}

#[async_trait]
impl Session for StoreSession {
    async fn login(&mut self, env: &SessionEnv) -> RemoteResult<()> {
        let proof = login_proof(&env.secret, &env.user_name, &self.nonce);
        self.call_ok(NetMessage::Login(LoginRequest {
            user: env.user_name.clone(),
            zone: env.zone.clone(),
            proof,
        }))
        .await
    }

    async fn stat(&mut self, path: &str) -> RemoteResult<ObjectStat> {
        match self.call(NetMessage::Stat(path_request(path))).await? {
            NetMessage::StatResponse(stat) => Ok(stat),
            other => Err(unexpected(&other)),
        }
    }

    async fn query_data_objects(
        &mut self,
        collection: &str,
        continuation: Option<ContinuationToken>,
    ) -> RemoteResult<QueryPage> {
        self.query(NetMessage::QueryDataObjects(query_request(collection, continuation)))
            .await
    }

    async fn query_collections(
        &mut self,
        collection: &str,
        continuation: Option<ContinuationToken>,
    ) -> RemoteResult<QueryPage> {
        self.query(NetMessage::QueryCollections(query_request(collection, continuation)))
            .await
    }

    async fn create_collection(&mut self, path: &str) -> RemoteResult<()> {
        self.call_ok(NetMessage::CreateCollection(path_request(path))).await
    }

    async fn remove_collection(&mut self, path: &str) -> RemoteResult<()> {
        self.call_ok(NetMessage::RemoveCollection(path_request(path))).await
    }

    async fn unlink(&mut self, path: &str) -> RemoteResult<()> {
        self.call_ok(NetMessage::Unlink(path_request(path))).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        self.call_ok(NetMessage::Rename(RenameRequest {
            from: from.to_string(),
            to: to.to_string(),
        }))
        .await
    }

    async fn truncate(&mut self, path: &str, size: u64) -> RemoteResult<()> {
        self.call_ok(NetMessage::Truncate(TruncateRequest {
            path: path.to_string(),
            size,
        }))
        .await
    }

    async fn checksum(&mut self, path: &str) -> RemoteResult<String> {
        match self.call(NetMessage::Checksum(path_request(path))).await? {
            NetMessage::ChecksumResponse(resp) => Ok(resp.checksum),
            other => Err(unexpected(&other)),
        }
    }

    async fn open(&mut self, path: &str, flags: OpenFlags) -> RemoteResult<RemoteFd> {
        self.open_reply(NetMessage::Open(OpenRequest {
            path: path.to_string(),
            flags,
        }))
        .await
    }

    async fn create(
        &mut self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        resource: Option<&str>,
    ) -> RemoteResult<RemoteFd> {
        self.open_reply(NetMessage::Create(CreateRequest {
            path: path.to_string(),
            flags,
            mode,
            resource: resource.map(str::to_string),
        }))
        .await
    }

    async fn seek(&mut self, fd: RemoteFd, offset: u64) -> RemoteResult<u64> {
        match self.call(NetMessage::Seek(SeekRequest { fd, offset })).await? {
            NetMessage::SeekResponse(resp) => Ok(resp.offset),
            other => Err(unexpected(&other)),
        }
    }

    async fn read(&mut self, fd: RemoteFd, buf: &mut [u8]) -> RemoteResult<ReadReply> {
        let len = buf.len().min(MAX_TRANSFER_SIZE) as u32;
        match self.call(NetMessage::Read(ReadRequest { fd, len })).await? {
            NetMessage::ReadResponse(resp) => Ok(ReadReply::Owned(Bytes::from(resp.data))),
            other => Err(unexpected(&other)),
        }
    }

    async fn write(&mut self, fd: RemoteFd, data: &[u8]) -> RemoteResult<usize> {
        let data = &data[..data.len().min(MAX_TRANSFER_SIZE)];
        let request = NetMessage::Write(WriteRequest {
            fd,
            data: data.to_vec(),
        });
        match self.call(request).await? {
            NetMessage::WriteResponse(resp) => Ok(resp.written as usize),
            other => Err(unexpected(&other)),
        }
    }

    async fn close(&mut self, fd: RemoteFd) -> RemoteResult<()> {
        self.call_ok(NetMessage::Close(CloseRequest { fd })).await
    }

    async fn disconnect(&mut self) {
        if !self.conn.is_closed() {
            self.conn.close(0, "disconnect");
        }
        self.endpoint.close(0u32.into(), b"disconnect");
        debug!("disconnected from {}", self.host);
    }
}
