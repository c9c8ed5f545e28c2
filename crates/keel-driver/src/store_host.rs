//! Keel store host: serves a local directory as a collection store
//!
//! Directories are collections, regular files are data objects. Each QUIC
//! connection is one session with its own descriptor table; descriptors die
//! with the connection. The host answers the same quirks the driver expects
//! from a real catalog (directories open as "no rows", unlink on a directory
//! and collection removal of a file are no-ops, rename never replaces).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quinn::Endpoint;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use keel_core::crypto::{generate_nonce, verify_login_proof, ObjectHasher, NONCE_LEN};
use keel_core::path::safe_path;
use keel_core::{
    ChecksumResponse, Config, ContinuationToken, CreateRequest, ErrorMessage, HelloAckMessage,
    LoginRequest, NetMessage, NetworkConfig, ObjectKind, ObjectStat, OpenFlags, OpenRequest,
    OpenResponse, ProtocolError, QueryPage, QueryRequest, ReadResponse, RemoteCode,
    RemoteFd, SeekResponse, WriteResponse, MAX_TRANSFER_SIZE, PROTOCOL_VERSION,
};

use crate::net::{create_server_endpoint, recv_message, send_message, CertFingerprint, NetError, QuicConnection};

/// Names per listing page
pub const PAGE_SIZE: usize = 512;

/// Host configuration
#[derive(Clone, Debug)]
pub struct StoreHostConfig {
    pub bind_addr: SocketAddr,
    pub root: PathBuf,
    pub max_connections: usize,
    pub host_name: String,
    /// Shared login secret
    pub secret: Vec<u8>,
    pub network: NetworkConfig,
}

impl StoreHostConfig {
    /// Host settings from the `[store]` and `[network]` sections
    pub fn from_config(config: &Config, root: PathBuf, secret: Vec<u8>) -> Self {
        Self {
            bind_addr: SocketAddr::new(config.store.bind, config.store.port),
            root,
            max_connections: config.store.max_connections.max(1),
            host_name: default_host_name(),
            secret,
            network: config.network.clone(),
        }
    }
}

fn default_host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "keel-store".into())
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("bind failed: {0}")]
    Bind(#[from] NetError),

    #[error("store root {0:?} is not a directory")]
    Root(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A bound store host
pub struct StoreHost {
    config: Arc<StoreHostConfig>,
    endpoint: Endpoint,
    fingerprint: CertFingerprint,
    connection_semaphore: Arc<Semaphore>,
}

impl StoreHost {
    /// Bind the endpoint; call [`serve`](Self::serve) to start answering
    pub fn bind(config: StoreHostConfig) -> Result<Self, HostError> {
        if !config.root.is_dir() {
            return Err(HostError::Root(config.root));
        }
        let root = config.root.canonicalize()?;
        let config = StoreHostConfig { root, ..config };

        let (endpoint, fingerprint) = create_server_endpoint(config.bind_addr, &config.network)?;

        Ok(Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            endpoint,
            fingerprint,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HostError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Fingerprint clients pin through `network.cert_fingerprint`
    pub fn fingerprint(&self) -> CertFingerprint {
        self.fingerprint
    }

    /// Serve connections until the endpoint is closed
    pub async fn serve(&self) -> Result<(), HostError> {
        info!(
            "keel store {} serving {:?} on {}",
            self.config.host_name,
            self.config.root,
            self.local_addr()?
        );

        while let Some(incoming) = self.endpoint.accept().await {
            let permit = match self.connection_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("connection limit semaphore closed");
                    break;
                }
            };
            let config = self.config.clone();

            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        let conn = QuicConnection::new(connection);
                        let remote = conn.remote_address();
                        info!("session from {}", remote);

                        if let Err(e) = handle_connection(conn, config).await {
                            error!("session error from {}: {}", remote, e);
                        }
                    }
                    Err(e) => {
                        warn!("connection failed: {}", e);
                    }
                }
                drop(permit);
            });
        }

        Ok(())
    }

    /// Stop accepting and close every session
    pub fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

struct OpenObject {
    path: PathBuf,
    file: File,
}

/// State of one client session
struct SessionState {
    config: Arc<StoreHostConfig>,
    nonce: [u8; NONCE_LEN],
    logged_in: AtomicBool,
    descriptors: Mutex<HashMap<i32, OpenObject>>,
    next_fd: AtomicI32,
}

async fn handle_connection(conn: QuicConnection, config: Arc<StoreHostConfig>) -> Result<(), NetError> {
    let (mut send, mut recv) = conn.accept_stream().await?;

    let client_id = match recv_message(&mut recv).await? {
        NetMessage::Hello(hello) => {
            if hello.protocol_version != PROTOCOL_VERSION {
                let err = ProtocolError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: hello.protocol_version,
                };
                send_message(&mut send, &error_reply(RemoteCode::from(&err), err.to_string())).await?;
                let _ = send.finish();
                return Err(err.into());
            }
            hello.client_id
        }
        other => {
            return Err(ProtocolError::UnexpectedMessage(other.name().into()).into());
        }
    };

    let nonce = generate_nonce();
    let ack = NetMessage::HelloAck(HelloAckMessage {
        protocol_version: PROTOCOL_VERSION,
        nonce,
        host_name: config.host_name.clone(),
    });
    send_message(&mut send, &ack).await?;
    let _ = send.finish();
    debug!("hello from client {}", hex::encode(&client_id[..4]));

    let state = Arc::new(SessionState {
        config,
        nonce,
        logged_in: AtomicBool::new(false),
        descriptors: Mutex::new(HashMap::new()),
        next_fd: AtomicI32::new(3),
    });

    loop {
        match conn.accept_stream().await {
            Ok((mut send, mut recv)) => {
                let state = state.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    let request = match recv_message(&mut recv).await {
                        Ok(request) => request,
                        Err(e) => {
                            debug!("bad request: {}", e);
                            return;
                        }
                    };
                    let goodbye = matches!(request, NetMessage::Goodbye);
                    let reply = dispatch(&state, request);
                    if let Err(e) = send_message(&mut send, &reply).await {
                        debug!("reply failed: {}", e);
                    }
                    let _ = send.finish();
                    if goodbye {
                        conn.close(0, "goodbye");
                    }
                });
            }
            Err(e) => {
                debug!("session ended: {}", e);
                break;
            }
        }
    }

    Ok(())
}

fn error_reply(code: RemoteCode, message: String) -> NetMessage {
    NetMessage::Error(ErrorMessage { code: code.0, message })
}

fn io_code(e: &io::Error) -> RemoteCode {
    RemoteCode::from_errno(e.raw_os_error().unwrap_or(libc::EIO))
}

fn dispatch(state: &SessionState, request: NetMessage) -> NetMessage {
    let name = request.name();
    let result = if let NetMessage::Login(login) = request {
        handle_login(state, login)
    } else if !state.logged_in.load(Ordering::SeqCst) {
        Err(RemoteCode::AUTH_FAILED)
    } else {
        handle_request(state, request)
    };

    match result {
        Ok(reply) => reply,
        Err(code) => {
            debug!("{} failed: {}", name, code);
            error_reply(code, format!("{} failed", name))
        }
    }
}

fn handle_login(state: &SessionState, login: LoginRequest) -> Result<NetMessage, RemoteCode> {
    if !verify_login_proof(&state.config.secret, &login.user, &state.nonce, &login.proof) {
        warn!("login rejected for {}#{}", login.user, login.zone);
        return Err(RemoteCode::AUTH_FAILED);
    }
    state.logged_in.store(true, Ordering::SeqCst);
    info!("{}#{} logged in", login.user, login.zone);
    Ok(NetMessage::Ok)
}

fn handle_request(state: &SessionState, request: NetMessage) -> Result<NetMessage, RemoteCode> {
    let root = &state.config.root;
    match request {
        NetMessage::Stat(req) => stat(&resolve(root, &req.path)?).map(NetMessage::StatResponse),
        NetMessage::QueryDataObjects(req) => query(root, &req, false).map(NetMessage::QueryResponse),
        NetMessage::QueryCollections(req) => query(root, &req, true).map(NetMessage::QueryResponse),
        NetMessage::CreateCollection(req) => {
            fs::create_dir(resolve(root, &req.path)?).map_err(|e| io_code(&e))?;
            Ok(NetMessage::Ok)
        }
        NetMessage::RemoveCollection(req) => {
            let path = resolve(root, &req.path)?;
            if path.is_dir() {
                fs::remove_dir(&path).map_err(|e| io_code(&e))?;
            }
            Ok(NetMessage::Ok)
        }
        NetMessage::Unlink(req) => {
            let path = resolve(root, &req.path)?;
            if !path.is_dir() {
                fs::remove_file(&path).map_err(|e| io_code(&e))?;
            }
            Ok(NetMessage::Ok)
        }
        NetMessage::Rename(req) => {
            let from = resolve(root, &req.from)?;
            let to = resolve(root, &req.to)?;
            if to.symlink_metadata().is_ok() {
                return Err(RemoteCode::from_errno(libc::EEXIST));
            }
            fs::rename(&from, &to).map_err(|e| io_code(&e))?;
            Ok(NetMessage::Ok)
        }
        NetMessage::Truncate(req) => {
            let path = resolve(root, &req.path)?;
            let file = OpenOptions::new().write(true).open(&path).map_err(|e| io_code(&e))?;
            file.set_len(req.size).map_err(|e| io_code(&e))?;
            Ok(NetMessage::Ok)
        }
        NetMessage::Checksum(req) => {
            let checksum = digest_file(&resolve(root, &req.path)?).map_err(|e| io_code(&e))?;
            Ok(NetMessage::ChecksumResponse(ChecksumResponse { checksum }))
        }
        NetMessage::Open(req) => open(state, req),
        NetMessage::Create(req) => create(state, req),
        NetMessage::Seek(req) => with_descriptor(state, req.fd, |object| {
            let offset = object.file.seek(SeekFrom::Start(req.offset))?;
            Ok(NetMessage::SeekResponse(SeekResponse { offset }))
        }),
        NetMessage::Read(req) => with_descriptor(state, req.fd, |object| {
            let len = (req.len as usize).min(MAX_TRANSFER_SIZE);
            let mut data = vec![0u8; len];
            let count = object.file.read(&mut data)?;
            data.truncate(count);
            Ok(NetMessage::ReadResponse(ReadResponse { data }))
        }),
        NetMessage::Write(req) => with_descriptor(state, req.fd, |object| {
            if req.data.len() > MAX_TRANSFER_SIZE {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            let written = object.file.write(&req.data)?;
            Ok(NetMessage::WriteResponse(WriteResponse { written: written as u32 }))
        }),
        NetMessage::Close(req) => {
            let object = state
                .descriptors
                .lock()
                .remove(&req.fd.0)
                .ok_or(RemoteCode::from_errno(libc::EBADF))?;
            debug!("closed {} ({:?})", req.fd, object.path);
            Ok(NetMessage::Ok)
        }
        NetMessage::Goodbye => Ok(NetMessage::Ok),
        other => Err(RemoteCode::from(&ProtocolError::UnexpectedMessage(other.name().into()))),
    }
}

fn resolve(root: &Path, remote: &str) -> Result<PathBuf, RemoteCode> {
    safe_path(root, remote).map_err(|e| RemoteCode::from(&e))
}

fn stat(path: &Path) -> Result<ObjectStat, RemoteCode> {
    let meta = fs::metadata(path).map_err(|e| io_code(&e))?;
    Ok(ObjectStat {
        kind: if meta.is_dir() {
            ObjectKind::Collection
        } else {
            ObjectKind::DataObject
        },
        size: if meta.is_dir() { 0 } else { meta.len() },
        create_time: meta.ctime(),
        modify_time: meta.mtime(),
    })
}

fn query(root: &Path, req: &QueryRequest, collections: bool) -> Result<QueryPage, RemoteCode> {
    let dir = resolve(root, &req.collection)?;
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Err(RemoteCode::NO_ROWS_FOUND),
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_type()
                .map(|t| t.is_dir() == collections)
                .unwrap_or(false)
        })
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    let start = req.continuation.unwrap_or(0) as usize;
    if start >= names.len() {
        return Err(RemoteCode::NO_ROWS_FOUND);
    }
    let end = (start + PAGE_SIZE).min(names.len());
    Ok(QueryPage {
        continuation: (end < names.len()).then_some(ContinuationToken(end as u64)),
        names: names.drain(start..end).collect(),
    })
}

fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = ObjectHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex())
}

fn register(state: &SessionState, path: PathBuf, file: File) -> NetMessage {
    let fd = state.next_fd.fetch_add(1, Ordering::SeqCst);
    debug!("opened {:?} as fd {}", path, fd);
    state.descriptors.lock().insert(fd, OpenObject { path, file });
    NetMessage::OpenResponse(OpenResponse { fd: RemoteFd(fd) })
}

fn open(state: &SessionState, req: OpenRequest) -> Result<NetMessage, RemoteCode> {
    let path = resolve(&state.config.root, &req.path)?;
    if !path.is_file() {
        // Collections are not data objects either
        return Err(RemoteCode::NO_ROWS_FOUND);
    }
    let file = access_options(req.flags)
        .open(&path)
        .map_err(|e| io_code(&e))?;
    Ok(register(state, path, file))
}

fn create(state: &SessionState, req: CreateRequest) -> Result<NetMessage, RemoteCode> {
    let path = resolve(&state.config.root, &req.path)?;
    if let Some(resource) = &req.resource {
        debug!("create {:?} on resource {}", path, resource);
    }
    let file = access_options(req.flags)
        .write(true)
        .create_new(true)
        .mode(req.mode & 0o777)
        .open(&path)
        .map_err(|e| io_code(&e))?;
    Ok(register(state, path, file))
}

fn access_options(flags: OpenFlags) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(flags.readable()).write(flags.writable());
    options
}

fn with_descriptor<F>(state: &SessionState, fd: RemoteFd, op: F) -> Result<NetMessage, RemoteCode>
where
    F: FnOnce(&mut OpenObject) -> io::Result<NetMessage>,
{
    let mut descriptors = state.descriptors.lock();
    let object = descriptors
        .get_mut(&fd.0)
        .ok_or(RemoteCode::from_errno(libc::EBADF))?;
    op(object).map_err(|e| io_code(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::crypto::login_proof;
    use keel_core::{PathRequest, ReadRequest, RenameRequest, SeekRequest, WriteRequest};

    const SECRET: &[u8] = b"store secret";

    fn state(root: &Path) -> SessionState {
        let config = StoreHostConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            root: root.to_path_buf(),
            max_connections: 4,
            host_name: "test-store".into(),
            secret: SECRET.to_vec(),
            network: NetworkConfig::default(),
        };
        SessionState {
            config: Arc::new(config),
            nonce: [9u8; NONCE_LEN],
            logged_in: AtomicBool::new(false),
            descriptors: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(3),
        }
    }

    fn logged_in(root: &Path) -> SessionState {
        let state = state(root);
        let proof = login_proof(SECRET, "alice", &state.nonce);
        let reply = dispatch(
            &state,
            NetMessage::Login(LoginRequest { user: "alice".into(), zone: "keel".into(), proof }),
        );
        assert!(matches!(reply, NetMessage::Ok));
        state
    }

    fn error_code(reply: NetMessage) -> i32 {
        match reply {
            NetMessage::Error(err) => err.code,
            other => panic!("expected error, got {}", other.name()),
        }
    }

    fn path(p: &str) -> PathRequest {
        PathRequest { path: p.into() }
    }

    #[test]
    fn test_requests_before_login_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let reply = dispatch(&state, NetMessage::Stat(path("/")));
        assert_eq!(error_code(reply), RemoteCode::AUTH_FAILED.0);
    }

    #[test]
    fn test_bad_proof_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let proof = login_proof(b"wrong", "alice", &state.nonce);
        let reply = dispatch(
            &state,
            NetMessage::Login(LoginRequest { user: "alice".into(), zone: "keel".into(), proof }),
        );
        assert_eq!(error_code(reply), RemoteCode::AUTH_FAILED.0);
        assert!(!state.logged_in.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stat_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let state = logged_in(dir.path());

        match dispatch(&state, NetMessage::Stat(path("/b.txt"))) {
            NetMessage::StatResponse(stat) => {
                assert_eq!(stat.kind, ObjectKind::DataObject);
                assert_eq!(stat.size, 2);
            }
            other => panic!("unexpected {}", other.name()),
        }

        let req = QueryRequest { collection: "/".into(), continuation: None };
        match dispatch(&state, NetMessage::QueryDataObjects(req.clone())) {
            NetMessage::QueryResponse(page) => {
                assert_eq!(page.names, vec!["a.txt", "b.txt"]);
                assert!(page.continuation.is_none());
            }
            other => panic!("unexpected {}", other.name()),
        }
        match dispatch(&state, NetMessage::QueryCollections(req)) {
            NetMessage::QueryResponse(page) => assert_eq!(page.names, vec!["sub"]),
            other => panic!("unexpected {}", other.name()),
        }

        let empty = QueryRequest { collection: "/sub".into(), continuation: None };
        assert_eq!(
            error_code(dispatch(&state, NetMessage::QueryDataObjects(empty))),
            RemoteCode::NO_ROWS_FOUND.0
        );
    }

    #[test]
    fn test_open_directory_reports_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let state = logged_in(dir.path());

        let reply = dispatch(
            &state,
            NetMessage::Open(OpenRequest { path: "/sub".into(), flags: OpenFlags::READ_ONLY }),
        );
        assert_eq!(error_code(reply), RemoteCode::NO_ROWS_FOUND.0);
    }

    #[test]
    fn test_descriptor_io() {
        let dir = tempfile::tempdir().unwrap();
        let state = logged_in(dir.path());

        let fd = match dispatch(
            &state,
            NetMessage::Create(CreateRequest {
                path: "/new".into(),
                flags: OpenFlags::READ_WRITE,
                mode: 0o644,
                resource: None,
            }),
        ) {
            NetMessage::OpenResponse(resp) => resp.fd,
            other => panic!("unexpected {}", other.name()),
        };

        let reply = dispatch(&state, NetMessage::Write(WriteRequest { fd, data: b"hello world".to_vec() }));
        assert!(matches!(reply, NetMessage::WriteResponse(WriteResponse { written: 11 })));

        dispatch(&state, NetMessage::Seek(SeekRequest { fd, offset: 6 }));
        match dispatch(&state, NetMessage::Read(ReadRequest { fd, len: 64 })) {
            NetMessage::ReadResponse(resp) => assert_eq!(resp.data, b"world"),
            other => panic!("unexpected {}", other.name()),
        }

        assert!(matches!(
            dispatch(&state, NetMessage::Close(keel_core::CloseRequest { fd })),
            NetMessage::Ok
        ));
        let reply = dispatch(&state, NetMessage::Close(keel_core::CloseRequest { fd }));
        assert_eq!(error_code(reply), RemoteCode::from_errno(libc::EBADF).0);
        assert_eq!(fs::read(dir.path().join("new")).unwrap(), b"hello world");
    }

    #[test]
    fn test_catalog_quirks() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("file"), b"x").unwrap();
        fs::write(dir.path().join("other"), b"y").unwrap();
        let state = logged_in(dir.path());

        // No-ops on the wrong kind
        assert!(matches!(dispatch(&state, NetMessage::Unlink(path("/sub"))), NetMessage::Ok));
        assert!(matches!(
            dispatch(&state, NetMessage::RemoveCollection(path("/file"))),
            NetMessage::Ok
        ));
        assert!(dir.path().join("sub").is_dir());
        assert!(dir.path().join("file").is_file());

        let reply = dispatch(
            &state,
            NetMessage::Rename(RenameRequest { from: "/file".into(), to: "/other".into() }),
        );
        assert_eq!(error_code(reply), RemoteCode::from_errno(libc::EEXIST).0);
    }

    #[test]
    fn test_escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = logged_in(dir.path());
        let reply = dispatch(&state, NetMessage::Stat(path("/../etc/passwd")));
        assert_eq!(error_code(reply), RemoteCode::from_errno(libc::EACCES).0);
    }

    #[test]
    fn test_checksum_matches_object_digest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file"), b"checksum me").unwrap();
        let state = logged_in(dir.path());

        match dispatch(&state, NetMessage::Checksum(path("/file"))) {
            NetMessage::ChecksumResponse(resp) => {
                assert_eq!(resp.checksum, keel_core::crypto::object_digest(b"checksum me").to_hex());
            }
            other => panic!("unexpected {}", other.name()),
        }
    }
}
