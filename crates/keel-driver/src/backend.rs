//! Backend seam
//!
//! A [`RemoteBackend`] knows how to load the process-wide protocol
//! environment and open transport sessions to a host. A [`Session`] is one
//! authenticated conversation; every method is a single remote call that
//! either succeeds or reports a [`RemoteCode`].

use async_trait::async_trait;
use bytes::Bytes;

use keel_core::{
    HostKey, ObjectStat, OpenFlags, QueryPage, ContinuationToken, RemoteCode, RemoteFd,
    SessionEnv,
};

/// Result of a single remote call
pub type RemoteResult<T> = Result<T, RemoteCode>;

/// Reply to a read request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReply {
    /// The backend filled the caller's buffer with this many bytes
    InPlace(usize),
    /// The backend returned its own buffer; the driver copies it out
    Owned(Bytes),
}

/// Factory for sessions to one kind of storage service
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Whether local credential material must exist before connecting
    fn requires_credentials(&self) -> bool {
        true
    }

    /// Load the protocol environment. Called at most once per successful load.
    async fn load_environment(&self) -> RemoteResult<SessionEnv>;

    /// Establish the transport to `host`. No authentication yet.
    async fn connect(&self, host: &HostKey, env: &SessionEnv) -> RemoteResult<Box<dyn Session>>;

    /// Map a result code onto a POSIX errno
    fn errno_for(&self, code: RemoteCode) -> i32 {
        code.unix_errno()
    }
}

/// One authenticated protocol conversation
#[async_trait]
pub trait Session: Send + 'static {
    /// Authenticate the freshly connected session
    async fn login(&mut self, env: &SessionEnv) -> RemoteResult<()>;

    async fn stat(&mut self, path: &str) -> RemoteResult<ObjectStat>;

    /// One page of the data objects directly inside `collection`
    async fn query_data_objects(
        &mut self,
        collection: &str,
        continuation: Option<ContinuationToken>,
    ) -> RemoteResult<QueryPage>;

    /// One page of the sub-collections directly inside `collection`
    async fn query_collections(
        &mut self,
        collection: &str,
        continuation: Option<ContinuationToken>,
    ) -> RemoteResult<QueryPage>;

    async fn create_collection(&mut self, path: &str) -> RemoteResult<()>;

    async fn remove_collection(&mut self, path: &str) -> RemoteResult<()>;

    async fn unlink(&mut self, path: &str) -> RemoteResult<()>;

    async fn rename(&mut self, from: &str, to: &str) -> RemoteResult<()>;

    async fn truncate(&mut self, path: &str, size: u64) -> RemoteResult<()>;

    /// Hex digest of the object content
    async fn checksum(&mut self, path: &str) -> RemoteResult<String>;

    async fn open(&mut self, path: &str, flags: OpenFlags) -> RemoteResult<RemoteFd>;

    async fn create(
        &mut self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        resource: Option<&str>,
    ) -> RemoteResult<RemoteFd>;

    /// Position the descriptor; returns the new offset
    async fn seek(&mut self, fd: RemoteFd, offset: u64) -> RemoteResult<u64>;

    async fn read(&mut self, fd: RemoteFd, buf: &mut [u8]) -> RemoteResult<ReadReply>;

    async fn write(&mut self, fd: RemoteFd, data: &[u8]) -> RemoteResult<usize>;

    async fn close(&mut self, fd: RemoteFd) -> RemoteResult<()>;

    /// Tear the session down. Best effort.
    async fn disconnect(&mut self);
}
