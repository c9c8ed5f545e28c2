//! In-memory backend
//!
//! A collection store held in process memory. It behaves like a catalog
//! backed store does: deleting a collection with `unlink` or a data object
//! with `remove_collection` silently does nothing, opening a collection
//! reports "no rows found", rename never replaces an existing target,
//! descriptors belong to one session and die with it.
//!
//! Tests drive failures through fault injection (per operation, once or
//! always) and [`MemoryBackend::sever_sessions`], and observe traffic with
//! [`MemoryBackend::count`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use keel_core::crypto::object_digest;
use keel_core::path;
use keel_core::{
    ContinuationToken, HostKey, ObjectKind, ObjectStat, OpenFlags, QueryPage, RemoteCode,
    RemoteFd, SessionEnv,
};

use crate::backend::{ReadReply, RemoteBackend, RemoteResult, Session};

/// Default number of names per listing page
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Backend operations, for fault injection and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Environment,
    Connect,
    Login,
    Stat,
    QueryDataObjects,
    QueryCollections,
    CreateCollection,
    RemoveCollection,
    Unlink,
    Rename,
    Truncate,
    Checksum,
    Open,
    Create,
    Seek,
    Read,
    Write,
    Close,
    Disconnect,
}

#[derive(Debug, Clone)]
enum Node {
    Collection { created: i64, modified: i64 },
    Object { data: Vec<u8>, created: i64, modified: i64 },
}

impl Node {
    fn stat(&self) -> ObjectStat {
        match self {
            Node::Collection { created, modified } => ObjectStat {
                kind: ObjectKind::Collection,
                size: 0,
                create_time: *created,
                modify_time: *modified,
            },
            Node::Object { data, created, modified } => ObjectStat {
                kind: ObjectKind::DataObject,
                size: data.len() as u64,
                create_time: *created,
                modify_time: *modified,
            },
        }
    }

    fn is_collection(&self) -> bool {
        matches!(self, Node::Collection { .. })
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn unix(errno: i32) -> RemoteCode {
    RemoteCode::from_errno(errno)
}

/// Whether `child` sits directly inside `parent`
fn is_child_of(child: &str, parent: &str) -> bool {
    child != "/" && path::split(child).0 == parent
}

fn is_within(candidate: &str, root: &str) -> bool {
    candidate == root
        || (root == "/" && candidate.starts_with('/'))
        || candidate
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        let t = now();
        nodes.insert("/".to_string(), Node::Collection { created: t, modified: t });
        Self { nodes }
    }

    /// Parent must exist and be a collection
    fn check_parent(&self, path: &str) -> RemoteResult<()> {
        let (parent, _) = path::split(path);
        match self.nodes.get(parent) {
            Some(node) if node.is_collection() => Ok(()),
            Some(_) => Err(unix(libc::ENOTDIR)),
            None => Err(unix(libc::ENOENT)),
        }
    }

    fn touch_parent(&mut self, path: &str) {
        let (parent, _) = path::split(path);
        if let Some(Node::Collection { modified, .. }) = self.nodes.get_mut(parent) {
            *modified = now();
        }
    }

    fn children(&self, collection: &str, collections: bool) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(p, node)| is_child_of(p, collection) && node.is_collection() == collections)
            .map(|(p, _)| path::split(p).1.to_string())
            .collect()
    }

    fn ensure_collections(&mut self, path: &str) {
        let mut current = String::new();
        for name in path.split('/').filter(|n| !n.is_empty()) {
            current = path::join(if current.is_empty() { "/" } else { &current }, name);
            let t = now();
            self.nodes
                .entry(current.clone())
                .or_insert(Node::Collection { created: t, modified: t });
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Upcoming calls per op; `None` lets a call through
    once: HashMap<Op, VecDeque<Option<RemoteCode>>>,
    always: HashMap<Op, RemoteCode>,
}

#[derive(Debug)]
struct Shared {
    tree: RwLock<Tree>,
    faults: Mutex<Faults>,
    counters: Mutex<HashMap<Op, u64>>,
    /// Bumped to sever every live session
    epoch: AtomicU64,
    next_session: AtomicU64,
}

impl Shared {
    /// Count a call and report any injected failure for it
    fn enter(&self, op: Op) -> RemoteResult<()> {
        *self.counters.lock().entry(op).or_insert(0) += 1;

        let mut faults = self.faults.lock();
        if let Some(Some(code)) = faults.once.get_mut(&op).and_then(|queue| queue.pop_front()) {
            debug!("memory backend: injected {} for {:?}", code, op);
            return Err(code);
        }
        if let Some(code) = faults.always.get(&op) {
            return Err(*code);
        }
        Ok(())
    }
}

/// In-memory collection store
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    page_size: usize,
    owned_reads: bool,
    credentials_required: bool,
    env: SessionEnv,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: RwLock::new(Tree::new()),
                faults: Mutex::new(Faults::default()),
                counters: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
            }),
            page_size: DEFAULT_PAGE_SIZE,
            owned_reads: false,
            credentials_required: false,
            env: SessionEnv {
                user_name: "keel".into(),
                zone: "memory".into(),
                default_resource: Some("memResc".into()),
                secret: Vec::new(),
            },
        }
    }

    /// Names per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Answer reads with backend-owned buffers instead of filling the caller's
    pub fn with_owned_reads(mut self, owned: bool) -> Self {
        self.owned_reads = owned;
        self
    }

    pub fn with_credentials_required(mut self, required: bool) -> Self {
        self.credentials_required = required;
        self
    }

    pub fn with_environment(mut self, env: SessionEnv) -> Self {
        self.env = env;
        self
    }

    /// Store `data` at `path`, creating parent collections
    pub fn insert_object(&self, path: &str, data: &[u8]) {
        let path = path::normalize(path);
        let mut tree = self.shared.tree.write();
        tree.ensure_collections(path::split(&path).0);
        let t = now();
        tree.nodes.insert(
            path,
            Node::Object {
                data: data.to_vec(),
                created: t,
                modified: t,
            },
        );
    }

    /// Create a collection and its parents
    pub fn insert_collection(&self, path: &str) {
        self.shared.tree.write().ensure_collections(&path::normalize(path));
    }

    pub fn object_data(&self, path: &str) -> Option<Vec<u8>> {
        match self.shared.tree.read().nodes.get(&path::normalize(path)) {
            Some(Node::Object { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.shared.tree.read().nodes.contains_key(&path::normalize(path))
    }

    pub fn is_collection(&self, path: &str) -> bool {
        self.shared
            .tree
            .read()
            .nodes
            .get(&path::normalize(path))
            .is_some_and(Node::is_collection)
    }

    /// Fail the next call of `op` with `code`
    pub fn fail_next(&self, op: Op, code: RemoteCode) {
        self.fail_next_n(op, code, 1);
    }

    /// Fail the next `times` calls of `op` with `code`
    pub fn fail_next_n(&self, op: Op, code: RemoteCode, times: usize) {
        let mut faults = self.shared.faults.lock();
        let queue = faults.once.entry(op).or_default();
        queue.extend(std::iter::repeat(Some(code)).take(times));
    }

    /// Let `n - 1` calls of `op` through, then fail the next one
    pub fn fail_nth(&self, op: Op, n: usize, code: RemoteCode) {
        let mut faults = self.shared.faults.lock();
        let queue = faults.once.entry(op).or_default();
        queue.extend(std::iter::repeat(None).take(n.saturating_sub(1)));
        queue.push_back(Some(code));
    }

    /// Fail every call of `op` until faults are cleared
    pub fn fail_always(&self, op: Op, code: RemoteCode) {
        self.shared.faults.lock().always.insert(op, code);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.shared.faults.lock();
        faults.once.clear();
        faults.always.clear();
    }

    /// Break every live session; their next call reports a reset
    pub fn sever_sessions(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of calls of `op` so far, failed ones included
    pub fn count(&self, op: Op) -> u64 {
        self.shared.counters.lock().get(&op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn requires_credentials(&self) -> bool {
        self.credentials_required
    }

    async fn load_environment(&self) -> RemoteResult<SessionEnv> {
        self.shared.enter(Op::Environment)?;
        Ok(self.env.clone())
    }

    async fn connect(&self, host: &HostKey, _env: &SessionEnv) -> RemoteResult<Box<dyn Session>> {
        self.shared.enter(Op::Connect)?;
        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        debug!("memory backend: session {} for {}", id, host);
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
            id,
            epoch: self.shared.epoch.load(Ordering::SeqCst),
            open: true,
            logged_in: false,
            page_size: self.page_size,
            owned_reads: self.owned_reads,
            descriptors: HashMap::new(),
            next_fd: 3,
        }))
    }
}

#[derive(Debug)]
struct Descriptor {
    path: String,
    flags: OpenFlags,
    offset: u64,
}

/// One session against the in-memory store
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    id: u64,
    epoch: u64,
    open: bool,
    logged_in: bool,
    page_size: usize,
    owned_reads: bool,
    descriptors: HashMap<i32, Descriptor>,
    next_fd: i32,
}

impl MemorySession {
    /// Common entry: count, injected faults, session liveness
    fn enter(&mut self, op: Op) -> RemoteResult<()> {
        self.shared.enter(op)?;
        if !self.open || self.epoch != self.shared.epoch.load(Ordering::SeqCst) {
            self.descriptors.clear();
            return Err(unix(libc::ECONNRESET));
        }
        if !self.logged_in && op != Op::Login {
            return Err(RemoteCode::AUTH_FAILED);
        }
        Ok(())
    }

    fn descriptor(&mut self, fd: RemoteFd) -> RemoteResult<&mut Descriptor> {
        self.descriptors.get_mut(&fd.0).ok_or(unix(libc::EBADF))
    }

    fn allocate(&mut self, path: String, flags: OpenFlags) -> RemoteFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.descriptors.insert(fd, Descriptor { path, flags, offset: 0 });
        RemoteFd(fd)
    }

    fn page(&self, names: Vec<String>, continuation: Option<ContinuationToken>) -> RemoteResult<QueryPage> {
        let start = continuation.map_or(0, |c| c.0 as usize);
        if names.is_empty() || start >= names.len() {
            return Err(RemoteCode::NO_ROWS_FOUND);
        }
        let end = (start + self.page_size).min(names.len());
        Ok(QueryPage {
            names: names[start..end].to_vec(),
            continuation: (end < names.len()).then_some(ContinuationToken(end as u64)),
        })
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn login(&mut self, _env: &SessionEnv) -> RemoteResult<()> {
        self.enter(Op::Login)?;
        self.logged_in = true;
        Ok(())
    }

    async fn stat(&mut self, path: &str) -> RemoteResult<ObjectStat> {
        self.enter(Op::Stat)?;
        let tree = self.shared.tree.read();
        tree.nodes.get(path).map(Node::stat).ok_or(unix(libc::ENOENT))
    }

    async fn query_data_objects(
        &mut self,
        collection: &str,
        continuation: Option<ContinuationToken>,
    ) -> RemoteResult<QueryPage> {
        self.enter(Op::QueryDataObjects)?;
        let names = self.shared.tree.read().children(collection, false);
        self.page(names, continuation)
    }

    async fn query_collections(
        &mut self,
        collection: &str,
        continuation: Option<ContinuationToken>,
    ) -> RemoteResult<QueryPage> {
        self.enter(Op::QueryCollections)?;
        let names = self.shared.tree.read().children(collection, true);
        self.page(names, continuation)
    }

    async fn create_collection(&mut self, path: &str) -> RemoteResult<()> {
        self.enter(Op::CreateCollection)?;
        let mut tree = self.shared.tree.write();
        if tree.nodes.contains_key(path) {
            return Err(unix(libc::EEXIST));
        }
        tree.check_parent(path)?;
        let t = now();
        tree.nodes.insert(path.to_string(), Node::Collection { created: t, modified: t });
        tree.touch_parent(path);
        Ok(())
    }

    async fn remove_collection(&mut self, path: &str) -> RemoteResult<()> {
        self.enter(Op::RemoveCollection)?;
        let mut tree = self.shared.tree.write();
        match tree.nodes.get(path) {
            None => return Err(unix(libc::ENOENT)),
            // Not a collection: nothing to remove
            Some(Node::Object { .. }) => return Ok(()),
            Some(Node::Collection { .. }) => {}
        }
        if path == "/" {
            return Err(unix(libc::EACCES));
        }
        if tree.nodes.keys().any(|p| is_child_of(p, path)) {
            return Err(unix(libc::ENOTEMPTY));
        }
        tree.nodes.remove(path);
        tree.touch_parent(path);
        Ok(())
    }

    async fn unlink(&mut self, path: &str) -> RemoteResult<()> {
        self.enter(Op::Unlink)?;
        let mut tree = self.shared.tree.write();
        match tree.nodes.get(path) {
            None => Err(unix(libc::ENOENT)),
            // Not a data object: nothing to unlink
            Some(Node::Collection { .. }) => Ok(()),
            Some(Node::Object { .. }) => {
                tree.nodes.remove(path);
                tree.touch_parent(path);
                Ok(())
            }
        }
    }

    async fn rename(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        self.enter(Op::Rename)?;
        let mut tree = self.shared.tree.write();
        if !tree.nodes.contains_key(from) {
            return Err(unix(libc::ENOENT));
        }
        if tree.nodes.contains_key(to) {
            return Err(unix(libc::EEXIST));
        }
        if from == "/" || is_within(to, from) {
            return Err(unix(libc::EINVAL));
        }
        tree.check_parent(to)?;

        let moved: Vec<String> = tree
            .nodes
            .keys()
            .filter(|p| is_within(p, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = tree.nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                tree.nodes.insert(new, node);
            }
        }
        tree.touch_parent(from);
        tree.touch_parent(to);
        Ok(())
    }

    async fn truncate(&mut self, path: &str, size: u64) -> RemoteResult<()> {
        self.enter(Op::Truncate)?;
        let mut tree = self.shared.tree.write();
        match tree.nodes.get_mut(path) {
            Some(Node::Object { data, modified, .. }) => {
                data.resize(size as usize, 0);
                *modified = now();
                Ok(())
            }
            Some(Node::Collection { .. }) => Err(unix(libc::EISDIR)),
            None => Err(unix(libc::ENOENT)),
        }
    }

    async fn checksum(&mut self, path: &str) -> RemoteResult<String> {
        self.enter(Op::Checksum)?;
        let tree = self.shared.tree.read();
        match tree.nodes.get(path) {
            Some(Node::Object { data, .. }) => Ok(object_digest(data).to_hex()),
            Some(Node::Collection { .. }) => Err(unix(libc::EISDIR)),
            None => Err(unix(libc::ENOENT)),
        }
    }

    async fn open(&mut self, path: &str, flags: OpenFlags) -> RemoteResult<RemoteFd> {
        self.enter(Op::Open)?;
        let found = matches!(self.shared.tree.read().nodes.get(path), Some(Node::Object { .. }));
        if !found {
            // Collections are not data objects either
            return Err(RemoteCode::NO_ROWS_FOUND);
        }
        Ok(self.allocate(path.to_string(), flags))
    }

    async fn create(
        &mut self,
        path: &str,
        flags: OpenFlags,
        _mode: u32,
        resource: Option<&str>,
    ) -> RemoteResult<RemoteFd> {
        self.enter(Op::Create)?;
        {
            let mut tree = self.shared.tree.write();
            if tree.nodes.contains_key(path) {
                return Err(unix(libc::EEXIST));
            }
            tree.check_parent(path)?;
            let t = now();
            tree.nodes.insert(
                path.to_string(),
                Node::Object {
                    data: Vec::new(),
                    created: t,
                    modified: t,
                },
            );
            tree.touch_parent(path);
        }
        debug!("memory backend: created {} on {:?}", path, resource);
        Ok(self.allocate(path.to_string(), flags))
    }

    async fn seek(&mut self, fd: RemoteFd, offset: u64) -> RemoteResult<u64> {
        self.enter(Op::Seek)?;
        let descriptor = self.descriptor(fd)?;
        descriptor.offset = offset;
        Ok(offset)
    }

    async fn read(&mut self, fd: RemoteFd, buf: &mut [u8]) -> RemoteResult<ReadReply> {
        self.enter(Op::Read)?;
        let owned = self.owned_reads;
        let shared = self.shared.clone();
        let descriptor = self.descriptor(fd)?;
        if !descriptor.flags.readable() {
            return Err(unix(libc::EBADF));
        }

        let tree = shared.tree.read();
        let data = match tree.nodes.get(&descriptor.path) {
            Some(Node::Object { data, .. }) => data,
            _ => return Err(unix(libc::ENOENT)),
        };

        let start = (descriptor.offset as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());
        let chunk = &data[start..end];
        descriptor.offset += chunk.len() as u64;

        if owned {
            Ok(ReadReply::Owned(Bytes::copy_from_slice(chunk)))
        } else {
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(ReadReply::InPlace(chunk.len()))
        }
    }

    async fn write(&mut self, fd: RemoteFd, input: &[u8]) -> RemoteResult<usize> {
        self.enter(Op::Write)?;
        let shared = self.shared.clone();
        let descriptor = self.descriptor(fd)?;
        if !descriptor.flags.writable() {
            return Err(unix(libc::EBADF));
        }

        let mut tree = shared.tree.write();
        let (data, modified) = match tree.nodes.get_mut(&descriptor.path) {
            Some(Node::Object { data, modified, .. }) => (data, modified),
            _ => return Err(unix(libc::ENOENT)),
        };

        if descriptor.flags.append() {
            descriptor.offset = data.len() as u64;
        }
        let start = descriptor.offset as usize;
        let end = start + input.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(input);
        *modified = now();
        descriptor.offset = end as u64;
        Ok(input.len())
    }

    async fn close(&mut self, fd: RemoteFd) -> RemoteResult<()> {
        self.enter(Op::Close)?;
        self.descriptors
            .remove(&fd.0)
            .map(|_| ())
            .ok_or(unix(libc::EBADF))
    }

    async fn disconnect(&mut self) {
        *self.shared.counters.lock().entry(Op::Disconnect).or_insert(0) += 1;
        debug!("memory backend: session {} closed", self.id);
        self.open = false;
        self.descriptors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(backend: &MemoryBackend) -> Box<dyn Session> {
        let env = backend.load_environment().await.unwrap();
        let mut session = backend
            .connect(&HostKey::new("mem", 1247), &env)
            .await
            .unwrap();
        session.login(&env).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_unlink_collection_is_silent_noop() {
        let backend = MemoryBackend::new();
        backend.insert_collection("/zone/dir");
        let mut s = session(&backend).await;

        assert!(s.unlink("/zone/dir").await.is_ok());
        assert!(backend.is_collection("/zone/dir"));
    }

    #[tokio::test]
    async fn test_remove_collection_on_object_is_silent_noop() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"x");
        let mut s = session(&backend).await;

        assert!(s.remove_collection("/zone/file").await.is_ok());
        assert_eq!(backend.object_data("/zone/file").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_open_collection_reports_no_rows() {
        let backend = MemoryBackend::new();
        backend.insert_collection("/zone/dir");
        let mut s = session(&backend).await;

        assert_eq!(
            s.open("/zone/dir", OpenFlags::READ_ONLY).await.unwrap_err(),
            RemoteCode::NO_ROWS_FOUND
        );
        assert_eq!(
            s.open("/zone/missing", OpenFlags::READ_ONLY).await.unwrap_err(),
            RemoteCode::NO_ROWS_FOUND
        );
    }

    #[tokio::test]
    async fn test_rename_does_not_replace() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/a", b"a");
        backend.insert_object("/zone/b", b"b");
        let mut s = session(&backend).await;

        assert_eq!(s.rename("/zone/a", "/zone/b").await.unwrap_err(), unix(libc::EEXIST));
        assert_eq!(backend.object_data("/zone/b").unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/dir/inner/file", b"data");
        backend.insert_object("/zone/dirt", b"other");
        let mut s = session(&backend).await;

        s.rename("/zone/dir", "/zone/moved").await.unwrap();
        assert_eq!(backend.object_data("/zone/moved/inner/file").unwrap(), b"data");
        assert!(!backend.exists("/zone/dir"));
        // Sibling sharing a name prefix stays put
        assert_eq!(backend.object_data("/zone/dirt").unwrap(), b"other");

        assert_eq!(
            s.rename("/zone/moved", "/zone/moved/inner/x").await.unwrap_err(),
            unix(libc::EINVAL)
        );
    }

    #[tokio::test]
    async fn test_pagination() {
        let backend = MemoryBackend::new().with_page_size(2);
        for name in ["a", "b", "c", "d", "e"] {
            backend.insert_object(&format!("/zone/{}", name), b"");
        }
        let mut s = session(&backend).await;

        let first = s.query_data_objects("/zone", None).await.unwrap();
        assert_eq!(first.names, vec!["a", "b"]);
        let second = s.query_data_objects("/zone", first.continuation).await.unwrap();
        assert_eq!(second.names, vec!["c", "d"]);
        let third = s.query_data_objects("/zone", second.continuation).await.unwrap();
        assert_eq!(third.names, vec!["e"]);
        assert!(third.continuation.is_none());

        assert_eq!(
            s.query_collections("/zone", None).await.unwrap_err(),
            RemoteCode::NO_ROWS_FOUND
        );
    }

    #[tokio::test]
    async fn test_descriptors_die_with_session() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"hello");
        let mut s = session(&backend).await;
        let fd = s.open("/zone/file", OpenFlags::READ_ONLY).await.unwrap();

        backend.sever_sessions();
        let mut buf = [0u8; 5];
        assert_eq!(s.read(fd, &mut buf).await.unwrap_err(), unix(libc::ECONNRESET));

        let mut fresh = session(&backend).await;
        assert_eq!(fresh.read(fd, &mut buf).await.unwrap_err(), unix(libc::EBADF));
    }

    #[tokio::test]
    async fn test_owned_reads() {
        let backend = MemoryBackend::new().with_owned_reads(true);
        backend.insert_object("/zone/file", b"hello world");
        let mut s = session(&backend).await;
        let fd = s.open("/zone/file", OpenFlags::READ_ONLY).await.unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(
            s.read(fd, &mut buf).await.unwrap(),
            ReadReply::Owned(Bytes::from_static(b"hello"))
        );
        s.seek(fd, 6).await.unwrap();
        assert_eq!(
            s.read(fd, &mut buf).await.unwrap(),
            ReadReply::Owned(Bytes::from_static(b"world"))
        );
    }

    #[tokio::test]
    async fn test_fault_injection_and_counters() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"");
        let mut s = session(&backend).await;

        backend.fail_next_n(Op::Stat, unix(libc::EAGAIN), 2);
        assert_eq!(s.stat("/zone/file").await.unwrap_err(), unix(libc::EAGAIN));
        assert_eq!(s.stat("/zone/file").await.unwrap_err(), unix(libc::EAGAIN));
        assert!(s.stat("/zone/file").await.is_ok());
        assert_eq!(backend.count(Op::Stat), 3);

        backend.fail_always(Op::Checksum, unix(libc::EIO));
        assert!(s.checksum("/zone/file").await.is_err());
        assert!(s.checksum("/zone/file").await.is_err());
        backend.clear_faults();
        assert!(s.checksum("/zone/file").await.is_ok());
    }

    #[tokio::test]
    async fn test_requires_login() {
        let backend = MemoryBackend::new();
        let env = backend.load_environment().await.unwrap();
        let mut s = backend.connect(&HostKey::new("mem", 1247), &env).await.unwrap();
        assert_eq!(s.stat("/").await.unwrap_err(), RemoteCode::AUTH_FAILED);
    }
}
