//! Path operations
//!
//! Stateless calls addressed by `(host, path)`. The empty host is the
//! storage root: it always stats as an empty directory and needs no backend.

use std::sync::Arc;

use tracing::debug;

use keel_core::path;
use keel_core::{Digest, ErrorKind, FileStat, HostKey, RemoteCode, StatFs};

use crate::connection_cache::Connection;
use crate::driver::RemoteDriver;

#[derive(Clone, Copy)]
enum Listing {
    DataObjects,
    Collections,
}

/// Every page of one listing query, in order
async fn collect_names(
    conn: Arc<Connection>,
    collection: &str,
    listing: Listing,
) -> Result<Vec<String>, RemoteCode> {
    let mut session = conn.session().await;
    let mut names = Vec::new();
    let mut continuation = None;

    loop {
        let page = match listing {
            Listing::DataObjects => session.query_data_objects(collection, continuation).await,
            Listing::Collections => session.query_collections(collection, continuation).await,
        };
        let page = match page {
            Ok(page) => page,
            // An exhausted continuation reads as "no rows"
            Err(code) if code.is_no_rows() && !names.is_empty() => break,
            Err(code) => return Err(code),
        };

        names.extend(page.names);
        match page.continuation {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }

    Ok(names)
}

impl RemoteDriver {
    /// POSIX attributes of `path`
    pub async fn stat(&self, host: &HostKey, path: &str) -> Result<FileStat, ErrorKind> {
        if host.is_root() {
            return Ok(FileStat::root());
        }

        let path = path::clean(path)?;
        let remote = path.as_str();
        debug!("stat {}{}", host, remote);

        let object = self
            .engine
            .run(host, "stat", move |conn| async move {
                let mut session = conn.session().await;
                session.stat(remote).await
            })
            .await?;

        Ok(FileStat::from_object(path::inode_for(&path), &object))
    }

    /// Deliver every entry name of collection `path` to `entry`, `.` and `..` first
    pub async fn getdir<F>(&self, host: &HostKey, path: &str, mut entry: F) -> Result<(), ErrorKind>
    where
        F: FnMut(&str),
    {
        if host.is_root() {
            entry(".");
            entry("..");
            return Ok(());
        }

        let path = path::clean(path)?;
        let remote = path.as_str();
        debug!("getdir {}{}", host, remote);

        let objects: Vec<String> = self
            .engine
            .run_listing(host, "list data objects", move |conn| {
                collect_names(conn, remote, Listing::DataObjects)
            })
            .await?;
        let collections: Vec<String> = self
            .engine
            .run_listing(host, "list collections", move |conn| {
                collect_names(conn, remote, Listing::Collections)
            })
            .await?;

        entry(".");
        entry("..");
        for name in objects.iter().chain(collections.iter()) {
            entry(name);
        }
        Ok(())
    }

    /// Entry names of collection `path`, `.` and `..` included
    pub async fn list(&self, host: &HostKey, path: &str) -> Result<Vec<String>, ErrorKind> {
        let mut names = Vec::new();
        self.getdir(host, path, |name| names.push(name.to_string()))
            .await?;
        Ok(names)
    }

    /// Filesystem capacity. The backend has no quota, so this is fixed.
    pub async fn statfs(&self, host: &HostKey, path: &str) -> Result<StatFs, ErrorKind> {
        debug!("statfs {}{}", host, path);
        Ok(StatFs::synthetic())
    }

    pub async fn mkdir(&self, host: &HostKey, path: &str, mode: u32) -> Result<(), ErrorKind> {
        let path = path::clean(path)?;
        let remote = path.as_str();
        debug!("mkdir {}{} (mode {:o})", host, remote, mode);

        self.engine
            .run(host, "mkdir", move |conn| async move {
                let mut session = conn.session().await;
                session.create_collection(remote).await
            })
            .await
    }

    pub async fn rmdir(&self, host: &HostKey, path: &str) -> Result<(), ErrorKind> {
        let path = path::clean(path)?;
        // The backend ignores rmdir on data objects
        if !self.stat(host, &path).await?.is_dir() {
            return Err(ErrorKind::NotADirectory);
        }

        let remote = path.as_str();
        debug!("rmdir {}{}", host, remote);
        self.engine
            .run(host, "rmdir", move |conn| async move {
                let mut session = conn.session().await;
                session.remove_collection(remote).await
            })
            .await
    }

    pub async fn unlink(&self, host: &HostKey, path: &str) -> Result<(), ErrorKind> {
        let path = path::clean(path)?;
        // The backend ignores unlink on collections
        if self.stat(host, &path).await?.is_dir() {
            return Err(ErrorKind::IsADirectory);
        }

        let remote = path.as_str();
        debug!("unlink {}{}", host, remote);
        self.engine
            .run(host, "unlink", move |conn| async move {
                let mut session = conn.session().await;
                session.unlink(remote).await
            })
            .await
    }

    /// Rename `from` to `to`, replacing an existing `to`. Not atomic.
    pub async fn rename(&self, host: &HostKey, from: &str, to: &str) -> Result<(), ErrorKind> {
        let from = path::clean(from)?;
        let to = path::clean(to)?;
        let (source, target) = (from.as_str(), to.as_str());
        debug!("rename {}{} -> {}", host, source, target);
        if source == target {
            // Nothing moves, but the source must exist
            return self.stat(host, source).await.map(|_| ());
        }

        // The backend refuses to replace, so clear the way first
        let cleared = self
            .engine
            .run(host, "rename (unlink target)", move |conn| async move {
                let mut session = conn.session().await;
                session.unlink(target).await
            })
            .await;
        if let Err(kind) = cleared {
            debug!("rename: target {} not removed: {}", target, kind);
        }

        self.engine
            .run(host, "rename", move |conn| async move {
                let mut session = conn.session().await;
                session.rename(source, target).await
            })
            .await
    }

    pub async fn truncate(&self, host: &HostKey, path: &str, size: u64) -> Result<(), ErrorKind> {
        let path = path::clean(path)?;
        let remote = path.as_str();
        debug!("truncate {}{} to {}", host, remote, size);

        self.engine
            .run(host, "truncate", move |conn| async move {
                let mut session = conn.session().await;
                session.truncate(remote, size).await
            })
            .await
    }

    /// Binary content digest of a data object
    pub async fn checksum(&self, host: &HostKey, path: &str) -> Result<Digest, ErrorKind> {
        let path = path::clean(path)?;
        let remote = path.as_str();
        debug!("checksum {}{}", host, remote);

        let hex = self
            .engine
            .run(host, "checksum", move |conn| async move {
                let mut session = conn.session().await;
                session.checksum(remote).await
            })
            .await?;

        Digest::from_hex(&hex).map_err(|kind| {
            debug!("checksum {}{}: malformed digest {:?}", host, remote, hex);
            kind
        })
    }
}
