//! Core type definitions for Keel
//!
//! Value types shared by the driver, the backends and the wire protocol.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::DIGEST_LEN;

/// Identifies one remote session endpoint (`host:port`)
///
/// The empty key names the storage root itself, which has no host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostKey(String);

impl HostKey {
    /// Build a key, appending `default_port` when none is given
    ///
    /// IPv6 literals may be bare (`::1`) or bracketed (`[::1]:1247`); the key
    /// always holds the bracketed form.
    pub fn new(host: &str, default_port: u16) -> Self {
        let host = host.trim();
        if host.is_empty() {
            return Self::root();
        }
        if let Some(rest) = host.strip_prefix('[') {
            return match rest.split_once(']') {
                Some((addr, "")) => Self(format!("[{}]:{}", addr, default_port)),
                _ => Self(host.to_string()),
            };
        }
        if host.parse::<Ipv6Addr>().is_ok() {
            return Self(format!("[{}]:{}", host, default_port));
        }
        match host.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => Self(host.to_string()),
            _ => Self(format!("{}:{}", host, default_port)),
        }
    }

    /// The storage-root pseudo-host
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into host name and port
    pub fn split(&self) -> Option<(&str, u16)> {
        let (host, port) = self.0.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Some((host, port))
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of remote object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// File-like leaf object
    DataObject,
    /// Directory-like container
    Collection,
}

/// Stat reply from a backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    pub kind: ObjectKind,
    pub size: u64,
    /// Seconds since the epoch
    pub create_time: i64,
    /// Seconds since the epoch
    pub modify_time: i64,
}

/// POSIX-like attributes handed to the front end
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u64,
    pub dev: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub const S_IFMT: u32 = 0o170_000;
    pub const S_IFDIR: u32 = 0o040_000;
    pub const S_IFREG: u32 = 0o100_000;

    /// Permission bits reported for every object
    pub const PERMISSIONS: u32 = 0o755;

    /// Size reported for collections
    pub const DIR_SIZE: u64 = 4096;

    /// Preferred I/O block size
    pub const BLOCK_SIZE: u32 = 4096;

    /// Inode number of the storage root
    pub const ROOT_INODE: u64 = 2;

    /// The storage root: an empty directory that needs no backend
    pub fn root() -> Self {
        Self {
            ino: Self::ROOT_INODE,
            dev: u64::MAX,
            mode: Self::S_IFDIR | Self::PERMISSIONS,
            nlink: 1,
            size: Self::DIR_SIZE,
            blksize: 0,
            blocks: 8,
            ..Default::default()
        }
    }

    /// Convert a backend stat reply; `ino` is supplied by the caller
    pub fn from_object(ino: u64, object: &ObjectStat) -> Self {
        let (mode, size, blocks) = match object.kind {
            ObjectKind::Collection => (Self::S_IFDIR | Self::PERMISSIONS, Self::DIR_SIZE, 8),
            ObjectKind::DataObject => (
                Self::S_IFREG | Self::PERMISSIONS,
                object.size,
                object.size / 512 + 1,
            ),
        };

        Self {
            ino,
            dev: u64::MAX,
            mode,
            nlink: 1,
            size,
            blksize: Self::BLOCK_SIZE,
            blocks,
            atime: object.modify_time,
            mtime: object.modify_time,
            ctime: object.create_time,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & Self::S_IFMT == Self::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & Self::S_IFMT == Self::S_IFREG
    }
}

/// Filesystem capacity (statfs)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatFs {
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

impl StatFs {
    /// The backend reports no quota, so capacity is a large fixed figure
    pub fn synthetic() -> Self {
        Self {
            bsize: 4096,
            blocks: 10_000_000,
            bfree: 10_000_000,
            bavail: 10_000_000,
            files: 10_000_000,
            ffree: 10_000_000,
        }
    }
}

/// POSIX open flags (`O_*` bits)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WRITE_ONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const READ_WRITE: OpenFlags = OpenFlags(libc::O_RDWR);

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn with(self, bits: i32) -> Self {
        OpenFlags(self.0 | bits)
    }

    pub fn create(self) -> bool {
        self.0 & libc::O_CREAT != 0
    }

    pub fn truncate(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    pub fn exclusive(self) -> bool {
        self.0 & libc::O_EXCL != 0
    }

    pub fn append(self) -> bool {
        self.0 & libc::O_APPEND != 0
    }

    pub fn readable(self) -> bool {
        let mode = self.0 & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    pub fn writable(self) -> bool {
        let mode = self.0 & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Flags used to reattach an already-open object on a new session
    pub fn for_reopen(self) -> Self {
        OpenFlags(self.0 & !(libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL))
    }
}

/// Descriptor of an object opened on one backend session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteFd(pub i32);

impl fmt::Display for RemoteFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque position in a paginated listing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken(pub u64);

/// One page of a listing query
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPage {
    /// Leaf names of matching children
    pub names: Vec<String>,
    /// Present while more pages remain
    pub continuation: Option<ContinuationToken>,
}

/// Binary object checksum
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Decode the hex string a backend reports
    pub fn from_hex(text: &str) -> Result<Self, ErrorKind> {
        let text = text.trim().as_bytes();
        if text.len() < DIGEST_LEN * 2 {
            return Err(ErrorKind::IoError);
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(&text[..DIGEST_LEN * 2], &mut bytes)
            .map_err(|_| ErrorKind::IoError)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Process-wide protocol environment, loaded once per process
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionEnv {
    pub user_name: String,
    pub zone: String,
    /// Storage resource new objects are created on, if the backend has one
    pub default_resource: Option<String>,
    /// Backend-defined secret material; never inspected by the driver
    pub secret: Vec<u8>,
}
