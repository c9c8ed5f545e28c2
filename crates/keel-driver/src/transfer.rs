//! Whole-file copies between a local file and a remote data object
//!
//! Both directions go through the handle operations chunk by chunk, so a
//! dropped session in the middle of a copy is reopened and the copy carries
//! on at the same offset.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use keel_core::{ErrorKind, HostKey, OpenFlags};

use crate::driver::RemoteDriver;
use crate::handle_ops::RemoteFile;

impl RemoteDriver {
    /// Copy the remote object `path` into `local`; returns bytes copied
    pub async fn get_file(
        &self,
        host: &HostKey,
        path: &str,
        local: &Path,
    ) -> Result<u64, ErrorKind> {
        let mut file = self.open(host, path, OpenFlags::READ_ONLY, 0).await?;
        let copied = self.download(&mut file, local).await;
        let closed = self.close(file).await;

        let copied = copied?;
        closed?;
        info!("fetched {}{} -> {} ({} bytes)", host, path, local.display(), copied);
        Ok(copied)
    }

    /// Copy `local` into the remote object `path`, replacing its content
    pub async fn put_file(
        &self,
        host: &HostKey,
        path: &str,
        local: &Path,
    ) -> Result<u64, ErrorKind> {
        // Fail on a missing source before touching the remote side
        let source = File::open(local).await?;

        let flags = OpenFlags::WRITE_ONLY.with(libc::O_CREAT | libc::O_TRUNC);
        let mut file = self.open(host, path, flags, 0o644).await?;
        let copied = self.upload(&mut file, source).await;
        let closed = self.close(file).await;

        let copied = copied?;
        closed?;
        info!("stored {} -> {}{} ({} bytes)", local.display(), host, path, copied);
        Ok(copied)
    }

    async fn download(&self, file: &mut RemoteFile, local: &Path) -> Result<u64, ErrorKind> {
        let mut out = File::create(local).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset = 0u64;

        loop {
            let count = self.pread(file, &mut buf, offset).await?;
            if count == 0 {
                break;
            }
            out.write_all(&buf[..count]).await?;
            offset += count as u64;
            debug!("get {}: {} bytes so far", file.path(), offset);
        }

        out.flush().await?;
        Ok(offset)
    }

    async fn upload(&self, file: &mut RemoteFile, mut source: File) -> Result<u64, ErrorKind> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset = 0u64;

        loop {
            let count = source.read(&mut buf).await?;
            if count == 0 {
                break;
            }

            let mut written = 0;
            while written < count {
                let n = self
                    .pwrite(file, &buf[written..count], offset + written as u64)
                    .await?;
                if n == 0 {
                    return Err(ErrorKind::IoError);
                }
                written += n;
            }
            offset += count as u64;
            debug!("put {}: {} bytes so far", file.path(), offset);
        }

        Ok(offset)
    }
}
