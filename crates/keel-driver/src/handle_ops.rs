//! Open-file operations
//!
//! A [`RemoteFile`] remembers which connection generation its descriptor
//! belongs to. When the cache has replaced that connection, the next
//! operation reopens the object on the new one (without create, truncate or
//! exclusive) and starts again from offset 0. The caller owns the handle;
//! `close` consumes it.

use tracing::debug;

use keel_core::path;
use keel_core::{translate_with, ErrorKind, HostKey, OpenFlags, RemoteCode, RemoteFd};

use crate::backend::{ReadReply, Session};
use crate::driver::RemoteDriver;
use crate::retry::AttemptError;

/// An open remote data object
#[derive(Debug)]
pub struct RemoteFile {
    host: HostKey,
    path: String,
    flags: OpenFlags,
    fd: RemoteFd,
    /// Position of the remote descriptor as far as we know
    offset: u64,
    generation: u64,
}

impl RemoteFile {
    pub fn host(&self) -> &HostKey {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Reattach `file` to the session of `generation` if it was opened elsewhere
async fn resync(
    session: &mut Box<dyn Session>,
    file: &mut RemoteFile,
    generation: u64,
) -> Result<(), AttemptError> {
    if file.generation == generation {
        return Ok(());
    }

    debug!(
        "reopening {}{} (generation {} -> {})",
        file.host, file.path, file.generation, generation
    );
    let fd = session
        .open(&file.path, file.flags.for_reopen())
        .await
        .map_err(AttemptError::Resync)?;

    file.fd = fd;
    file.offset = 0;
    file.generation = generation;
    Ok(())
}

async fn seek_if_needed(
    session: &mut Box<dyn Session>,
    file: &mut RemoteFile,
    offset: u64,
) -> Result<(), AttemptError> {
    if file.offset == offset {
        return Ok(());
    }
    file.offset = session.seek(file.fd, offset).await?;
    Ok(())
}

impl RemoteDriver {
    /// Open (and with `O_CREAT`, create) a data object
    pub async fn open(
        &self,
        host: &HostKey,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<RemoteFile, ErrorKind> {
        let path = path::clean(path)?;
        debug!("open {}{} (flags {:#o}, mode {:o})", host, path, flags.bits(), mode);

        let backend = self.cache().backend();
        // Only a missing object is created; other failures go to the retry engine
        let missing =
            |code: RemoteCode| translate_with(code, |c| backend.errno_for(c)) == ErrorKind::NotFound;

        let mut retry = self.engine.begin(host, "open");
        let (fd, generation) = loop {
            let conn = retry.connection().await?;
            let resource = self
                .cache()
                .environment()
                .and_then(|env| env.default_resource.clone());

            let result = retry
                .attempt(&conn, async {
                    let mut session = conn.session().await;
                    if flags.create() && flags.exclusive() {
                        let fd = session.create(&path, flags, mode, resource.as_deref()).await?;
                        return Ok::<_, AttemptError>(fd);
                    }
                    match session.open(&path, flags).await {
                        Ok(fd) => Ok(fd),
                        Err(code) if flags.create() && missing(code) => {
                            Ok(session.create(&path, flags, mode, resource.as_deref()).await?)
                        }
                        Err(code) => Err(AttemptError::Remote(code)),
                    }
                })
                .await;

            if let Err(AttemptError::Remote(code)) = &result {
                // Directories answer an open with "no rows"
                if code.is_no_rows() {
                    return match self.stat(host, &path).await {
                        Ok(stat) if stat.is_dir() => Err(ErrorKind::IsADirectory),
                        Ok(_) => Err(ErrorKind::NotFound),
                        Err(kind) => Err(kind),
                    };
                }
            }

            if let Some(fd) = retry.settle(&conn, result).await? {
                break (fd, conn.generation());
            }
        };

        let file = RemoteFile {
            host: host.clone(),
            path,
            flags,
            fd,
            offset: 0,
            generation,
        };

        if flags.truncate() {
            if let Err(kind) = self.truncate(host, &file.path, 0).await {
                if let Err(close_err) = self.close(file).await {
                    debug!("close after failed truncate: {}", close_err);
                }
                return Err(kind);
            }
        }

        Ok(file)
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the count read
    pub async fn pread(
        &self,
        file: &mut RemoteFile,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ErrorKind> {
        let host = file.host.clone();
        let mut retry = self.engine.begin(&host, "read");

        loop {
            let conn = retry.connection().await?;
            let generation = conn.generation();

            let result = retry
                .attempt(&conn, async {
                    let mut session = conn.session().await;
                    resync(&mut session, file, generation).await?;
                    seek_if_needed(&mut session, file, offset).await?;

                    let count = match session.read(file.fd, buf).await? {
                        ReadReply::InPlace(count) => count.min(buf.len()),
                        ReadReply::Owned(data) => {
                            let count = data.len().min(buf.len());
                            buf[..count].copy_from_slice(&data[..count]);
                            count
                        }
                    };
                    file.offset += count as u64;
                    Ok::<_, AttemptError>(count)
                })
                .await;

            if let Some(count) = retry.settle(&conn, result).await? {
                debug!("read {}{}: {} bytes at {}", host, file.path, count, offset);
                return Ok(count);
            }
        }
    }

    /// Write `data` at `offset`; returns the count written
    pub async fn pwrite(
        &self,
        file: &mut RemoteFile,
        data: &[u8],
        offset: u64,
    ) -> Result<usize, ErrorKind> {
        let host = file.host.clone();
        let mut retry = self.engine.begin(&host, "write");

        loop {
            let conn = retry.connection().await?;
            let generation = conn.generation();

            let result = retry
                .attempt(&conn, async {
                    let mut session = conn.session().await;
                    resync(&mut session, file, generation).await?;
                    seek_if_needed(&mut session, file, offset).await?;

                    let count = session.write(file.fd, data).await?;
                    file.offset += count as u64;
                    Ok::<_, AttemptError>(count)
                })
                .await;

            if let Some(count) = retry.settle(&conn, result).await? {
                debug!("write {}{}: {} bytes at {}", host, file.path, count, offset);
                return Ok(count);
            }
        }
    }

    /// Release the remote descriptor. A descriptor whose connection has been
    /// replaced is already gone, so that case succeeds without a request.
    pub async fn close(&self, file: RemoteFile) -> Result<(), ErrorKind> {
        let host = file.host.clone();
        if self.cache().current_generation(&host).await != Some(file.generation) {
            debug!("close {}{}: connection replaced, already closed", host, file.path);
            return Ok(());
        }

        let mut retry = self.engine.begin(&host, "close");
        loop {
            let conn = retry.connection().await?;
            if conn.generation() != file.generation {
                return Ok(());
            }

            let fd = file.fd;
            let result = retry
                .attempt(&conn, async {
                    let mut session = conn.session().await;
                    Ok::<_, AttemptError>(session.close(fd).await?)
                })
                .await;

            if retry.settle(&conn, result).await?.is_some() {
                debug!("close {}{}", host, file.path);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::{driver_for, host};
    use crate::memory::{MemoryBackend, Op};

    fn create_flags() -> OpenFlags {
        OpenFlags::READ_WRITE.with(libc::O_CREAT)
    }

    #[tokio::test]
    async fn test_create_write_reopen_read() {
        let backend = MemoryBackend::new();
        backend.insert_collection("/zone");
        let driver = driver_for(&backend);

        let data: Vec<u8> = (0..100u8).collect();
        let mut file = driver.open(&host(), "/zone/new", create_flags(), 0o644).await.unwrap();
        assert_eq!(driver.pwrite(&mut file, &data, 0).await.unwrap(), 100);
        driver.close(file).await.unwrap();

        let mut file = driver
            .open(&host(), "/zone/new", OpenFlags::READ_ONLY, 0)
            .await
            .unwrap();
        let mut buf = vec![0u8; 100];
        assert_eq!(driver.pread(&mut file, &mut buf, 0).await.unwrap(), 100);
        assert_eq!(buf, data);
        driver.close(file).await.unwrap();

        assert_eq!(backend.count(Op::Create), 1);
    }

    #[tokio::test]
    async fn test_seek_elision() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", &[1u8; 64]);
        let driver = driver_for(&backend);
        let mut file = driver
            .open(&host(), "/zone/file", OpenFlags::READ_WRITE, 0)
            .await
            .unwrap();

        let mut buf = [0u8; 10];
        driver.pread(&mut file, &mut buf, 0).await.unwrap();
        assert_eq!(file.offset(), 10);
        assert_eq!(backend.count(Op::Seek), 0);

        // Offset already matches: no seek
        driver.pread(&mut file, &mut buf, 10).await.unwrap();
        assert_eq!(backend.count(Op::Seek), 0);
        assert_eq!(file.offset(), 20);

        driver.pwrite(&mut file, b"abc", 20).await.unwrap();
        assert_eq!(backend.count(Op::Seek), 0);

        driver.pread(&mut file, &mut buf, 40).await.unwrap();
        assert_eq!(backend.count(Op::Seek), 1);
        assert_eq!(file.offset(), 50);
    }

    #[tokio::test]
    async fn test_short_read_at_end() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"0123456789");
        let driver = driver_for(&backend);
        let mut file = driver
            .open(&host(), "/zone/file", OpenFlags::READ_ONLY, 0)
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(driver.pread(&mut file, &mut buf, 6).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
        assert_eq!(file.offset(), 10);
        assert_eq!(driver.pread(&mut file, &mut buf, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_owned_read_buffer_is_copied() {
        let backend = MemoryBackend::new().with_owned_reads(true);
        backend.insert_object("/zone/file", b"server owned");
        let driver = driver_for(&backend);
        let mut file = driver
            .open(&host(), "/zone/file", OpenFlags::READ_ONLY, 0)
            .await
            .unwrap();

        let mut buf = [0u8; 6];
        assert_eq!(driver.pread(&mut file, &mut buf, 0).await.unwrap(), 6);
        assert_eq!(&buf, b"server");
    }

    #[tokio::test]
    async fn test_open_directory_is_eisdir() {
        let backend = MemoryBackend::new();
        backend.insert_collection("/zone/dir");
        let driver = driver_for(&backend);

        assert_eq!(
            driver
                .open(&host(), "/zone/dir", OpenFlags::READ_ONLY, 0)
                .await
                .unwrap_err(),
            ErrorKind::IsADirectory
        );
        assert_eq!(
            driver
                .open(&host(), "/zone/missing", OpenFlags::READ_ONLY, 0)
                .await
                .unwrap_err(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_open_truncates() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"old content");
        let driver = driver_for(&backend);

        let flags = OpenFlags::WRITE_ONLY.with(libc::O_TRUNC);
        let file = driver.open(&host(), "/zone/file", flags, 0).await.unwrap();
        assert_eq!(backend.object_data("/zone/file").unwrap(), b"");
        driver.close(file).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_truncate_closes_descriptor() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"old content");
        backend.fail_next(Op::Truncate, RemoteCode::from_errno(libc::EACCES));
        let driver = driver_for(&backend);

        let flags = OpenFlags::WRITE_ONLY.with(libc::O_TRUNC);
        assert_eq!(
            driver.open(&host(), "/zone/file", flags, 0).await.unwrap_err(),
            ErrorKind::AccessDenied
        );
        assert_eq!(backend.count(Op::Close), 1);
        assert_eq!(backend.object_data("/zone/file").unwrap(), b"old content");
    }

    #[tokio::test]
    async fn test_exclusive_create_on_existing() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"x");
        let driver = driver_for(&backend);

        let flags = create_flags().with(libc::O_EXCL);
        assert_eq!(
            driver.open(&host(), "/zone/file", flags, 0o644).await.unwrap_err(),
            ErrorKind::AlreadyExists
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_open_waits_out_try_again() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"existing");
        let driver = driver_for(&backend);
        backend.fail_next(Op::Open, RemoteCode::from_errno(libc::EAGAIN));

        let mut file = driver.open(&host(), "/zone/file", create_flags(), 0o644).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(driver.pread(&mut file, &mut buf, 0).await.unwrap(), 8);
        assert_eq!(&buf, b"existing");
        driver.close(file).await.unwrap();

        // The busy open was retried, never turned into a create
        assert_eq!(backend.count(Op::Open), 2);
        assert_eq!(backend.count(Op::Create), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_handles_share_one_session() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/source", b"read side");
        let driver = driver_for(&backend);

        let mut reader = driver
            .open(&host(), "/zone/source", OpenFlags::READ_ONLY, 0)
            .await
            .unwrap();
        let mut writer = driver.open(&host(), "/zone/sink", create_flags(), 0o644).await.unwrap();

        let reading = tokio::spawn({
            let driver = driver.clone();
            async move {
                let mut buf = [0u8; 16];
                let n = driver.pread(&mut reader, &mut buf, 0).await.unwrap();
                driver.close(reader).await.unwrap();
                buf[..n].to_vec()
            }
        });
        let writing = tokio::spawn({
            let driver = driver.clone();
            async move {
                let n = driver.pwrite(&mut writer, b"write side", 0).await.unwrap();
                driver.close(writer).await.unwrap();
                n
            }
        });

        assert_eq!(reading.await.unwrap(), b"read side");
        assert_eq!(writing.await.unwrap(), 10);
        assert_eq!(backend.object_data("/zone/sink").unwrap(), b"write side");
        assert_eq!(backend.count(Op::Connect), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_survives_reconnect() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"abcdefghij");
        let driver = driver_for(&backend);

        let mut file = driver
            .open(&host(), "/zone/file", OpenFlags::READ_ONLY, 0)
            .await
            .unwrap();
        let opened_on = file.generation();
        let mut buf = [0u8; 4];
        driver.pread(&mut file, &mut buf, 0).await.unwrap();

        backend.sever_sessions();

        // The read hits the dead session, reconnects, reopens and seeks
        assert_eq!(driver.pread(&mut file, &mut buf, 4).await.unwrap(), 4);
        assert_eq!(&buf, b"efgh");
        assert!(file.generation() > opened_on);
        assert_eq!(file.offset(), 8);
        assert_eq!(backend.count(Op::Open), 2);
        assert_eq!(backend.count(Op::Seek), 1);

        driver.close(file).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_drops_create_and_truncate() {
        let backend = MemoryBackend::new();
        backend.insert_collection("/zone");
        let driver = driver_for(&backend);

        let flags = OpenFlags::READ_WRITE.with(libc::O_CREAT | libc::O_TRUNC);
        let mut file = driver.open(&host(), "/zone/file", flags, 0o644).await.unwrap();
        driver.pwrite(&mut file, b"persisted", 0).await.unwrap();

        driver.cache().invalidate(&host()).await;
        driver.pwrite(&mut file, b"!", 9).await.unwrap();

        // No second create and no truncation on reopen
        assert_eq!(backend.count(Op::Create), 1);
        assert_eq!(backend.count(Op::Truncate), 1);
        assert_eq!(backend.object_data("/zone/file").unwrap(), b"persisted!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_of_deleted_object_surfaces() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"data");
        let driver = driver_for(&backend);
        let mut file = driver
            .open(&host(), "/zone/file", OpenFlags::READ_ONLY, 0)
            .await
            .unwrap();

        driver.cache().invalidate(&host()).await;
        backend.fail_next(Op::Open, RemoteCode::from_errno(libc::ENOENT));

        let mut buf = [0u8; 4];
        assert_eq!(
            driver.pread(&mut file, &mut buf, 0).await.unwrap_err(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_close_after_reconnect_is_noop() {
        let backend = MemoryBackend::new();
        backend.insert_object("/zone/file", b"data");
        let driver = driver_for(&backend);
        let file = driver
            .open(&host(), "/zone/file", OpenFlags::READ_ONLY, 0)
            .await
            .unwrap();

        driver.cache().invalidate(&host()).await;
        driver.close(file).await.unwrap();
        assert_eq!(backend.count(Op::Close), 0);
    }
}
