//! The remote storage driver
//!
//! [`RemoteDriver`] is the surface a filesystem front end talks to. Path
//! operations live in `path_ops`, open-file operations in `handle_ops` and
//! whole-file copies in `transfer`; all of them run through the same
//! [`RetryEngine`] over an injected [`ConnectionCache`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_core::{DriverConfig, HostKey};

use crate::backend::RemoteBackend;
use crate::connection_cache::{CacheOptions, ConnectionCache};
use crate::retry::{RetryEngine, RetryPolicy};

/// Remote storage driver
#[derive(Clone)]
pub struct RemoteDriver {
    pub(crate) engine: RetryEngine,
    default_port: u16,
    pub(crate) chunk_size: usize,
}

impl RemoteDriver {
    /// Driver over a fresh connection cache for `backend`
    pub fn new(backend: Arc<dyn RemoteBackend>, config: &DriverConfig) -> Self {
        let cache = ConnectionCache::new(backend, CacheOptions::from_config(config));
        Self::with_cache(Arc::new(cache), config)
    }

    /// Driver sharing an existing cache
    pub fn with_cache(cache: Arc<ConnectionCache>, config: &DriverConfig) -> Self {
        Self {
            engine: RetryEngine::new(cache, RetryPolicy::from_config(config)),
            default_port: config.default_port,
            chunk_size: config.transfer_chunk_bytes.max(1),
        }
    }

    /// A driver whose calls are also stopped by `token`
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            engine: self.engine.with_cancellation(token),
            default_port: self.default_port,
            chunk_size: self.chunk_size,
        }
    }

    /// Host key for `host`, adding the configured default port
    pub fn host_key(&self, host: &str) -> HostKey {
        HostKey::new(host, self.default_port)
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        self.engine.cache()
    }

    pub fn engine(&self) -> &RetryEngine {
        &self.engine
    }

    /// Child token for scoping a group of calls (see [`with_cancellation`](Self::with_cancellation))
    pub fn child_token(&self) -> CancellationToken {
        self.engine.cancel_token().child_token()
    }

    /// Stop all in-flight calls
    pub fn cancel(&self) {
        self.engine.cancel();
    }

    /// Disconnect every cached session
    pub async fn shutdown(&self) {
        self.engine.cache().shutdown().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::memory::MemoryBackend;

    pub fn host() -> HostKey {
        HostKey::new("data.example.org", keel_core::DEFAULT_PORT)
    }

    pub fn driver_for(backend: &MemoryBackend) -> RemoteDriver {
        RemoteDriver::new(Arc::new(backend.clone()), &DriverConfig::default())
    }
}
