//! Connection cache
//!
//! Keeps at most one authenticated session per host key. Acquirers of the
//! same host serialize on a per-host slot lock, so a burst of callers never
//! opens two sessions; different hosts never wait on each other.
//!
//! Every new connection gets a generation one above any handed out before.
//! Open file handles remember the generation they were opened on and reopen
//! themselves when it changes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use keel_core::{DriverConfig, ErrorKind, HostKey, SessionEnv};

use crate::backend::{RemoteBackend, Session};

/// Cache tuning
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Connections unused for this long are replaced on next acquire
    pub idle_timeout: Duration,
    /// Credential file checked before the first connect
    pub credential_path: Option<PathBuf>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

impl CacheOptions {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            credential_path: config.credential_path(),
        }
    }
}

/// One pooled, authenticated session
pub struct Connection {
    host: HostKey,
    generation: u64,
    last_used: parking_lot::Mutex<Instant>,
    session: Mutex<Box<dyn Session>>,
}

impl Connection {
    fn new(host: HostKey, generation: u64, session: Box<dyn Session>) -> Self {
        Self {
            host,
            generation,
            last_used: parking_lot::Mutex::new(Instant::now()),
            session: Mutex::new(session),
        }
    }

    pub fn host(&self) -> &HostKey {
        &self.host
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Exclusive use of the session; one request at a time per connection
    pub async fn session(&self) -> MutexGuard<'_, Box<dyn Session>> {
        self.session.lock().await
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    async fn disconnect(&self) {
        self.session.lock().await.disconnect().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("generation", &self.generation)
            .finish()
    }
}

type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

/// Process-shared pool of sessions, one per host key
pub struct ConnectionCache {
    backend: Arc<dyn RemoteBackend>,
    options: CacheOptions,
    slots: DashMap<HostKey, Slot>,
    env: OnceCell<SessionEnv>,
    credentials_checked: AtomicBool,
    /// Highest generation handed out so far
    max_generation: AtomicU64,
}

impl ConnectionCache {
    pub fn new(backend: Arc<dyn RemoteBackend>, options: CacheOptions) -> Self {
        Self {
            backend,
            options,
            slots: DashMap::new(),
            env: OnceCell::new(),
            credentials_checked: AtomicBool::new(false),
            max_generation: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn RemoteBackend> {
        &self.backend
    }

    /// The protocol environment, if it has been loaded
    pub fn environment(&self) -> Option<&SessionEnv> {
        self.env.get()
    }

    fn slot(&self, host: &HostKey) -> Slot {
        self.slots
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn existing_slot(&self, host: &HostKey) -> Option<Slot> {
        self.slots.get(host).map(|slot| slot.clone())
    }

    /// Get a live connection for `host`, connecting if needed
    pub async fn acquire(&self, host: &HostKey) -> Result<Arc<Connection>, ErrorKind> {
        if host.is_root() {
            return Err(ErrorKind::AccessDenied);
        }

        let slot = self.slot(host);
        let mut cached = slot.lock().await;

        if let Some(conn) = cached.as_ref() {
            if conn.idle_for() < self.options.idle_timeout {
                conn.touch();
                return Ok(conn.clone());
            }
            debug!(
                "connection to {} (generation {}) idle for {:?}, replacing",
                host,
                conn.generation,
                conn.idle_for()
            );
            if let Some(stale) = cached.take() {
                stale.disconnect().await;
            }
        }

        self.check_credentials().await?;
        let env = self.load_environment().await?;

        debug!("connecting to {} via {}", host, self.backend.name());
        let mut session = self.backend.connect(host, env).await.map_err(|code| {
            warn!("couldn't connect to {}: {}", host, code);
            ErrorKind::ConnectFailed
        })?;

        if let Err(code) = session.login(env).await {
            warn!("couldn't authenticate with {}: {}", host, code);
            session.disconnect().await;
            return Err(ErrorKind::ConnectionRefused);
        }

        let generation = self.max_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Arc::new(Connection::new(host.clone(), generation, session));
        info!("connected to {} (generation {})", host, generation);

        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Close and forget the connection for `host`. Idempotent.
    pub async fn invalidate(&self, host: &HostKey) {
        let Some(slot) = self.existing_slot(host) else {
            return;
        };
        let conn = slot.lock().await.take();
        drop(slot);
        self.prune(host);
        if let Some(conn) = conn {
            info!("disconnecting from {} (generation {})", host, conn.generation);
            conn.disconnect().await;
        }
    }

    /// Invalidate only if the cached connection is still `generation`
    pub async fn invalidate_generation(&self, host: &HostKey, generation: u64) {
        let Some(slot) = self.existing_slot(host) else {
            return;
        };
        let conn = {
            let mut cached = slot.lock().await;
            match cached.as_ref() {
                Some(conn) if conn.generation == generation => cached.take(),
                _ => None,
            }
        };
        if let Some(conn) = conn {
            info!("disconnecting from {} (generation {})", host, generation);
            conn.disconnect().await;
        }
    }

    /// Generation of the cached connection, without connecting
    pub async fn current_generation(&self, host: &HostKey) -> Option<u64> {
        let slot = self.existing_slot(host)?;
        let cached = slot.lock().await;
        cached.as_ref().map(|conn| conn.generation)
    }

    /// Whether a connection for `host` is cached
    pub async fn is_cached(&self, host: &HostKey) -> bool {
        self.current_generation(host).await.is_some()
    }

    /// Disconnect every cached session
    pub async fn shutdown(&self) {
        let slots: Vec<(HostKey, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (host, slot) in slots {
            let conn = slot.lock().await.take();
            drop(slot);
            self.prune(&host);
            if let Some(conn) = conn {
                info!("disconnecting from {} (generation {})", conn.host, conn.generation);
                conn.disconnect().await;
            }
        }
    }

    /// Forget the slot for `host` if it is empty and nobody is using it
    fn prune(&self, host: &HostKey) {
        self.slots.remove_if(host, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().map_or(false, |cached| cached.is_none())
        });
    }

    async fn check_credentials(&self) -> Result<(), ErrorKind> {
        if !self.backend.requires_credentials() || self.credentials_checked.load(Ordering::Acquire)
        {
            return Ok(());
        }

        let Some(path) = self.options.credential_path.as_ref() else {
            warn!("no home directory to look for credentials in; set driver.credential_file");
            return Err(ErrorKind::ConfigError);
        };

        match tokio::fs::File::open(path).await {
            Ok(_) => {
                self.credentials_checked.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!("credential file {:?} is not readable", path);
                Err(ErrorKind::PermissionDenied)
            }
            Err(e) => {
                warn!("couldn't open credential file {:?}: {}", path, e);
                Err(ErrorKind::ConfigError)
            }
        }
    }

    async fn load_environment(&self) -> Result<&SessionEnv, ErrorKind> {
        self.env
            .get_or_try_init(|| async {
                let env = self.backend.load_environment().await.map_err(|code| {
                    warn!("couldn't load {} environment: {}", self.backend.name(), code);
                    ErrorKind::ConfigError
                })?;
                debug!("loaded environment for user {} in zone {}", env.user_name, env.zone);
                Ok(env)
            })
            .await
    }
}
