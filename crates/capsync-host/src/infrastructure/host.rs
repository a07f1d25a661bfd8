//! Runtime wiring: builds every component from a [`HostConfig`] and runs the
//! background loops.
//!
//! [`CaptureHost::start`] binds the listener and spawns:
//!
//! - the accept loop,
//! - the heartbeat sweep,
//! - the sensor-staleness sweep,
//! - the adaptive-load tick,
//! - the expired-token purge (only when tokens are required),
//!
//! all driven by one [`ShutdownSignal`].  It also starts the UDP discovery
//! responder when enabled.  [`CaptureHost::shutdown`] reverses all of it and
//! may be called any number of times.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::adaptive_load::{AdaptiveLoadManager, MetricsSource};
use crate::application::events::EventBus;
use crate::application::orchestrate_session::{SessionOrchestrator, SessionState};
use crate::infrastructure::integrity::Sha256Verifier;
use crate::infrastructure::metrics::SysinfoMetrics;
use crate::infrastructure::network::{
    ConnectionRegistry, PlainChannel, RegistryError, SecureChannel, ServiceAdvertiser, TokenStore,
    TokenValidator, UdpDiscoveryAdvertiser,
};
use crate::infrastructure::shutdown::{spawn_periodic, ShutdownSignal};
use crate::infrastructure::storage::config::HostConfig;
use crate::sync::lock;

const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct CaptureHost {
    config: HostConfig,
    local_addr: SocketAddr,
    events: Arc<EventBus>,
    registry: Arc<ConnectionRegistry>,
    orchestrator: Arc<SessionOrchestrator>,
    load: Arc<AdaptiveLoadManager>,
    tokens: Option<Arc<TokenStore>>,
    shutdown: ShutdownSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    advertiser: Mutex<Option<UdpDiscoveryAdvertiser>>,
}

impl CaptureHost {
    /// Starts a host with `sysinfo` metrics and unencrypted sockets.
    ///
    /// # Errors
    ///
    /// Fails if the listening socket cannot be bound.
    pub async fn start(config: HostConfig) -> anyhow::Result<Self> {
        Self::start_with(config, Box::new(SysinfoMetrics::new()), Arc::new(PlainChannel)).await
    }

    /// Starts a host with the given metrics source and channel wrapper.
    ///
    /// # Errors
    ///
    /// Fails if the listening socket cannot be bound.
    pub async fn start_with(
        config: HostConfig,
        metrics: Box<dyn MetricsSource>,
        secure: Arc<dyn SecureChannel>,
    ) -> anyhow::Result<Self> {
        let events = Arc::new(EventBus::new());

        let session_state = Arc::new(SessionState::new(
            config.session.to_session_config(),
            Arc::clone(&events),
            Arc::new(Sha256Verifier),
        ));

        let tokens = config
            .security
            .require_token
            .then(|| Arc::new(TokenStore::new(config.security.token_ttl())));
        let validator = tokens
            .clone()
            .map(|store| store as Arc<dyn TokenValidator>);

        let registry = ConnectionRegistry::new(
            config.registry.to_registry_config(),
            Arc::clone(&events),
            session_state.clone(),
            validator,
        );

        let load = Arc::new(AdaptiveLoadManager::new(
            config.adaptive.to_adaptive_config(),
            Arc::clone(&events),
        ));
        session_state.set_frame_gate(load.clone());

        let orchestrator = Arc::new(SessionOrchestrator::new(session_state, registry.clone()));

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RegistryError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .with_context(|| format!("reading local address of {addr}"))?;

        let shutdown = ShutdownSignal::new();
        let mut tasks = Vec::new();

        // ── Accept loop ───────────────────────────────────────────────────────
        {
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                registry.serve(listener, secure, shutdown).await;
            }));
        }

        // ── Heartbeat sweep ───────────────────────────────────────────────────
        {
            let registry = Arc::clone(&registry);
            let period = registry.config().heartbeat_interval;
            tasks.push(spawn_periodic("heartbeat-sweep", period, shutdown.clone(), move || {
                let registry = Arc::clone(&registry);
                async move {
                    registry.sweep_heartbeats().await;
                }
            }));
        }

        // ── Sensor staleness sweep ────────────────────────────────────────────
        {
            let orchestrator = Arc::clone(&orchestrator);
            let period = config.session.stale_sweep();
            tasks.push(spawn_periodic("stale-sweep", period, shutdown.clone(), move || {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    orchestrator.sweep_stale(Instant::now());
                }
            }));
        }

        // ── Adaptive load tick ────────────────────────────────────────────────
        {
            let load = Arc::clone(&load);
            let registry = Arc::clone(&registry);
            let metrics = Arc::new(tokio::sync::Mutex::new(metrics));
            let period = config.adaptive.tick();
            tasks.push(spawn_periodic("adaptive-tick", period, shutdown.clone(), move || {
                let load = Arc::clone(&load);
                let registry = Arc::clone(&registry);
                let metrics = Arc::clone(&metrics);
                async move {
                    let mut source = metrics.lock().await;
                    load.tick(&mut **source, &*registry, &*registry).await;
                }
            }));
        }

        // ── Token purge ───────────────────────────────────────────────────────
        if let Some(store) = &tokens {
            let store = Arc::clone(store);
            tasks.push(spawn_periodic("token-purge", TOKEN_PURGE_INTERVAL, shutdown.clone(), move || {
                let store = Arc::clone(&store);
                async move {
                    store.purge_expired();
                }
            }));
        }

        // ── Discovery ─────────────────────────────────────────────────────────
        let advertiser = if config.discovery.enabled {
            start_discovery(&config, local_addr.port())
        } else {
            None
        };

        info!("capture host listening on {local_addr}");
        Ok(Self {
            config,
            local_addr,
            events,
            registry,
            orchestrator,
            load,
            tokens,
            shutdown,
            tasks: Mutex::new(tasks),
            advertiser: Mutex::new(advertiser),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    pub fn load_manager(&self) -> &Arc<AdaptiveLoadManager> {
        &self.load
    }

    /// The token store, present only when tokens are required.
    pub fn tokens(&self) -> Option<&Arc<TokenStore>> {
        self.tokens.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Stops advertising, stops every background loop, disconnects every
    /// device, and waits (bounded) for the tasks to finish.
    pub async fn shutdown(&self) {
        if self.shutdown.trigger() {
            info!("capture host shutting down");
        } else {
            debug!("capture host shutdown already requested");
        }

        let advertiser = lock(&self.advertiser).take();
        if let Some(mut advertiser) = advertiser {
            // Joining the responder thread blocks for up to one read timeout.
            let stopped = tokio::task::spawn_blocking(move || advertiser.unregister()).await;
            if stopped.is_err() {
                warn!("discovery responder did not stop cleanly");
            }
        }

        let grace = self.config.shutdown_grace();
        self.registry.shutdown(grace).await;

        let handles = std::mem::take(&mut *lock(&self.tasks));
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("background task did not stop within {grace:?}; aborting it");
                handle.abort();
            }
        }
        info!("capture host stopped");
    }
}

fn start_discovery(config: &HostConfig, tcp_port: u16) -> Option<UdpDiscoveryAdvertiser> {
    let addr = config.discovery_addr();
    let bind: SocketAddr = match addr.parse() {
        Ok(bind) => bind,
        Err(e) => {
            warn!("invalid discovery address {addr}: {e}");
            return None;
        }
    };
    let mut advertiser = UdpDiscoveryAdvertiser::new(bind);
    match advertiser.register(&config.discovery.service_name, tcp_port) {
        Ok(()) => Some(advertiser),
        Err(e) => {
            warn!("failed to start discovery responder: {e}");
            None
        }
    }
}
