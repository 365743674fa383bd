//! C1 — Container Pool: maintains N warm, probe-verified sandboxed browser
//! containers, allocates/releases them to sessions, and self-heals.

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    DeviceRequest, EndpointSettings, HostConfig, Mount, MountTypeEnum, NetworkingConfig,
    PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use anyhow::Context;
use cloudbrowser_common::Error;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const NETWORK_NAME: &str = "cloudbrowser-isolated";
const CONTAINER_STREAM_PORT: u16 = 8080;
const SHM_SIZE_BYTES: i64 = 1024 * 1024 * 1024; // 1GiB, large enough for a hardware-accelerated browser
const CONTAINER_MEMORY_BYTES: i64 = 2 * 1024 * 1024 * 1024; // 2GiB fixed bound
const CONTAINER_NANO_CPUS: u64 = 2_000_000_000; // 2 vCPU fixed bound
const PROBE_INTERVAL: Duration = Duration::from_secs(2);
const PROBE_CEILING: Duration = Duration::from_secs(120);
const STOP_GRACE: Duration = Duration::from_secs(5);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Booting,
    Warm,
    Active,
    Destroying,
}

#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub native_id: String,
    pub port: u16,
    pub status: ContainerStatus,
    pub session_id: Option<String>,
    pub created_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSnapshot {
    pub id: String,
    pub port: u16,
    pub status: ContainerStatus,
    pub session_id: Option<String>,
    pub age_secs: u64,
}

impl From<&Container> for ContainerSnapshot {
    fn from(c: &Container) -> Self {
        Self {
            id: c.id.clone(),
            port: c.port,
            status: c.status,
            session_id: c.session_id.clone(),
            age_secs: c.created_at.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub image: String,
    pub pool_size: usize,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub policy_mount: Option<(String, String)>,
    pub assets_mount: Option<(String, String)>,
    pub enable_gpu: bool,
}

struct PoolState {
    containers: HashMap<String, Container>,
    used_ports: HashSet<u16>,
    target_size: usize,
}

/// Maintains the warm container pool. All reads/writes to `state` are
/// serialized by one mutex; long-running Docker operations (create, stop,
/// remove, probe) run outside the lock and only take it again to commit
/// the resulting state transition.
pub struct ContainerPool {
    docker: Arc<Docker>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl ContainerPool {
    /// Connects to Docker, ensures the isolated network exists, removes any
    /// orphaned containers from a previous crashed run, then creates
    /// `config.pool_size` warm containers in parallel.
    pub async fn init(docker: Arc<Docker>, config: PoolConfig) -> Result<Arc<Self>, Error> {
        let pool = Arc::new(Self {
            docker,
            state: Mutex::new(PoolState {
                containers: HashMap::new(),
                used_ports: HashSet::new(),
                target_size: config.pool_size,
            }),
            config,
        });

        pool.ensure_network().await?;
        pool.reap_orphans().await?;

        let target = pool.target_size().await;
        let mut tasks = Vec::with_capacity(target);
        for _ in 0..target {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.create_warm().await }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("warm container creation task panicked: {e}");
            }
        }

        Ok(pool)
    }

    async fn ensure_network(&self) -> Result<(), Error> {
        let existing = self.docker.inspect_network::<String>(NETWORK_NAME, None).await;
        if existing.is_ok() {
            return Ok(());
        }

        let mut options = HashMap::new();
        // Blocks container-to-container traffic; outbound to the internet stays open.
        options.insert("com.docker.network.bridge.enable_icc".to_string(), "false".to_string());

        self.docker
            .create_network(CreateNetworkOptions {
                name: NETWORK_NAME,
                driver: "bridge",
                options,
                ..Default::default()
            })
            .await?;

        info!("created isolated network {NETWORK_NAME}");
        Ok(())
    }

    /// Crash-recovery: destroy any containers left over from a previous
    /// process whose name matches our naming pattern (`session-<8hex>`).
    async fn reap_orphans(&self) -> Result<(), Error> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec!["session-".to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        for c in containers {
            if let Some(id) = c.id {
                warn!("reaping orphaned container {id} from a previous run");
                let _ = self
                    .docker
                    .remove_container(
                        &id,
                        Some(RemoveContainerOptions { force: true, ..Default::default() }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn target_size(&self) -> usize {
        self.state.lock().await.target_size
    }

    pub async fn pool_size(&self) -> usize {
        self.target_size().await
    }

    /// `setPoolSize`: updates the mutable shared target. The health loop
    /// grows the pool on its next tick; shrinking is passive.
    pub async fn set_pool_size(&self, n: usize) {
        self.state.lock().await.target_size = n;
    }

    fn lowest_free_port(used: &HashSet<u16>, start: u16, end: u16) -> Option<u16> {
        (start..=end).find(|p| !used.contains(p))
    }

    /// Creates one warm container: allocates a port, builds and starts the
    /// container, marks it `booting`, then probes its streaming endpoint in
    /// the background until it responds or the ceiling elapses.
    #[instrument(skip(self))]
    async fn create_warm(self: &Arc<Self>) {
        let port = {
            let mut state = self.state.lock().await;
            match Self::lowest_free_port(
                &state.used_ports,
                self.config.port_range_start,
                self.config.port_range_end,
            ) {
                Some(p) => {
                    state.used_ports.insert(p);
                    p
                }
                None => {
                    error!("port range exhausted, cannot create warm container");
                    return;
                }
            }
        };

        match self.create_and_start(port).await {
            Ok((native_id, id)) => {
                let container = Container {
                    id: id.clone(),
                    native_id,
                    port,
                    status: ContainerStatus::Booting,
                    session_id: None,
                    created_at: Instant::now(),
                };
                self.state.lock().await.containers.insert(id.clone(), container);
                let pool = self.clone();
                tokio::spawn(async move { pool.probe_until_warm(id, port).await });
            }
            Err(e) => {
                error!("failed to create container: {e}");
                self.state.lock().await.used_ports.remove(&port);
            }
        }
    }

    async fn create_and_start(&self, port: u16) -> Result<(String, String), Error> {
        let id = Uuid::new_v4();
        let name = format!("session-{:08x}", id.as_fields().0);

        let pull_stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        let _: Vec<_> = pull_stream.collect().await;

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            format!("{CONTAINER_STREAM_PORT}/tcp"),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.to_string()),
            }]),
        );

        let mut mounts = Vec::new();
        if let Some((src, dst)) = &self.config.policy_mount {
            mounts.push(Mount {
                source: Some(src.clone()),
                target: Some(dst.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            });
        }
        if let Some((src, dst)) = &self.config.assets_mount {
            mounts.push(Mount {
                source: Some(src.clone()),
                target: Some(dst.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,size=64m".to_string());

        let device_requests = if self.config.enable_gpu {
            Some(vec![DeviceRequest {
                count: Some(1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }])
        } else {
            None
        };

        let mut endpoints_config = HashMap::new();
        endpoints_config.insert(NETWORK_NAME.to_string(), EndpointSettings::default());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            tmpfs: Some(tmpfs),
            shm_size: Some(SHM_SIZE_BYTES),
            memory: Some(CONTAINER_MEMORY_BYTES),
            nano_cpus: Some(CONTAINER_NANO_CPUS as i64),
            cap_drop: Some(vec!["ALL".to_string()]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                ..Default::default()
            }),
            device_requests,
            network_mode: Some(NETWORK_NAME.to_string()),
            ..Default::default()
        };

        let env = vec![
            format!("STREAM_PORT={CONTAINER_STREAM_PORT}"),
            format!("SESSION_CONTAINER_ID={id}"),
        ];

        let config = ContainerConfig {
            image: Some(self.config.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig { endpoints_config: Some(endpoints_config) }),
            exposed_ports: Some(HashMap::from([(
                format!("{CONTAINER_STREAM_PORT}/tcp"),
                HashMap::new(),
            )])),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), config)
            .await?;

        self.docker.start_container::<String>(&created.id, None).await?;

        debug!("started container {name} ({}) on port {port}", created.id);
        Ok((created.id, id.to_string()))
    }

    async fn probe_until_warm(self: Arc<Self>, id: String, port: u16) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap_or_default();
        let url = format!("http://127.0.0.1:{port}/");
        let start = Instant::now();

        while start.elapsed() < PROBE_CEILING {
            if client.get(&url).send().await.is_ok() {
                let mut state = self.state.lock().await;
                if let Some(c) = state.containers.get_mut(&id) {
                    if c.status == ContainerStatus::Booting {
                        c.status = ContainerStatus::Warm;
                        info!("container {id} is warm on port {port}");
                    }
                }
                return;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        warn!("container {id} did not become warm within {PROBE_CEILING:?}");
    }

    /// `acquire`: first `warm` entry, flipped atomically to `active`.
    pub async fn acquire(&self, session_id: &str) -> Option<ContainerSnapshot> {
        let mut state = self.state.lock().await;
        let id = state
            .containers
            .values()
            .find(|c| c.status == ContainerStatus::Warm)
            .map(|c| c.id.clone())?;

        let c = state.containers.get_mut(&id)?;
        c.status = ContainerStatus::Active;
        c.session_id = Some(session_id.to_string());
        Some(ContainerSnapshot::from(&*c))
    }

    /// `release`: idempotent. Marks `destroying`, frees the port, removes
    /// from the registry, then asynchronously stops/removes the container
    /// and kicks off a replacement — all outside the lock.
    pub async fn release(self: &Arc<Self>, id: &str) {
        let (native_id, port) = {
            let mut state = self.state.lock().await;
            let Some(c) = state.containers.get_mut(id) else {
                return; // already released
            };
            if c.status == ContainerStatus::Destroying {
                return;
            }
            c.status = ContainerStatus::Destroying;
            let native_id = c.native_id.clone();
            let port = c.port;
            state.containers.remove(id);
            state.used_ports.remove(&port);
            (native_id, port)
        };

        let docker = self.docker.clone();
        tokio::spawn(async move {
            let _ = docker
                .stop_container(&native_id, Some(StopContainerOptions { t: STOP_GRACE.as_secs() as i64 }))
                .await;
            let _ = docker
                .remove_container(&native_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await;
            debug!("destroyed container {native_id} (freed port {port})");
        });

        let pool = self.clone();
        tokio::spawn(async move { pool.create_warm().await });
    }

    /// `launchApp`: fire-and-forget exec of the in-container launch script
    /// with the normalized URL. Failure is logged only — it never fails
    /// the session.
    pub async fn launch_app(&self, id: &str, url: &str) {
        let native_id = {
            let state = self.state.lock().await;
            match state.containers.get(id) {
                Some(c) => c.native_id.clone(),
                None => return,
            }
        };

        let docker = self.docker.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = Self::exec_launch_app(&docker, &native_id, &url).await {
                warn!("launch-app exec failed for {native_id}: {e:#}");
            }
        });
    }

    /// Not request-facing — the caller only ever sees a log line on
    /// failure, so this collapses bollard's two distinct error points
    /// into one `anyhow::Result` instead of threading the crate's public
    /// `Error` type through a path nothing downstream ever inspects.
    async fn exec_launch_app(docker: &Docker, native_id: &str, url: &str) -> anyhow::Result<()> {
        use bollard::exec::CreateExecOptions;

        let exec = docker
            .create_exec(
                native_id,
                CreateExecOptions {
                    cmd: Some(vec!["/usr/local/bin/launch-app".to_string(), url.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("creating launch-app exec")?;

        docker.start_exec(&exec.id, None).await.context("starting launch-app exec")?;
        Ok(())
    }

    pub async fn status(&self) -> Vec<ContainerSnapshot> {
        self.state
            .lock()
            .await
            .containers
            .values()
            .map(ContainerSnapshot::from)
            .collect()
    }

    pub async fn warm_count(&self) -> usize {
        self.state
            .lock()
            .await
            .containers
            .values()
            .filter(|c| c.status == ContainerStatus::Warm)
            .count()
    }

    /// Health loop: every 5s, inspects every non-`destroying` container;
    /// removes and replaces any that is no longer running. Afterward, tops
    /// the pool back up to the current target if short.
    pub async fn run_health_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HEALTH_INTERVAL);
        loop {
            interval.tick().await;
            self.health_sweep().await;
        }
    }

    async fn health_sweep(self: &Arc<Self>) {
        let candidates: Vec<(String, String)> = {
            let state = self.state.lock().await;
            state
                .containers
                .values()
                .filter(|c| c.status != ContainerStatus::Destroying)
                .map(|c| (c.id.clone(), c.native_id.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, native_id) in candidates {
            let running = match self.docker.inspect_container(&native_id, None).await {
                Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
                Err(_) => false,
            };
            if !running {
                dead.push((id, native_id));
            }
        }

        for (id, native_id) in dead {
            warn!("health check found dead container {id}, recycling");
            let port = {
                let mut state = self.state.lock().await;
                let port = state.containers.get(&id).map(|c| c.port);
                state.containers.remove(&id);
                port
            };
            if let Some(port) = port {
                self.state.lock().await.used_ports.remove(&port);
            }
            let docker = self.docker.clone();
            tokio::spawn(async move {
                let _ = docker
                    .remove_container(&native_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                    .await;
            });
        }

        let shortfall = {
            let state = self.state.lock().await;
            state.target_size.saturating_sub(state.containers.len())
        };
        for _ in 0..shortfall {
            let pool = self.clone();
            tokio::spawn(async move { pool.create_warm().await });
        }
    }

    /// `restart`: destroys only `warm` containers (never `active`), then
    /// re-creates up to the current target size.
    pub async fn restart(self: &Arc<Self>) {
        let (warm_ids, target): (Vec<(String, String, u16)>, usize) = {
            let state = self.state.lock().await;
            let warm = state
                .containers
                .values()
                .filter(|c| c.status == ContainerStatus::Warm)
                .map(|c| (c.id.clone(), c.native_id.clone(), c.port))
                .collect();
            (warm, state.target_size)
        };

        for (id, native_id, port) in warm_ids {
            {
                let mut state = self.state.lock().await;
                state.containers.remove(&id);
                state.used_ports.remove(&port);
            }
            let docker = self.docker.clone();
            tokio::spawn(async move {
                let _ = docker
                    .remove_container(&native_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                    .await;
            });
        }

        let current = self.state.lock().await.containers.len();
        for _ in current..target {
            let pool = self.clone();
            tokio::spawn(async move { pool.create_warm().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_port_skips_used() {
        let mut used = HashSet::new();
        used.insert(4000);
        used.insert(4001);
        assert_eq!(ContainerPool::lowest_free_port(&used, 4000, 4100), Some(4002));
    }

    #[test]
    fn lowest_free_port_exhausted_returns_none() {
        let used: HashSet<u16> = (4000..=4002).collect();
        assert_eq!(ContainerPool::lowest_free_port(&used, 4000, 4002), None);
    }
}
