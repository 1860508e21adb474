//! Connection tunnel manager.
//!
//! Hardware backends sit behind an isolated network. A [`TunnelProvider`]
//! makes the hardware endpoint reachable from compute nodes and hands back a
//! [`TunnelHandle`] with the address jobs should use. [`TunnelManager`] shares
//! live tunnels between concurrent requests so that one endpoint never gets
//! two forwarding jobs, and hands out [`TunnelLease`]s that give their
//! reference back when dropped.

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use qmio_sched::{
    CommandLine, JobId, JobScript, JobState, JobSubmitter, ResourceRequest, translate,
};
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};

/// A `tcp://host:port` network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RuntimeError::Config(format!("Invalid endpoint '{s}', expected tcp://host:port"));
        let rest = s.trim().strip_prefix("tcp://").ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

/// An open route to a hardware endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    /// Scheduler job holding the route open, if any.
    pub job_id: Option<JobId>,
    /// Port on the forwarding node.
    pub local_port: u16,
    /// Hardware-side endpoint.
    pub remote: Endpoint,
    /// Address jobs connect to.
    pub address: String,
    /// Whether the route was up when last checked.
    pub alive: bool,
}

/// A mechanism that makes a hardware endpoint reachable.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a route to `endpoint`.
    async fn open(&self, endpoint: &Endpoint) -> RuntimeResult<TunnelHandle>;

    /// Check whether the route is still up.
    async fn is_alive(&self, handle: &TunnelHandle) -> bool;

    /// Tear the route down.
    async fn close(&self, handle: &TunnelHandle) -> RuntimeResult<()>;

    /// Tear down anything still held, including routes whose opening was
    /// abandoned.
    async fn shutdown(&self) {}
}

/// Check that `address` (`tcp://host:port`) accepts TCP connections within
/// `limit`.
pub async fn verify_reachable(address: &str, limit: Duration) -> RuntimeResult<()> {
    let endpoint: Endpoint = address.parse()?;
    let start = Instant::now();
    match timeout(limit, TcpStream::connect((endpoint.host.as_str(), endpoint.port))).await {
        Ok(Ok(_)) => {
            debug!(%address, elapsed = ?start.elapsed(), "Connection verified");
            Ok(())
        }
        Ok(Err(e)) => Err(RuntimeError::TunnelUnavailable(format!(
            "{address} is not reachable: {e}"
        ))),
        Err(_) => Err(RuntimeError::TunnelUnavailable(format!(
            "{address} did not accept a connection within {limit:?}"
        ))),
    }
}


/// Endpoints that are directly routable; no scheduler job is involved.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTunnel;

#[async_trait]
impl TunnelProvider for DirectTunnel {
    async fn open(&self, endpoint: &Endpoint) -> RuntimeResult<TunnelHandle> {
        Ok(TunnelHandle {
            job_id: None,
            local_port: endpoint.port,
            remote: endpoint.clone(),
            address: endpoint.to_string(),
            alive: true,
        })
    }

    async fn is_alive(&self, _handle: &TunnelHandle) -> bool {
        true
    }

    async fn close(&self, _handle: &TunnelHandle) -> RuntimeResult<()> {
        Ok(())
    }
}

/// Settings of [`SchedulerTunnel`].
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSettings {
    /// Script run by the tunnel job: `<forwarder> <port> <endpoint> <hold_secs>`.
    pub forwarder: PathBuf,
    /// Partition of the tunnel job.
    pub partition: String,
    /// Tunnel job time limit.
    pub time_limit: Duration,
    /// Time subtracted from the limit to get the hold time.
    pub setup_overhead: Duration,
    /// Maximum wait for the tunnel job to start.
    pub start_timeout: Duration,
    /// Delay between start checks.
    pub poll_interval: Duration,
    /// Local ports handed out, inclusive.
    pub ports: (u16, u16),
    /// Account the tunnel job is billed to.
    pub account: Option<String>,
    /// Reservation for the tunnel job.
    pub reservation: Option<String>,
    /// Directory for tunnel job logs.
    pub log_dir: PathBuf,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            forwarder: PathBuf::from("/mnt/Q_SWAP/qmio/slurm_scripts/qpu.sh"),
            partition: "qpu".to_string(),
            time_limit: Duration::from_secs(600),
            setup_overhead: Duration::from_secs(30),
            start_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            ports: (600, 699),
            account: None,
            reservation: None,
            log_dir: PathBuf::from("."),
        }
    }
}

/// Ports in use and the tunnel jobs holding them.
#[derive(Debug, Default)]
struct Reservations {
    ports: FxHashSet<u16>,
    jobs: FxHashMap<JobId, u16>,
}

impl Reservations {
    fn forget(&mut self, port: u16, job: Option<&JobId>) {
        self.ports.remove(&port);
        if let Some(id) = job {
            self.jobs.remove(id);
        }
    }
}

fn lock(reservations: &StdMutex<Reservations>) -> MutexGuard<'_, Reservations> {
    reservations.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A tunnel between port reservation and a running job. Dropping it while
/// armed frees the port and cancels the job in the background.
struct PendingTunnel {
    submitter: JobSubmitter,
    reservations: Arc<StdMutex<Reservations>>,
    port: u16,
    job: Option<JobId>,
    armed: bool,
}

impl PendingTunnel {
    fn new(submitter: JobSubmitter, reservations: Arc<StdMutex<Reservations>>, port: u16) -> Self {
        Self {
            submitter,
            reservations,
            port,
            job: None,
            armed: true,
        }
    }

    fn submitted(&mut self, id: JobId) {
        lock(&self.reservations).jobs.insert(id.clone(), self.port);
        self.job = Some(id);
    }

    /// The tunnel is usable; its reservation now belongs to the handle.
    fn complete(mut self) {
        self.armed = false;
    }

    /// Cancel the job and free the port before returning.
    async fn abandon(mut self) {
        self.armed = false;
        let job = self.job.take();
        lock(&self.reservations).forget(self.port, job.as_ref());
        if let Some(id) = job {
            if let Err(e) = self.submitter.cancel(&id).await {
                warn!(job_id = %id, error = %e, "Failed to cancel tunnel job");
            }
        }
    }
}

impl Drop for PendingTunnel {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let job = self.job.take();
        lock(&self.reservations).forget(self.port, job.as_ref());
        let Some(id) = job else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let submitter = self.submitter.clone();
                runtime.spawn(async move {
                    match submitter.cancel(&id).await {
                        Ok(()) => info!(job_id = %id, "Cancelled abandoned tunnel job"),
                        Err(e) => {
                            warn!(job_id = %id, error = %e, "Failed to cancel abandoned tunnel job")
                        }
                    }
                });
            }
            Err(_) => warn!(job_id = %id, "Tunnel job abandoned outside a runtime, left running"),
        }
    }
}

/// Holds a route open with a scheduler job that installs a forwarding rule
/// and sleeps until its time limit.
pub struct SchedulerTunnel {
    submitter: JobSubmitter,
    settings: TunnelSettings,
    reservations: Arc<StdMutex<Reservations>>,
}

impl SchedulerTunnel {
    /// Create a provider submitting through `submitter`.
    pub fn new(submitter: JobSubmitter, settings: TunnelSettings) -> Self {
        Self {
            submitter,
            settings,
            reservations: Arc::new(StdMutex::new(Reservations::default())),
        }
    }

    fn reserve_port(&self) -> RuntimeResult<u16> {
        let (min, max) = self.settings.ports;
        let mut reservations = lock(&self.reservations);
        let free: Vec<u16> = (min..=max)
            .filter(|p| !reservations.ports.contains(p))
            .collect();
        if free.is_empty() {
            return Err(RuntimeError::TunnelUnavailable(format!(
                "no free port in {min}-{max}"
            )));
        }
        let port = free[rand::thread_rng().gen_range(0..free.len())];
        reservations.ports.insert(port);
        Ok(port)
    }

    #[cfg(test)]
    fn reserved_ports(&self) -> usize {
        lock(&self.reservations).ports.len()
    }

    fn script(&self, port: u16, endpoint: &Endpoint) -> JobScript {
        let hold = self
            .settings
            .time_limit
            .saturating_sub(self.settings.setup_overhead)
            .max(Duration::from_secs(1));

        let mut resources =
            ResourceRequest::new(self.settings.partition.clone(), self.settings.time_limit);
        resources.account = self.settings.account.clone();
        resources.reservation = self.settings.reservation.clone();

        JobScript::new(
            format!("qmio-tunnel-{port}"),
            "tunnel",
            resources,
            CommandLine::new(
                self.settings.forwarder.clone(),
                vec![
                    port.to_string(),
                    endpoint.to_string(),
                    hold.as_secs().to_string(),
                ],
            ),
        )
        .with_log_dir(self.settings.log_dir.clone())
    }

    /// Wait for the tunnel job to run; returns the node it runs on.
    async fn wait_running(&self, id: &JobId) -> RuntimeResult<String> {
        let start = Instant::now();
        loop {
            let status = self.submitter.query(id).await?;
            match translate(&status) {
                JobState::Running => {
                    return status.node.ok_or_else(|| {
                        RuntimeError::TunnelUnavailable(format!(
                            "tunnel job {id} reports no node"
                        ))
                    });
                }
                JobState::Pending => {}
                other => {
                    return Err(RuntimeError::TunnelUnavailable(format!(
                        "tunnel job {id} ended before it was usable: {other}"
                    )));
                }
            }

            if start.elapsed() >= self.settings.start_timeout {
                return Err(RuntimeError::TunnelUnavailable(format!(
                    "tunnel job {id} did not start within {:?}",
                    self.settings.start_timeout
                )));
            }
            sleep(self.settings.poll_interval).await;
        }
    }
}

#[async_trait]
impl TunnelProvider for SchedulerTunnel {
    async fn open(&self, endpoint: &Endpoint) -> RuntimeResult<TunnelHandle> {
        let port = self.reserve_port()?;
        let mut pending =
            PendingTunnel::new(self.submitter.clone(), self.reservations.clone(), port);
        let script = self.script(port, endpoint);

        let job = match self.submitter.submit(&script).await {
            Ok(job) => job,
            Err(e) => {
                pending.abandon().await;
                return Err(RuntimeError::TunnelUnavailable(format!(
                    "tunnel job submission failed: {e}"
                )));
            }
        };
        pending.submitted(job.id.clone());
        debug!(job_id = %job.id, port, "Tunnel job submitted, waiting for it to start");

        match self.wait_running(&job.id).await {
            Ok(node) => {
                pending.complete();
                let address = format!("tcp://{node}:{port}");
                info!(job_id = %job.id, %address, remote = %endpoint, "Tunnel open");
                Ok(TunnelHandle {
                    job_id: Some(job.id),
                    local_port: port,
                    remote: endpoint.clone(),
                    address,
                    alive: true,
                })
            }
            Err(e) => {
                pending.abandon().await;
                Err(match e {
                    RuntimeError::TunnelUnavailable(_) => e,
                    other => RuntimeError::TunnelUnavailable(other.to_string()),
                })
            }
        }
    }

    async fn is_alive(&self, handle: &TunnelHandle) -> bool {
        let Some(ref id) = handle.job_id else {
            return false;
        };
        match self.submitter.poll(id).await {
            Ok(JobState::Running) => true,
            Ok(state) => {
                debug!(job_id = %id, %state, "Tunnel job no longer running");
                false
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Could not check tunnel job");
                false
            }
        }
    }

    async fn close(&self, handle: &TunnelHandle) -> RuntimeResult<()> {
        lock(&self.reservations).forget(handle.local_port, handle.job_id.as_ref());
        if let Some(ref id) = handle.job_id {
            self.submitter.cancel(id).await?;
            info!(job_id = %id, "Tunnel closed");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let jobs: Vec<JobId> = {
            let mut reservations = lock(&self.reservations);
            reservations.ports.clear();
            reservations.jobs.drain().map(|(id, _)| id).collect()
        };
        for id in jobs {
            match self.submitter.cancel(&id).await {
                Ok(()) => info!(job_id = %id, "Tunnel closed on shutdown"),
                Err(e) => warn!(job_id = %id, error = %e, "Failed to cancel tunnel job"),
            }
        }
    }
}

struct Entry {
    handle: Arc<TunnelHandle>,
    refs: usize,
    generation: u64,
}

/// Per-endpoint state. Its lock is held across `open`, so concurrent
/// acquires for one endpoint provision at most one tunnel while other
/// endpoints proceed.
#[derive(Default)]
struct Slot {
    entry: Option<Entry>,
}

struct Shared {
    provider: Arc<dyn TunnelProvider>,
    slots: Mutex<FxHashMap<Endpoint, Arc<Mutex<Slot>>>>,
    generations: AtomicU64,
    open: AtomicUsize,
}

/// Shares tunnels between requests, keyed by endpoint. Cloning is cheap and
/// clones share the same tunnels.
#[derive(Clone)]
pub struct TunnelManager {
    shared: Arc<Shared>,
}

impl TunnelManager {
    /// Create a manager over `provider`.
    pub fn new(provider: Arc<dyn TunnelProvider>) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                slots: Mutex::new(FxHashMap::default()),
                generations: AtomicU64::new(0),
                open: AtomicUsize::new(0),
            }),
        }
    }

    async fn slot(&self, endpoint: &Endpoint) -> Arc<Mutex<Slot>> {
        let mut slots = self.shared.slots.lock().await;
        slots.entry(endpoint.clone()).or_default().clone()
    }

    /// Get a live tunnel to `endpoint`, opening one if needed.
    ///
    /// The reference is given back by [`TunnelLease::release`] or when the
    /// lease is dropped.
    pub async fn acquire(&self, endpoint: &Endpoint) -> RuntimeResult<TunnelLease> {
        let provider = &self.shared.provider;
        let slot = self.slot(endpoint).await;
        let mut slot = slot.lock().await;

        if let Some(entry) = slot.entry.as_mut() {
            if provider.is_alive(&entry.handle).await {
                entry.refs += 1;
                debug!(%endpoint, refs = entry.refs, "Reusing tunnel");
                return Ok(self.lease(endpoint, entry));
            }
            warn!(%endpoint, "Tunnel died, provisioning a new one");
            if let Some(dead) = slot.entry.take() {
                self.shared.open.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = provider.close(&dead.handle).await {
                    debug!(error = %e, "Closing dead tunnel failed");
                }
            }
        }

        let handle = Arc::new(provider.open(endpoint).await?);
        let generation = self.shared.generations.fetch_add(1, Ordering::SeqCst);
        self.shared.open.fetch_add(1, Ordering::SeqCst);
        let entry = slot.entry.insert(Entry {
            handle,
            refs: 1,
            generation,
        });
        Ok(self.lease(endpoint, entry))
    }

    fn lease(&self, endpoint: &Endpoint, entry: &Entry) -> TunnelLease {
        TunnelLease {
            manager: self.clone(),
            endpoint: endpoint.clone(),
            generation: entry.generation,
            handle: entry.handle.clone(),
            released: false,
        }
    }

    /// Drop one reference, closing the tunnel at zero. References to a tunnel
    /// that has since been replaced are ignored.
    async fn release(&self, endpoint: &Endpoint, generation: u64) {
        let slot = {
            let slots = self.shared.slots.lock().await;
            match slots.get(endpoint) {
                Some(slot) => slot.clone(),
                None => return,
            }
        };
        let mut slot = slot.lock().await;
        let Some(entry) = slot.entry.as_mut() else {
            return;
        };
        if entry.generation != generation {
            debug!(%endpoint, "Released a tunnel that was already replaced");
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        if let Some(entry) = slot.entry.take() {
            self.shared.open.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = self.shared.provider.close(&entry.handle).await {
                warn!(%endpoint, error = %e, "Failed to close tunnel");
            }
        }
    }

    /// Number of open tunnels.
    pub fn open_count(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Close every tunnel regardless of references, then let the provider
    /// clean up whatever it still holds.
    pub async fn close_all(&self) {
        let slots: Vec<(Endpoint, Arc<Mutex<Slot>>)> = self
            .shared
            .slots
            .lock()
            .await
            .iter()
            .map(|(endpoint, slot)| (endpoint.clone(), slot.clone()))
            .collect();

        for (endpoint, slot) in slots {
            let entry = slot.lock().await.entry.take();
            if let Some(entry) = entry {
                self.shared.open.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = self.shared.provider.close(&entry.handle).await {
                    warn!(%endpoint, error = %e, "Failed to close tunnel");
                }
            }
        }
        self.shared.provider.shutdown().await;
    }
}

/// One reference to a shared tunnel.
///
/// Dropping a lease without calling [`release`](Self::release) gives the
/// reference back from a background task, so an abandoned request still
/// lets the last user's tunnel close.
pub struct TunnelLease {
    manager: TunnelManager,
    endpoint: Endpoint,
    generation: u64,
    handle: Arc<TunnelHandle>,
    released: bool,
}

impl TunnelLease {
    /// The tunnel this lease refers to.
    pub fn handle(&self) -> &TunnelHandle {
        &self.handle
    }

    /// Give the reference back now.
    pub async fn release(mut self) {
        self.released = true;
        self.manager.release(&self.endpoint, self.generation).await;
    }
}

impl Deref for TunnelLease {
    type Target = TunnelHandle;

    fn deref(&self) -> &TunnelHandle {
        &self.handle
    }
}

impl fmt::Debug for TunnelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelLease")
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let endpoint = self.endpoint.clone();
        let generation = self.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    manager.release(&endpoint, generation).await;
                });
            }
            Err(_) => warn!(%endpoint, "Tunnel lease dropped outside a runtime, tunnel left open"),
        }
    }
}
