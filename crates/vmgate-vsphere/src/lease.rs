//! Transfer lease state machine and keep-alive progress reporter.
//!
//! A lease is a server-side handle for one bulk transfer. It is opened
//! against the control plane, polled to readiness, kept alive by a
//! background reporter task for its whole lifetime, and completed exactly
//! once — on success and failure paths alike — so no server-side lease
//! leaks.

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::session::{VsphereSession, SESSION_HEADER};
use crate::types::{DeviceUrl, ImportSpec, LeaseInfo, LeaseState};

use log::{debug, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl LeaseState {
    /// Whether the state ends the readiness wait.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LeaseState::Initializing)
    }
}

// ── Shared progress cell ─────────────────────────────────────────────────────

/// Handle to a lease's reported percentage, shared between the transfer
/// path (writer) and the keep-alive reporter (reader).
///
/// Writes are monotone: a stored value never decreases over the life of
/// the lease, and inputs are clamped to 100.
#[derive(Debug, Clone)]
pub struct LeaseProgress {
    cell: Arc<AtomicU8>,
}

impl LeaseProgress {
    fn new() -> Self {
        Self { cell: Arc::new(AtomicU8::new(0)) }
    }

    pub fn set(&self, percent: u8) {
        self.cell.fetch_max(percent.min(100), Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.cell.load(Ordering::Relaxed)
    }
}

// ── Keep-alive reporter ──────────────────────────────────────────────────────

/// Background task pushing the last reported percentage to the platform on
/// a fixed interval, keeping the lease from expiring server-side even when
/// no bytes are moving (e.g. between devices).
struct LeaseKeeper {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl LeaseKeeper {
    fn spawn(
        http: reqwest::Client,
        base_url: String,
        token: String,
        lease_id: String,
        progress: LeaseProgress,
        interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            loop {
                // Cancellation is cooperative: checked between ticks, never
                // mid-request.
                match tokio::time::timeout(interval, stop_rx.recv()).await {
                    Ok(_) => break,
                    Err(_) => {
                        let percent = progress.get();
                        let url = format!(
                            "{base_url}/api/vcenter/vm-transfer/leases/{lease_id}?action=progress&percent={percent}"
                        );
                        match http.post(&url).header(SESSION_HEADER, &token).send().await {
                            Ok(resp) if !resp.status().is_success() => {
                                warn!(
                                    "Lease {} keep-alive rejected: HTTP {}",
                                    lease_id,
                                    resp.status()
                                );
                            }
                            Ok(_) => debug!("Lease {} keep-alive at {}%", lease_id, percent),
                            Err(e) => warn!("Lease {} keep-alive failed: {}", lease_id, e),
                        }
                    }
                }
            }
            debug!("Lease {} reporter stopped", lease_id);
        });

        Self { stop_tx, handle }
    }

    async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        if let Err(e) = self.handle.await {
            warn!("Lease reporter join error: {e}");
        }
    }
}

// ── Lease handle ─────────────────────────────────────────────────────────────

/// An open transfer lease plus its local progress state.
pub struct Lease {
    pub id: String,
    pub state: LeaseState,
    pub device_urls: Vec<DeviceUrl>,
    /// Entity backing the transfer (new VM for imports).
    pub entity: Option<String>,
    /// Platform error message once `state == Error`.
    pub error_message: Option<String>,
    progress: LeaseProgress,
    keeper: Option<LeaseKeeper>,
    completed: bool,
}

impl Lease {
    fn from_info(info: LeaseInfo, keeper: LeaseKeeper, progress: LeaseProgress) -> Self {
        Self {
            id: info.lease,
            state: info.state,
            device_urls: info.device_urls,
            entity: info.entity,
            error_message: info.error_message,
            progress,
            keeper: Some(keeper),
            completed: false,
        }
    }

    /// Record transfer progress; the reporter pushes it on its next tick.
    pub fn report_progress(&self, percent: u8) {
        self.progress.set(percent);
    }

    /// Last recorded percentage.
    pub fn reported_percent(&self) -> u8 {
        self.progress.get()
    }

    /// Cloneable handle for progress callbacks that outlive this borrow.
    pub fn progress_handle(&self) -> LeaseProgress {
        self.progress.clone()
    }

    /// Total payload size across all device URLs.
    pub fn total_bytes(&self) -> u64 {
        self.device_urls.iter().map(|d| d.size_bytes).sum()
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Lease operations against the control plane.
pub struct LeaseManager<'a> {
    session: &'a VsphereSession,
    keepalive: Duration,
}

impl<'a> LeaseManager<'a> {
    pub fn new(session: &'a VsphereSession, keepalive: Duration) -> Self {
        Self { session, keepalive }
    }

    /// Open an import lease from a platform-computed spec.
    pub async fn request_import_lease(&self, spec: &ImportSpec) -> VsphereResult<Lease> {
        let info: LeaseInfo = self
            .session
            .post("/api/vcenter/vm-transfer/leases?action=import", spec)
            .await?;
        self.open_lease(info)
    }

    /// Open an export lease for an existing VM.
    pub async fn request_export_lease(&self, vm_ref: &str) -> VsphereResult<Lease> {
        #[derive(serde::Serialize)]
        struct ExportRequest<'r> {
            vm: &'r str,
        }
        let info: LeaseInfo = self
            .session
            .post(
                "/api/vcenter/vm-transfer/leases?action=export",
                &ExportRequest { vm: vm_ref },
            )
            .await?;
        self.open_lease(info)
    }

    fn open_lease(&self, info: LeaseInfo) -> VsphereResult<Lease> {
        let token = self
            .session
            .token()
            .ok_or_else(|| VsphereError::auth("Not logged in — no active session"))?
            .to_string();

        let progress = LeaseProgress::new();
        let keeper = LeaseKeeper::spawn(
            self.session.http().clone(),
            self.session.base_url().to_string(),
            token,
            info.lease.clone(),
            progress.clone(),
            self.keepalive,
        );

        debug!("Lease {} opened in state {:?}", info.lease, info.state);
        Ok(Lease::from_info(info, keeper, progress))
    }

    /// Poll the lease until it leaves INITIALIZING.
    ///
    /// Returns `true` on READY. On ERROR (or an unexpected DONE) the
    /// platform message is stored on the lease and `false` is returned —
    /// the caller must not contact any device URL afterwards.
    pub async fn wait_ready(&self, lease: &mut Lease, poll: Duration) -> VsphereResult<bool> {
        loop {
            let path = format!("/api/vcenter/vm-transfer/leases/{}", lease.id);
            let info: LeaseInfo = self.session.get(&path).await?;

            lease.state = info.state;
            match info.state {
                LeaseState::Ready => {
                    lease.device_urls = info.device_urls;
                    lease.entity = info.entity;
                    return Ok(true);
                }
                LeaseState::Error => {
                    let msg = info
                        .error_message
                        .unwrap_or_else(|| "no error message provided".into());
                    warn!("Lease {} entered ERROR: {}", lease.id, msg);
                    lease.error_message = Some(msg);
                    return Ok(false);
                }
                LeaseState::Done => {
                    warn!("Lease {} completed before becoming ready", lease.id);
                    lease.error_message = Some("lease closed before READY".into());
                    return Ok(false);
                }
                LeaseState::Initializing => tokio::time::sleep(poll).await,
            }
        }
    }

    /// Send the final 100% report and release the lease.
    ///
    /// Must be reached on success and failure paths alike; a second call
    /// on the same lease is a no-op.
    pub async fn complete(&self, lease: &mut Lease) -> VsphereResult<()> {
        if lease.completed {
            debug!("Lease {} already completed", lease.id);
            return Ok(());
        }
        lease.completed = true;

        if let Some(keeper) = lease.keeper.take() {
            keeper.stop().await;
        }

        lease.report_progress(100);
        let progress = format!(
            "/api/vcenter/vm-transfer/leases/{}?action=progress&percent=100",
            lease.id
        );
        if let Err(e) = self.session.post_empty(&progress).await {
            warn!("Lease {} final progress report failed: {}", lease.id, e);
        }

        let complete = format!("/api/vcenter/vm-transfer/leases/{}?action=complete", lease.id);
        self.session.post_empty(&complete).await.map_err(|e| {
            VsphereError::new(
                VsphereErrorKind::Lease,
                format!("Lease {} release failed: {}", lease.id, e.message),
            )
        })?;

        lease.state = LeaseState::Done;
        debug!("Lease {} completed", lease.id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_state_wire_decode() {
        let json = r#"{
            "lease": "lease-7",
            "state": "INITIALIZING",
            "deviceUrls": [],
            "errorMessage": null
        }"#;
        let info: LeaseInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.lease, "lease-7");
        assert_eq!(info.state, LeaseState::Initializing);
        assert!(!info.state.is_terminal());
        assert!(info.device_urls.is_empty());
    }

    #[test]
    fn ready_lease_carries_device_urls() {
        let json = r#"{
            "lease": "lease-8",
            "state": "READY",
            "entity": "vm-1001",
            "deviceUrls": [
                {"deviceKey": "disk0.vmdk", "url": "https://esx1/nfc/disk0", "sizeBytes": 1024},
                {"deviceKey": "disk1.vmdk", "url": "https://esx1/nfc/disk1", "sizeBytes": 2048}
            ]
        }"#;
        let info: LeaseInfo = serde_json::from_str(json).unwrap();
        assert!(info.state.is_terminal());
        assert_eq!(info.device_urls.len(), 2);
        assert_eq!(info.device_urls[0].device_key, "disk0.vmdk");
        assert_eq!(info.entity.as_deref(), Some("vm-1001"));
    }

    #[test]
    fn error_state_is_terminal() {
        for (raw, terminal) in [
            ("\"INITIALIZING\"", false),
            ("\"READY\"", true),
            ("\"ERROR\"", true),
            ("\"DONE\"", true),
        ] {
            let state: LeaseState = serde_json::from_str(raw).unwrap();
            assert_eq!(state.is_terminal(), terminal, "{raw}");
        }
    }

    #[test]
    fn progress_is_monotone_and_clamped() {
        let progress = LeaseProgress::new();
        assert_eq!(progress.get(), 0);

        progress.set(40);
        assert_eq!(progress.get(), 40);

        // A lower report never rewinds the published value.
        progress.set(25);
        assert_eq!(progress.get(), 40);

        progress.set(200);
        assert_eq!(progress.get(), 100);
    }

    #[tokio::test]
    async fn keeper_stops_between_ticks() {
        let progress = LeaseProgress::new();
        let keeper = LeaseKeeper::spawn(
            reqwest::Client::new(),
            "https://127.0.0.1:1".into(),
            "token".into(),
            "lease-test".into(),
            progress,
            Duration::from_secs(30),
        );

        // Stop arrives well before the first tick fires a request.
        let started = std::time::Instant::now();
        keeper.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
