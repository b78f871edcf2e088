//! Aggregate service facade for the transfer core.
//!
//! `TransferService` owns the single shared `VsphereSession` and exposes
//! every domain operation. Callers hold `TransferServiceState =
//! Arc<Mutex<TransferService>>`, which serialises logical operations —
//! `ensure_valid()` re-authentication is not safe against concurrent
//! callers, so the outer mutex is load-bearing.

use crate::deploy;
use crate::error::{VsphereError, VsphereResult};
use crate::session::VsphereSession;
use crate::snapshot::{self, SnapshotManager};
use crate::types::{SnapshotNode, TransferConfig, VsphereConfig, VsphereConfigSafe};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Thread-safe handle shared with the request-routing layer.
pub type TransferServiceState = Arc<Mutex<TransferService>>;

/// Top-level service aggregating session, transfer, and snapshot ops.
pub struct TransferService {
    session: Option<VsphereSession>,
    transfer: TransferConfig,
}

impl TransferService {
    /// Create a new (disconnected) service.
    pub fn new(transfer: TransferConfig) -> Self {
        Self { session: None, transfer }
    }

    /// Whether we hold an open platform session.
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().map(|s| s.is_open()).unwrap_or(false)
    }

    fn require_session(&self) -> VsphereResult<&VsphereSession> {
        self.session
            .as_ref()
            .filter(|s| s.is_open())
            .ok_or_else(|| {
                VsphereError::connection("Not connected to vSphere. Call connect first.")
            })
    }

    fn require_session_mut(&mut self) -> VsphereResult<&mut VsphereSession> {
        match self.session.as_mut() {
            Some(s) if s.is_open() => Ok(s),
            _ => Err(VsphereError::connection(
                "Not connected to vSphere. Call connect first.",
            )),
        }
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Open a session against a vCenter / ESXi host. Returns the token.
    pub async fn connect(&mut self, config: VsphereConfig) -> VsphereResult<String> {
        let mut session = VsphereSession::new(&config)?;
        session.open().await?;
        let token = session.token().unwrap_or_default().to_string();
        self.session = Some(session);
        Ok(token)
    }

    /// Close the session and drop it.
    pub async fn disconnect(&mut self) -> VsphereResult<()> {
        if let Some(ref mut session) = self.session {
            let _ = session.close().await;
        }
        self.session = None;
        Ok(())
    }

    /// Probe whether the current session is still valid.
    pub async fn check_session(&self) -> VsphereResult<bool> {
        match self.session {
            Some(ref s) if s.is_open() => Ok(s.probe().await.is_ok()),
            _ => Ok(false),
        }
    }

    /// User the session authenticates as.
    pub async fn current_user(&self) -> VsphereResult<String> {
        self.require_session()?.current_user().await
    }

    /// Connection config without the password.
    pub fn get_config(&self) -> Option<VsphereConfigSafe> {
        self.session.as_ref().map(|s| {
            let c = s.config();
            VsphereConfigSafe {
                host: c.host.clone(),
                port: c.port,
                username: c.username.clone(),
                insecure: c.insecure,
            }
        })
    }

    /// Local transfer settings.
    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer
    }

    // ── Archive transfer ────────────────────────────────────────────

    /// Import an OVA container; returns the new VM identifier.
    pub async fn import_archive(&mut self, archive: &Path) -> VsphereResult<String> {
        let transfer = self.transfer.clone();
        let session = self.require_session_mut()?;
        deploy::import_archive(session, &transfer, archive).await
    }

    /// Export a VM into `<scratch>/<derived-name>.ova`.
    pub async fn export_vm(&mut self, vm_ref: &str, vm_name: &str) -> VsphereResult<PathBuf> {
        let transfer = self.transfer.clone();
        let session = self.require_session_mut()?;
        deploy::export_vm(session, &transfer, vm_ref, vm_name).await
    }

    // ── Snapshot operations ─────────────────────────────────────────

    /// Freshly fetched snapshot forest for a VM.
    pub async fn list_snapshots(&self, vm_ref: &str) -> VsphereResult<Vec<SnapshotNode>> {
        let s = self.require_session()?;
        SnapshotManager::new(s).list(vm_ref).await
    }

    /// Take a snapshot; returns the platform handle.
    pub async fn create_snapshot(
        &self,
        vm_ref: &str,
        name: &str,
        description: Option<&str>,
    ) -> VsphereResult<String> {
        let s = self.require_session()?;
        SnapshotManager::new(s).create(vm_ref, name, description).await
    }

    /// Revert a VM to the named snapshot. `false` when the node is gone.
    pub async fn revert_snapshot(&self, vm_ref: &str, remote_ref: &str) -> VsphereResult<bool> {
        let s = self.require_session()?;
        let manager = SnapshotManager::new(s);
        let forest = manager.list(vm_ref).await?;
        match snapshot::find_by_ref(&forest, remote_ref) {
            Some(node) => manager.revert(vm_ref, node).await,
            None => Ok(false),
        }
    }

    /// Rename a snapshot. `false` when the node is gone.
    pub async fn rename_snapshot(
        &self,
        vm_ref: &str,
        remote_ref: &str,
        name: &str,
        description: Option<&str>,
    ) -> VsphereResult<bool> {
        let s = self.require_session()?;
        let manager = SnapshotManager::new(s);
        let forest = manager.list(vm_ref).await?;
        match snapshot::find_by_ref(&forest, remote_ref) {
            Some(node) => manager.rename(vm_ref, node, name, description).await,
            None => Ok(false),
        }
    }

    /// Remove a snapshot, optionally cascading. `false` when already gone.
    pub async fn remove_snapshot(
        &self,
        vm_ref: &str,
        remote_ref: &str,
        cascade_children: bool,
    ) -> VsphereResult<bool> {
        let s = self.require_session()?;
        let manager = SnapshotManager::new(s);
        let forest = manager.list(vm_ref).await?;
        match snapshot::find_by_ref(&forest, remote_ref) {
            Some(node) => manager.remove(vm_ref, node, cascade_children).await,
            None => Ok(false),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VsphereErrorKind;

    fn service() -> TransferService {
        TransferService::new(TransferConfig::new("/tmp/vmgate-scratch"))
    }

    #[test]
    fn starts_disconnected() {
        let svc = service();
        assert!(!svc.is_connected());
        assert!(svc.get_config().is_none());
    }

    #[test]
    fn operations_require_a_session() {
        let svc = service();
        let err = svc.require_session().unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::Connection);
    }

    #[tokio::test]
    async fn check_session_false_when_disconnected() {
        let svc = service();
        assert!(!svc.check_session().await.unwrap());
    }

    #[test]
    fn transfer_config_is_exposed() {
        let svc = service();
        assert_eq!(svc.transfer_config().keepalive_interval_secs, 5);
        assert_eq!(svc.transfer_config().poll_interval_ms, 2_000);
    }
}
