// ──────────────────────────────────────────────────────────────────────────────
// vmgate-vsphere · deploy
// ──────────────────────────────────────────────────────────────────────────────
// Import / export orchestration:
//  • Import: descriptor → platform import spec → lease → per-device upload
//  • Export: lease → per-device download → regenerated descriptor → container
//  • Scratch working directory lifecycle (removed on success and failure)
// ──────────────────────────────────────────────────────────────────────────────

use crate::error::{VsphereError, VsphereResult};
use crate::lease::{Lease, LeaseManager};
use crate::session::VsphereSession;
use crate::transfer::{self, device_percent};
use crate::types::{ImportSpec, TransferConfig};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;
use vmgate_archive::{ova, CONTAINER_EXT, DESCRIPTOR_EXT};

// ── Import ───────────────────────────────────────────────────────────────────

/// Import an OVA container as a new VM. Returns the platform identifier of
/// the created VM.
///
/// The container is inspected before any remote side effect: a missing or
/// unreadable descriptor aborts with an archive error while the platform
/// is still untouched. A VM left behind by a mid-transfer failure is the
/// caller's to clean up.
pub async fn import_archive(
    session: &mut VsphereSession,
    cfg: &TransferConfig,
    archive: &Path,
) -> VsphereResult<String> {
    let descriptor_entry = ova::find_descriptor(archive)?.ok_or_else(|| {
        VsphereError::archive(format!(
            "No .{DESCRIPTOR_EXT} descriptor in '{}'",
            archive.display()
        ))
    })?;
    let descriptor = ova::read_text_entry(archive, &descriptor_entry)?;
    info!("Importing '{}' (descriptor {})", archive.display(), descriptor_entry);

    session.ensure_valid().await?;

    #[derive(Serialize)]
    struct DescriptorSource<'r> {
        descriptor: &'r str,
    }
    let spec: ImportSpec = session
        .post("/api/vcenter/ovf/import-spec", &DescriptorSource { descriptor: &descriptor })
        .await?;

    let workdir = cfg
        .scratch_root
        .join(format!("{}-{}", derived_name(archive), short_id()));
    fs::create_dir_all(&workdir).map_err(|e| {
        VsphereError::archive(format!("Cannot create scratch dir '{}': {e}", workdir.display()))
    })?;

    let result = run_import(session, cfg, archive, &spec, &workdir).await;

    if let Err(e) = fs::remove_dir_all(&workdir) {
        warn!("Scratch dir '{}' not removed: {}", workdir.display(), e);
    }
    result
}

async fn run_import(
    session: &VsphereSession,
    cfg: &TransferConfig,
    archive: &Path,
    spec: &ImportSpec,
    workdir: &Path,
) -> VsphereResult<String> {
    ova::unpack(archive, workdir)?;

    let manager = LeaseManager::new(session, Duration::from_secs(cfg.keepalive_interval_secs));
    let mut lease = manager.request_import_lease(spec).await?;

    let outcome = drive_import(session, &manager, &mut lease, cfg, spec, workdir).await;

    let completion = manager.complete(&mut lease).await;
    match outcome {
        Ok(()) => {
            completion?;
            let vm = lease.entity.clone().ok_or_else(|| {
                VsphereError::lease(format!("Lease {} did not name the imported VM", lease.id))
            })?;
            info!("Import complete: {}", vm);
            Ok(vm)
        }
        Err(e) => {
            if let Err(ce) = completion {
                warn!("Lease release after failed import also failed: {ce}");
            }
            Err(e)
        }
    }
}

async fn drive_import(
    session: &VsphereSession,
    manager: &LeaseManager<'_>,
    lease: &mut Lease,
    cfg: &TransferConfig,
    spec: &ImportSpec,
    workdir: &Path,
) -> VsphereResult<()> {
    let ready = manager
        .wait_ready(lease, Duration::from_millis(cfg.poll_interval_ms))
        .await?;
    if !ready {
        return Err(lease_failure("Import", lease));
    }

    if lease.device_urls.len() != spec.disk_count {
        return Err(VsphereError::lease(format!(
            "Lease {} exposes {} device URLs for {} declared disks",
            lease.id,
            lease.device_urls.len(),
            spec.disk_count
        )));
    }

    let token = require_token(session)?;
    let total = lease.total_bytes();
    let devices = lease.device_urls.clone();
    let mut bytes_done = 0u64;

    for device in &devices {
        let source = workdir.join(&device.device_key);
        if !source.is_file() {
            return Err(VsphereError::archive(format!(
                "Container carries no blob '{}' for its device",
                device.device_key
            )));
        }

        let progress = lease.progress_handle();
        let done = bytes_done;
        let moved = transfer::upload(session.http(), token, &device.url, &source, move |sent| {
            progress.set(device_percent(done, sent, total))
        })
        .await?;

        bytes_done += moved;
        lease.report_progress(device_percent(bytes_done, 0, total));
        info!("Device {} uploaded ({} bytes)", device.device_key, moved);
    }

    Ok(())
}

// ── Export ───────────────────────────────────────────────────────────────────

/// Export an existing VM into a single OVA container under the scratch
/// root. Returns the container path `<derived-name>.ova`; the working
/// subdirectory `<derived-name>/` is removed on success and failure.
pub async fn export_vm(
    session: &mut VsphereSession,
    cfg: &TransferConfig,
    vm_ref: &str,
    vm_name: &str,
) -> VsphereResult<PathBuf> {
    session.ensure_valid().await?;

    let derived = sanitize_name(vm_name);
    let workdir = cfg.scratch_root.join(&derived);
    let container = cfg.scratch_root.join(format!("{derived}.{CONTAINER_EXT}"));
    fs::create_dir_all(&workdir).map_err(|e| {
        VsphereError::archive(format!("Cannot create scratch dir '{}': {e}", workdir.display()))
    })?;
    info!("Exporting {} into '{}'", vm_ref, container.display());

    let result = run_export(session, cfg, vm_ref, &derived, &workdir, &container).await;

    if let Err(e) = fs::remove_dir_all(&workdir) {
        warn!("Scratch dir '{}' not removed: {}", workdir.display(), e);
    }
    result
}

async fn run_export(
    session: &VsphereSession,
    cfg: &TransferConfig,
    vm_ref: &str,
    derived: &str,
    workdir: &Path,
    container: &Path,
) -> VsphereResult<PathBuf> {
    let manager = LeaseManager::new(session, Duration::from_secs(cfg.keepalive_interval_secs));
    let mut lease = manager.request_export_lease(vm_ref).await?;

    let outcome = drive_export(session, &manager, &mut lease, cfg, vm_ref, derived, workdir).await;

    let completion = manager.complete(&mut lease).await;
    match outcome {
        Ok(()) => {
            completion?;
            ova::pack(workdir, container)?;
            info!("Export complete: {}", container.display());
            Ok(container.to_path_buf())
        }
        Err(e) => {
            if let Err(ce) = completion {
                warn!("Lease release after failed export also failed: {ce}");
            }
            Err(e)
        }
    }
}

async fn drive_export(
    session: &VsphereSession,
    manager: &LeaseManager<'_>,
    lease: &mut Lease,
    cfg: &TransferConfig,
    vm_ref: &str,
    derived: &str,
    workdir: &Path,
) -> VsphereResult<()> {
    let ready = manager
        .wait_ready(lease, Duration::from_millis(cfg.poll_interval_ms))
        .await?;
    if !ready {
        return Err(lease_failure("Export", lease));
    }

    let token = require_token(session)?;
    let total = lease.total_bytes();
    let devices = lease.device_urls.clone();
    let mut bytes_done = 0u64;

    for device in &devices {
        let dest = workdir.join(&device.device_key);
        let progress = lease.progress_handle();
        let done = bytes_done;
        let moved = transfer::download(session.http(), token, &device.url, &dest, |got| {
            progress.set(device_percent(done, got, total))
        })
        .await?;

        bytes_done += moved;
        lease.report_progress(device_percent(bytes_done, 0, total));
        info!("Device {} downloaded ({} bytes)", device.device_key, moved);
    }

    // The descriptor for the exported set is regenerated by the platform
    // from the actual downloaded files.
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct DescriptorFile {
        name: String,
        size_bytes: u64,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct DescriptorRequest<'r> {
        vm: &'r str,
        files: Vec<DescriptorFile>,
    }
    #[derive(Deserialize)]
    struct DescriptorText {
        descriptor: String,
    }

    let files = devices
        .iter()
        .map(|d| DescriptorFile {
            name: d.device_key.clone(),
            size_bytes: fs::metadata(workdir.join(&d.device_key))
                .map(|m| m.len())
                .unwrap_or(d.size_bytes),
        })
        .collect();

    let text: DescriptorText = session
        .post(
            "/api/vcenter/ovf/export-descriptor",
            &DescriptorRequest { vm: vm_ref, files },
        )
        .await?;

    let descriptor_path = workdir.join(format!("{derived}.{DESCRIPTOR_EXT}"));
    fs::write(&descriptor_path, text.descriptor).map_err(|e| {
        VsphereError::archive(format!(
            "Cannot write descriptor '{}': {e}",
            descriptor_path.display()
        ))
    })?;

    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn lease_failure(op: &str, lease: &Lease) -> VsphereError {
    VsphereError::lease(format!(
        "{op} lease {} failed: {}",
        lease.id,
        lease
            .error_message
            .as_deref()
            .unwrap_or("no error message provided")
    ))
}

fn require_token(session: &VsphereSession) -> VsphereResult<&str> {
    session
        .token()
        .ok_or_else(|| VsphereError::auth("Not logged in — no active session"))
}

/// Derive a filesystem-safe name from a VM or archive name.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "appliance".to_string()
    } else {
        cleaned
    }
}

fn derived_name(archive: &Path) -> String {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitize_name(&stem)
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_name("web-frontend_01"), "web-frontend_01");
        assert_eq!(sanitize_name("db/primary: prod"), "db_primary__prod");
        assert_eq!(sanitize_name(""), "appliance");
    }

    #[test]
    fn derived_name_uses_archive_stem() {
        assert_eq!(derived_name(Path::new("/tmp/exports/web server.ova")), "web_server");
        assert_eq!(derived_name(Path::new("appliance.ova")), "appliance");
    }

    #[test]
    fn short_ids_are_short_and_distinct() {
        let a = short_id();
        let b = short_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn multi_device_percent_reaches_100_only_at_the_end() {
        // Two devices: 6 MiB then 4 MiB.
        let sizes = [6u64 * 1024 * 1024, 4 * 1024 * 1024];
        let total: u64 = sizes.iter().sum();

        let mut last = 0u8;
        let mut bytes_done = 0u64;
        for (i, size) in sizes.iter().enumerate() {
            let mut sent = 0u64;
            while sent < *size {
                sent = (sent + 65_536).min(*size);
                let pct = device_percent(bytes_done, sent, total);
                assert!(pct >= last);
                if i + 1 < sizes.len() || sent < *size {
                    assert!(pct < 100, "100% before the final byte");
                }
                last = pct;
            }
            bytes_done += size;
        }

        assert_eq!(device_percent(bytes_done, 0, total), 100);
    }
}
