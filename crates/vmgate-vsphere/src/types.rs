//! Shared types for the vSphere transfer core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection / Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for connecting to a vCenter / ESXi host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VsphereConfig {
    /// vCenter or ESXi hostname / IP (e.g. "vcenter.lab.local")
    pub host: String,
    /// Port (default 443)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username (e.g. "administrator@vsphere.local")
    pub username: String,
    /// Password
    pub password: String,
    /// Skip TLS certificate verification (self-signed labs)
    #[serde(default)]
    pub insecure: bool,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 { 443 }
fn default_timeout() -> u64 { 30 }

impl Default for VsphereConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            port: 443,
            insecure: false,
            timeout_secs: 30,
        }
    }
}

/// Local settings for archive import/export runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// Scratch root holding per-transfer working directories.
    pub scratch_root: PathBuf,
    /// Lease readiness poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Keep-alive / progress report interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
}

fn default_poll_interval_ms() -> u64 { 2_000 }
fn default_keepalive_secs() -> u64 { 5 }

impl TransferConfig {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            poll_interval_ms: default_poll_interval_ms(),
            keepalive_interval_secs: default_keepalive_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transfer lease
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server-side lease lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    Initializing,
    Ready,
    Error,
    Done,
}

/// One short-lived per-disk-device endpoint issued by a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUrl {
    /// Device identifier; maps one-to-one to a blob filename in the container.
    pub device_key: String,
    pub url: String,
    pub size_bytes: u64,
}

/// Lease description as returned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    /// Lease identifier.
    pub lease: String,
    pub state: LeaseState,
    #[serde(default)]
    pub device_urls: Vec<DeviceUrl>,
    /// Platform error message when `state == Error`.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Entity backing the transfer: the new VM for imports, the source VM
    /// for exports.
    #[serde(default)]
    pub entity: Option<String>,
}

/// Platform-computed import specification, derived from a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSpec {
    /// Opaque deployment specification, passed back verbatim at lease open.
    pub spec: serde_json::Value,
    /// Number of disk devices the descriptor declares.
    pub disk_count: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One node of the remote snapshot forest. Owned by the platform; fetched
/// fresh on every query and never cached across calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNode {
    /// Opaque platform-assigned handle (e.g. "snapshot-42").
    pub remote_ref: String,
    /// Numeric platform id.
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub children: Vec<SnapshotNode>,
}

/// Locally persisted snapshot record — the collaborator contract shape.
/// The persistence layer stores these; this core only validates linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub vm_ref: String,
    pub remote_ref: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Parent snapshot of the same VM, if any.
    #[serde(default)]
    pub parent_ref: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of the cheap session probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user: String,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub last_accessed_time: Option<String>,
}

/// Config without the password, safe to hand to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VsphereConfigSafe {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub insecure: bool,
}
