use crate::conntrack::packet::PacketInfo;
use crate::rwlock::CustomRwLock;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// PID of a connection whose process could not (yet) be identified.
pub const UNDEFINED_PROCESS_ID: i32 = -1;
// Synthetic PID representing a remote network host, used for external
// requests that have no local process.
pub const NETWORK_HOST_PROCESS_ID: i32 = -255;

// Policy bundle attached to a process. Settings live elsewhere; the
// connection core only needs identity, the internal marker, the history
// opt-in and the revision counter for re-evaluation.
#[derive(Debug, Default)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub source: String,
    pub internal: bool,
    pub enable_history: bool,
    revision: AtomicU64,
    // Maps an option key to the profile that carries the setting, for
    // options inherited from another layer.
    setting_sources: HashMap<String, String>,
}

impl Profile {
    pub fn new(id: &str, name: &str, source: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            source: source.to_string(),
            internal: false,
            enable_history: false,
            revision: AtomicU64::new(1),
            setting_sources: HashMap::new(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    pub fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_setting_source(&mut self, option_key: &str, profile_key: &str) {
        self.setting_sources
            .insert(option_key.to_string(), profile_key.to_string());
    }

    // Database key of the profile that holds the given setting. Falls
    // back to this profile when the option is not inherited.
    pub fn profile_source(&self, option_key: &str) -> String {
        self.setting_sources
            .get(option_key)
            .cloned()
            .unwrap_or_else(|| self.id.clone())
    }
}

// Snapshot of a process at the time it was observed. The resolver owns
// the process table; connections hold `Arc` handles that stay valid even
// after the process exits.
#[derive(Debug)]
pub struct Process {
    pub pid: i32,
    pub name: String,
    pub path: String,
    pub cmd_line: String,
    pub created_at: i64,
    profile: CustomRwLock<Option<Arc<Profile>>>,
}

impl Process {
    pub fn new(pid: i32, name: &str, path: &str, cmd_line: &str, created_at: i64) -> Self {
        Self {
            pid,
            name: name.to_string(),
            path: path.to_string(),
            cmd_line: cmd_line.to_string(),
            created_at,
            profile: CustomRwLock::new(None),
        }
    }

    pub async fn profile(&self) -> Option<Arc<Profile>> {
        self.profile.read().await.clone()
    }

    pub async fn set_profile(&self, profile: Arc<Profile>) {
        *self.profile.write().await = Some(profile);
    }

    pub fn describe(&self) -> String {
        format!("{} ({})", self.name, self.pid)
    }
}

// Resolves packets to processes and processes to profiles. Backed by the
// OS state tables in production; tests install their own.
#[async_trait]
pub trait ProcessResolver: Send + Sync {
    // Returns the PID owning the described connection together with the
    // direction as reported by the state tables, which may correct the
    // direction guessed from the packet.
    async fn pid_of_connection(&self, info: &PacketInfo) -> Result<(i32, bool)>;

    async fn process_with_profile(&self, pid: i32) -> Result<Arc<Process>>;

    // Synthetic process standing in for a remote host.
    async fn network_host(&self, ip: IpAddr) -> Result<Arc<Process>>;
}

lazy_static! {
    static ref PROCESS_RESOLVER: CustomRwLock<Option<Arc<dyn ProcessResolver>>> =
        CustomRwLock::new(None);
}

pub async fn set_process_resolver(resolver: Arc<dyn ProcessResolver>) {
    *PROCESS_RESOLVER.write().await = Some(resolver);
}

pub async fn get_pid_of_connection(info: &PacketInfo) -> Result<(i32, bool)> {
    match PROCESS_RESOLVER.read().await.as_ref() {
        Some(resolver) => resolver.pid_of_connection(info).await,
        None => Err(anyhow!("no process resolver registered")),
    }
}

pub async fn get_process_with_profile(pid: i32) -> Result<Arc<Process>> {
    match PROCESS_RESOLVER.read().await.as_ref() {
        Some(resolver) => resolver.process_with_profile(pid).await,
        None => Err(anyhow!("no process resolver registered")),
    }
}

pub async fn get_network_host(ip: IpAddr) -> Result<Arc<Process>> {
    match PROCESS_RESOLVER.read().await.as_ref() {
        Some(resolver) => resolver.network_host(ip).await,
        None => Err(anyhow!("no process resolver registered")),
    }
}

// Per-process user feature toggles are resolved through the access gate;
// the process context below is the immutable per-connection snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessContext {
    pub process_name: String,
    pub profile_name: String,
    pub binary_path: String,
    pub cmd_line: String,
    pub pid: i32,
    pub created_at: i64,
    pub profile: String,
    pub source: String,
}

pub async fn get_process_context(proc: &Process) -> ProcessContext {
    let mut ctx = ProcessContext {
        process_name: proc.name.clone(),
        binary_path: proc.path.clone(),
        cmd_line: proc.cmd_line.clone(),
        pid: proc.pid,
        created_at: proc.created_at,
        ..Default::default()
    };

    match proc.profile().await {
        Some(profile) => {
            ctx.profile_name = profile.name.clone();
            ctx.profile = profile.id.clone();
            ctx.source = profile.source.clone();
        }
        None => {
            tracing::warn!("Process {} has no profile", proc.describe());
        }
    }

    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_context_snapshot() {
        let proc = Process::new(4711, "curl", "/usr/bin/curl", "curl https://example.com", 1700000000);
        let mut profile = Profile::new("app-7", "curl", "local");
        profile.set_setting_source("filter/endpoints", "global-config");
        proc.set_profile(Arc::new(profile)).await;

        let ctx = get_process_context(&proc).await;
        assert_eq!(ctx.pid, 4711);
        assert_eq!(ctx.process_name, "curl");
        assert_eq!(ctx.profile, "app-7");
        assert_eq!(ctx.source, "local");
    }

    #[tokio::test]
    async fn test_profile_source_fallback() {
        let mut profile = Profile::new("app-7", "curl", "local");
        profile.set_setting_source("filter/lists", "global-config");
        assert_eq!(profile.profile_source("filter/lists"), "global-config");
        assert_eq!(profile.profile_source("filter/endpoints"), "app-7");
    }

    #[test]
    fn test_revision_counter() {
        let profile = Profile::new("app-7", "curl", "local");
        assert_eq!(profile.revision(), 1);
        profile.bump_revision();
        assert_eq!(profile.revision(), 2);
    }
}
