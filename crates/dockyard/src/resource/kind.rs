//! Resource kinds and their per-kind provisioning profile.

use serde::{Deserialize, Serialize};

use crate::readiness::ReadinessMarkers;

/// Kind of container-backed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Interactive development environment.
    Workspace,
    /// Autonomous agent sandbox.
    Agent,
    /// Deployed user application.
    Deployment,
    /// Managed database instance.
    Database,
    /// Object-storage bucket.
    Bucket,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Workspace,
        ResourceKind::Agent,
        ResourceKind::Deployment,
        ResourceKind::Database,
        ResourceKind::Bucket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Workspace => "workspace",
            ResourceKind::Agent => "agent",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Database => "database",
            ResourceKind::Bucket => "bucket",
        }
    }

    /// Provisioning profile for this kind.
    pub fn profile(&self) -> &'static dyn KindProfile {
        profile(*self)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "workspace" => Ok(ResourceKind::Workspace),
            "agent" => Ok(ResourceKind::Agent),
            "deployment" => Ok(ResourceKind::Deployment),
            "database" => Ok(ResourceKind::Database),
            "bucket" => Ok(ResourceKind::Bucket),
            _ => Err(format!("unknown resource kind: {}", s)),
        }
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// What happens to the container when its resource is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Remove the container; the next start recreates it.
    Remove,
    /// Keep the stopped container around; the next start reuses it.
    Keep,
}

/// Per-kind provisioning defaults.
pub trait KindProfile: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn default_image(&self) -> &'static str;

    /// Port the main service listens on inside the container.
    fn primary_port(&self) -> u16;

    /// Port of the secondary channel (control API, console, metrics).
    fn aux_port(&self) -> u16;

    /// Where the persistent volume is mounted.
    fn mount_path(&self) -> &'static str;

    fn default_memory(&self) -> Option<&'static str> {
        None
    }

    fn default_cpu_shares(&self) -> Option<u32> {
        None
    }

    fn stop_policy(&self) -> StopPolicy {
        StopPolicy::Keep
    }

    /// Whether one backend serves several tenants, so requests must carry
    /// the resource id.
    fn shares_backend(&self) -> bool {
        false
    }

    /// Command override; empty uses the image default.
    fn command(&self) -> Vec<String> {
        Vec::new()
    }

    fn default_env(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn readiness_markers(&self) -> ReadinessMarkers;
}

/// Markers emitted by the package installers our images run on first boot.
const INSTALL_STARTED: &[&str] = &[
    "installing dependencies",
    "npm install",
    "pip install",
    "downloading packages",
];
const INSTALL_FINISHED: &[&str] = &["dependencies installed", "added packages"];

struct WorkspaceProfile;

impl KindProfile for WorkspaceProfile {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Workspace
    }

    fn default_image(&self) -> &'static str {
        "dockyard/workspace:latest"
    }

    fn primary_port(&self) -> u16 {
        8080
    }

    fn aux_port(&self) -> u16 {
        8081
    }

    fn mount_path(&self) -> &'static str {
        "/home/dev"
    }

    fn default_memory(&self) -> Option<&'static str> {
        Some("2g")
    }

    fn default_cpu_shares(&self) -> Option<u32> {
        Some(1024)
    }

    fn default_env(&self) -> Vec<(&'static str, String)> {
        vec![("HOME", "/home/dev".to_string())]
    }

    fn readiness_markers(&self) -> ReadinessMarkers {
        ReadinessMarkers {
            primary: &["server listening", "listening on"],
            control: &["control channel ready", "rpc server started"],
            install_started: INSTALL_STARTED,
            install_finished: INSTALL_FINISHED,
        }
    }
}

struct AgentProfile;

impl KindProfile for AgentProfile {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Agent
    }

    fn default_image(&self) -> &'static str {
        "dockyard/agent:latest"
    }

    fn primary_port(&self) -> u16 {
        7000
    }

    fn aux_port(&self) -> u16 {
        7001
    }

    fn mount_path(&self) -> &'static str {
        "/workspace"
    }

    fn default_memory(&self) -> Option<&'static str> {
        Some("1g")
    }

    fn default_cpu_shares(&self) -> Option<u32> {
        Some(512)
    }

    fn stop_policy(&self) -> StopPolicy {
        StopPolicy::Remove
    }

    fn shares_backend(&self) -> bool {
        true
    }

    fn readiness_markers(&self) -> ReadinessMarkers {
        ReadinessMarkers {
            primary: &["agent listening", "listening on"],
            control: &["control channel ready", "tools registered"],
            install_started: INSTALL_STARTED,
            install_finished: INSTALL_FINISHED,
        }
    }
}

struct DeploymentProfile;

impl KindProfile for DeploymentProfile {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Deployment
    }

    fn default_image(&self) -> &'static str {
        "dockyard/runtime:latest"
    }

    fn primary_port(&self) -> u16 {
        3000
    }

    fn aux_port(&self) -> u16 {
        3001
    }

    fn mount_path(&self) -> &'static str {
        "/app/data"
    }

    fn default_memory(&self) -> Option<&'static str> {
        Some("512m")
    }

    fn stop_policy(&self) -> StopPolicy {
        StopPolicy::Remove
    }

    fn default_env(&self) -> Vec<(&'static str, String)> {
        vec![("NODE_ENV", "production".to_string())]
    }

    fn readiness_markers(&self) -> ReadinessMarkers {
        ReadinessMarkers {
            primary: &["listening on", "server started", "ready on"],
            control: &[],
            install_started: INSTALL_STARTED,
            install_finished: INSTALL_FINISHED,
        }
    }
}

struct DatabaseProfile;

impl KindProfile for DatabaseProfile {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Database
    }

    fn default_image(&self) -> &'static str {
        "postgres:16"
    }

    fn primary_port(&self) -> u16 {
        5432
    }

    fn aux_port(&self) -> u16 {
        9187
    }

    fn mount_path(&self) -> &'static str {
        "/var/lib/postgresql/data"
    }

    fn default_memory(&self) -> Option<&'static str> {
        Some("1g")
    }

    fn default_env(&self) -> Vec<(&'static str, String)> {
        vec![("PGDATA", "/var/lib/postgresql/data/pgdata".to_string())]
    }

    fn readiness_markers(&self) -> ReadinessMarkers {
        ReadinessMarkers {
            primary: &["database system is ready to accept connections"],
            control: &[],
            install_started: &[],
            install_finished: &[],
        }
    }
}

struct BucketProfile;

impl KindProfile for BucketProfile {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Bucket
    }

    fn default_image(&self) -> &'static str {
        "minio/minio:latest"
    }

    fn primary_port(&self) -> u16 {
        9000
    }

    fn aux_port(&self) -> u16 {
        9001
    }

    fn mount_path(&self) -> &'static str {
        "/data"
    }

    fn default_memory(&self) -> Option<&'static str> {
        Some("512m")
    }

    fn command(&self) -> Vec<String> {
        ["server", "/data", "--console-address", ":9001"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn readiness_markers(&self) -> ReadinessMarkers {
        ReadinessMarkers {
            // Matches both `API: http://...` and the newer `S3-API: http://...`.
            primary: &["API: http"],
            control: &[],
            install_started: &[],
            install_finished: &[],
        }
    }
}

/// Look up the profile for a kind.
pub fn profile(kind: ResourceKind) -> &'static dyn KindProfile {
    match kind {
        ResourceKind::Workspace => &WorkspaceProfile,
        ResourceKind::Agent => &AgentProfile,
        ResourceKind::Deployment => &DeploymentProfile,
        ResourceKind::Database => &DatabaseProfile,
        ResourceKind::Bucket => &BucketProfile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_roundtrip() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.to_string().parse::<ResourceKind>(), Ok(kind));
            assert_eq!(profile(kind).kind(), kind);
        }
        assert!("vm".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_only_interactive_kinds_have_control_channel() {
        for kind in ResourceKind::ALL {
            let has_control = !profile(kind).readiness_markers().control.is_empty();
            let expected = matches!(kind, ResourceKind::Workspace | ResourceKind::Agent);
            assert_eq!(has_control, expected, "{kind}");
        }
    }

    #[test]
    fn test_bucket_ready_only_on_minio_banner() {
        let policy = crate::readiness::ReadinessPolicy::new(
            profile(ResourceKind::Bucket).readiness_markers(),
            &crate::readiness::ReadinessSettings::default(),
        );

        let early = "INFO: Formatting 1st pool, 1 set(s), 1 drives per set.\n\
                     WARNING: Detected default credentials 'minioadmin:minioadmin'\n\
                     Status: 1 Online, 0 Offline.\n";
        assert!(!policy.scan(early).primary_ready);
        assert!(!policy.scan("level=info msg=\"loading api: config\"\n").primary_ready);

        assert!(policy.scan("API: http://172.17.0.2:9000  http://127.0.0.1:9000\n").primary_ready);
        assert!(policy.scan("S3-API: http://172.17.0.2:9000\n").primary_ready);
    }

    #[test]
    fn test_stop_policies() {
        assert_eq!(profile(ResourceKind::Agent).stop_policy(), StopPolicy::Remove);
        assert_eq!(profile(ResourceKind::Deployment).stop_policy(), StopPolicy::Remove);
        assert_eq!(profile(ResourceKind::Database).stop_policy(), StopPolicy::Keep);
        assert!(profile(ResourceKind::Agent).shares_backend());
        assert!(!profile(ResourceKind::Workspace).shares_backend());
    }
}
