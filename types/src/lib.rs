use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

fn default_storage_size() -> String {
    "10Gi".to_string()
}

fn default_egress_mode() -> String {
    "restricted".to_string()
}

/// A long-lived workspace backed by a PersistentVolumeClaim. `HarnessRun`s
/// reference a `WorkspaceSession` by name and share its workspace volume.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "kocao.withakay.github.com",
    version = "v1alpha1",
    kind = "WorkspaceSession",
    plural = "workspacesessions",
    derive = "PartialEq",
    status = "WorkspaceSessionStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.pvcName\", \"name\": \"PVC\", \"type\": \"string\" }"
)]
pub struct WorkspaceSessionSpec {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub storage_class_name: Option<String>,
    #[serde(default = "default_storage_size")]
    pub storage_size: String,
    #[serde(default = "default_egress_mode")]
    pub egress_mode: String,
    #[serde(default)]
    pub attach_enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct WorkspaceSessionStatus {
    pub phase: WorkspaceSessionPhase,
    pub pvc_name: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum WorkspaceSessionPhase {
    #[default]
    Pending,
    Active,
    Terminating,
}

impl FromStr for WorkspaceSessionPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Active" => Ok(Self::Active),
            "Terminating" => Ok(Self::Terminating),
            _ => Err(()),
        }
    }
}

impl fmt::Display for WorkspaceSessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct GitAuthSpec {
    pub secret_name: String,
    #[serde(default)]
    pub token_key: Option<String>,
    #[serde(default)]
    pub username_key: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AgentAuthSpec {
    #[serde(default)]
    pub api_key_secret_name: Option<String>,
    #[serde(default)]
    pub oauth_secret_name: Option<String>,
}

fn default_ttl_seconds_after_finished() -> u32 {
    300
}

/// A one-shot, Pod-backed execution of an agent harness against a repository
/// checkout. Bound to exactly one `WorkspaceSession` for its workspace volume.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "kocao.withakay.github.com",
    version = "v1alpha1",
    kind = "HarnessRun",
    plural = "harnessruns",
    derive = "PartialEq",
    status = "HarnessRunStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.podName\", \"name\": \"POD\", \"type\": \"string\" }"
)]
pub struct HarnessRunSpec {
    #[serde(default)]
    pub workspace_session_name: Option<String>,
    pub repo_url: String,
    #[serde(default)]
    pub repo_revision: Option<String>,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub git_auth: Option<GitAuthSpec>,
    #[serde(default)]
    pub agent_auth: Option<AgentAuthSpec>,
    #[serde(default = "default_egress_mode")]
    pub egress_mode: String,
    #[serde(default = "default_ttl_seconds_after_finished")]
    pub ttl_seconds_after_finished: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct HarnessRunStatus {
    pub phase: HarnessRunPhase,
    pub pod_name: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub finished_at: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>,
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum HarnessRunPhase {
    #[default]
    Pending,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl HarnessRunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl FromStr for HarnessRunPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Starting" => Ok(Self::Starting),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for HarnessRunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_display_and_from_str() {
        for phase in [
            WorkspaceSessionPhase::Pending,
            WorkspaceSessionPhase::Active,
            WorkspaceSessionPhase::Terminating,
        ] {
            assert_eq!(phase.to_string().parse::<WorkspaceSessionPhase>(), Ok(phase));
        }
        for phase in [
            HarnessRunPhase::Pending,
            HarnessRunPhase::Starting,
            HarnessRunPhase::Running,
            HarnessRunPhase::Succeeded,
            HarnessRunPhase::Failed,
        ] {
            assert_eq!(phase.to_string().parse::<HarnessRunPhase>(), Ok(phase));
        }
    }

    #[test]
    fn terminal_phases_are_succeeded_and_failed_only() {
        assert!(HarnessRunPhase::Succeeded.is_terminal());
        assert!(HarnessRunPhase::Failed.is_terminal());
        assert!(!HarnessRunPhase::Running.is_terminal());
        assert!(!HarnessRunPhase::Starting.is_terminal());
        assert!(!HarnessRunPhase::Pending.is_terminal());
    }
}
