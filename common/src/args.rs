use std::net::ToSocketAddrs;

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CP_ENV must be one of dev, test, prod (got {0:?})")]
    InvalidEnv(String),

    #[error("CP_HTTP_ADDR {0:?} is not a resolvable socket address: {1}")]
    InvalidHttpAddr(String, std::io::Error),

    #[error("namespace is required when running in-cluster (set POD_NAMESPACE or CP_NAMESPACE)")]
    NamespaceRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnv {
    Dev,
    Test,
    Prod,
}

/// Shared CLI/env configuration for both the operator and API binaries.
/// Every flag falls back to an environment variable so the process can be
/// configured purely by env in a container, the way the original Go
/// `internal/config` package did.
#[derive(Parser, Debug, Clone)]
pub struct ControlPlaneArgs {
    #[arg(long, env = "CP_ENV", default_value = "dev")]
    pub env: String,

    #[arg(long, env = "CP_HTTP_ADDR", default_value = ":8080")]
    pub http_addr: String,

    #[arg(long, env = "CP_NAMESPACE", default_value = "")]
    pub namespace: String,

    #[arg(long, env = "POD_NAMESPACE", default_value = "")]
    pub pod_namespace: String,

    #[arg(long, env = "CP_IN_CLUSTER", default_value_t = false)]
    pub in_cluster: bool,

    #[arg(long, env = "CP_BOOTSTRAP_TOKEN", default_value = "")]
    pub bootstrap_token: String,

    #[arg(long, env = "CP_AUDIT_LOG_PATH", default_value = "")]
    pub audit_log_path: String,

    #[arg(long, env = "CP_GITHUB_EGRESS_CIDRS", default_value = "")]
    pub github_egress_cidrs: String,

    #[arg(long, env = "CP_CORS_ORIGINS", default_value = "")]
    pub cors_origins: String,
}

impl ControlPlaneArgs {
    pub fn runtime_env(&self) -> Result<RuntimeEnv, ConfigError> {
        match self.env.as_str() {
            "dev" => Ok(RuntimeEnv::Dev),
            "test" => Ok(RuntimeEnv::Test),
            "prod" => Ok(RuntimeEnv::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }

    /// Validates CP_HTTP_ADDR resolves to a socket address without actually
    /// binding it (binding is the server's job).
    pub fn validate_http_addr(&self) -> Result<(), ConfigError> {
        let addr = normalize_addr(&self.http_addr);
        addr.to_socket_addrs()
            .map(|_| ())
            .map_err(|e| ConfigError::InvalidHttpAddr(self.http_addr.clone(), e))
    }

    pub fn is_in_cluster(&self) -> bool {
        self.in_cluster || std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
    }

    /// POD_NAMESPACE takes priority over CP_NAMESPACE, mirroring the
    /// downward-API convention of reading the namespace from a projected file
    /// or env var before falling back to an explicit override.
    pub fn resolved_namespace(&self) -> Result<String, ConfigError> {
        let ns = if !self.pod_namespace.is_empty() {
            self.pod_namespace.clone()
        } else {
            self.namespace.clone()
        };
        if ns.is_empty() && self.is_in_cluster() {
            return Err(ConfigError::NamespaceRequired);
        }
        Ok(ns)
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn normalize_addr(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix(':') {
        format!("127.0.0.1:{rest}")
    } else {
        addr.to_string()
    }
}

/// Loads a `.env` file from the working directory if present. Missing or
/// unreadable files are not fatal, mirroring `godotenv.Load()`'s behavior in
/// the original implementation.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(_) | Err(dotenvy::Error::Io(_)) => {}
        Err(e) => eprintln!("warning: failed to load .env file: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(env: &str, addr: &str) -> ControlPlaneArgs {
        ControlPlaneArgs {
            env: env.to_string(),
            http_addr: addr.to_string(),
            namespace: String::new(),
            pod_namespace: String::new(),
            in_cluster: false,
            bootstrap_token: String::new(),
            audit_log_path: String::new(),
            github_egress_cidrs: String::new(),
            cors_origins: String::new(),
        }
    }

    #[test]
    fn runtime_env_accepts_only_known_values() {
        assert!(matches!(args("dev", ":8080").runtime_env(), Ok(RuntimeEnv::Dev)));
        assert!(matches!(args("test", ":8080").runtime_env(), Ok(RuntimeEnv::Test)));
        assert!(matches!(args("prod", ":8080").runtime_env(), Ok(RuntimeEnv::Prod)));
        assert!(args("staging", ":8080").runtime_env().is_err());
    }

    #[test]
    fn http_addr_with_bare_port_resolves() {
        assert!(args("dev", ":8080").validate_http_addr().is_ok());
    }

    #[test]
    fn http_addr_garbage_is_rejected() {
        assert!(args("dev", "not an address").validate_http_addr().is_err());
    }

    #[test]
    fn namespace_required_only_when_in_cluster() {
        let mut a = args("dev", ":8080");
        assert_eq!(a.resolved_namespace().unwrap(), "");
        a.in_cluster = true;
        assert!(a.resolved_namespace().is_err());
        a.pod_namespace = "prod".to_string();
        assert_eq!(a.resolved_namespace().unwrap(), "prod");
    }

    #[test]
    fn pod_namespace_takes_priority_over_namespace() {
        let mut a = args("dev", ":8080");
        a.namespace = "explicit".to_string();
        a.pod_namespace = "downward-api".to_string();
        assert_eq!(a.resolved_namespace().unwrap(), "downward-api");
    }

    #[test]
    fn cors_origin_list_splits_and_trims_csv() {
        let mut a = args("dev", ":8080");
        a.cors_origins = " https://a.example , https://b.example,,".to_string();
        assert_eq!(
            a.cors_origin_list(),
            vec!["https://a.example", "https://b.example"]
        );
    }
}
