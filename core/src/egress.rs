use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;

use crate::dns::sanitize_dns_label;
use crate::Error;
use kocao_common::{annotations, labels, MANAGER_NAME};

const GITHUB_EGRESS_CIDRS_ENV: &str = "CP_GITHUB_EGRESS_CIDRS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressMode {
    Restricted,
    Full,
}

/// Normalizes the many accepted spellings of an egress mode. Anything
/// unrecognized is treated as `Restricted` — the synthesizer fails safe,
/// never fails open.
pub fn normalize_egress_mode(mode: &str) -> EgressMode {
    match mode.trim().to_lowercase().as_str() {
        "full" | "full-internet" | "internet" => EgressMode::Full,
        _ => EgressMode::Restricted,
    }
}

pub fn run_egress_network_policy_name(run_name: &str) -> String {
    format!("{}-egress", sanitize_dns_label(run_name))
}

/// Parses `CP_GITHUB_EGRESS_CIDRS` as CSV, keeping only entries that look
/// like a CIDR (contain a `/`).
pub fn github_egress_cidrs_from_env() -> Vec<String> {
    let raw = std::env::var(GITHUB_EGRESS_CIDRS_ENV).unwrap_or_default();
    github_egress_cidrs(&raw)
}

pub fn github_egress_cidrs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| s.contains('/'))
        .collect()
}

pub fn desired_run_egress_network_policy(
    run_name: &str,
    namespace: &str,
    mode: EgressMode,
    github_cidrs: &[String],
) -> NetworkPolicy {
    let name = run_egress_network_policy_name(run_name);
    let mut lbls = BTreeMap::new();
    lbls.insert(labels::MANAGED_BY.to_string(), "kocao-control-plane".to_string());
    lbls.insert(labels::APP_NAME.to_string(), "kocao-harness".to_string());
    lbls.insert(labels::RUN_NAME.to_string(), run_name.to_string());

    let egress = match mode {
        EgressMode::Full => vec![NetworkPolicyEgressRule::default()],
        EgressMode::Restricted => {
            let mut rules = vec![dns_egress_rule()];
            if !github_cidrs.is_empty() {
                rules.push(github_cidr_egress_rule(github_cidrs));
            }
            rules
        }
    };

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(lbls),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    labels::RUN_NAME.to_string(),
                    run_name.to_string(),
                )])),
                ..Default::default()
            },
            policy_types: Some(vec!["Egress".to_string()]),
            egress: Some(egress),
            ..Default::default()
        }),
    }
}

fn dns_egress_rule() -> NetworkPolicyEgressRule {
    NetworkPolicyEgressRule {
        to: Some(vec![NetworkPolicyPeer {
            namespace_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "kubernetes.io/metadata.name".to_string(),
                    "kube-system".to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![
            NetworkPolicyPort {
                protocol: Some("UDP".to_string()),
                port: Some(IntOrString::Int(53)),
                ..Default::default()
            },
            NetworkPolicyPort {
                protocol: Some("TCP".to_string()),
                port: Some(IntOrString::Int(53)),
                ..Default::default()
            },
        ]),
    }
}

fn github_cidr_egress_rule(cidrs: &[String]) -> NetworkPolicyEgressRule {
    NetworkPolicyEgressRule {
        to: Some(
            cidrs
                .iter()
                .map(|cidr| NetworkPolicyPeer {
                    ip_block: Some(k8s_openapi::api::networking::v1::IPBlock {
                        cidr: cidr.clone(),
                        except: None,
                    }),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(vec![
            NetworkPolicyPort {
                protocol: Some("TCP".to_string()),
                port: Some(IntOrString::Int(443)),
                ..Default::default()
            },
            NetworkPolicyPort {
                protocol: Some("TCP".to_string()),
                port: Some(IntOrString::Int(22)),
                ..Default::default()
            },
        ]),
    }
}

/// Gets-or-creates the run's `NetworkPolicy`; if it already exists, overwrites
/// its labels and spec via a deterministic merge patch so repeated
/// reconciles converge rather than recreate.
pub async fn ensure_run_egress_network_policy(
    client: Client,
    namespace: &str,
    owner: OwnerReference,
    run_name: &str,
    mode: EgressMode,
    github_cidrs: &[String],
) -> Result<(), Error> {
    let mut desired = desired_run_egress_network_policy(run_name, namespace, mode, github_cidrs);
    desired.metadata.owner_references = Some(vec![owner]);
    desired.metadata.annotations = Some(BTreeMap::from([(
        annotations::CREATED_BY.to_string(),
        MANAGER_NAME.to_string(),
    )]));

    let api: Api<NetworkPolicy> = Api::namespaced(client, namespace);
    let name = desired.metadata.name.clone().unwrap();
    match api.get(&name).await {
        Ok(_) => {
            api.patch(
                &name,
                &PatchParams::apply(MANAGER_NAME),
                &Patch::Apply(&desired),
            )
            .await?;
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            api.create(&Default::default(), &desired).await?;
        }
        Err(e) => return Err(Error::from(e)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_recognizes_all_restricted_aliases() {
        for alias in ["", "github", "github-only", "restricted", "deny-by-default", "bogus"] {
            assert_eq!(normalize_egress_mode(alias), EgressMode::Restricted, "{alias}");
        }
    }

    #[test]
    fn normalize_recognizes_all_full_aliases() {
        for alias in ["full", "full-internet", "internet", "FULL"] {
            assert_eq!(normalize_egress_mode(alias), EgressMode::Full, "{alias}");
        }
    }

    #[test]
    fn full_mode_has_exactly_one_empty_egress_rule() {
        let policy = desired_run_egress_network_policy("run-a", "ns", EgressMode::Full, &[]);
        let egress = policy.spec.unwrap().egress.unwrap();
        assert_eq!(egress.len(), 1);
        assert!(egress[0].to.is_none());
        assert!(egress[0].ports.is_none());
    }

    #[test]
    fn restricted_mode_always_has_dns_rule() {
        let policy = desired_run_egress_network_policy("run-a", "ns", EgressMode::Restricted, &[]);
        let egress = policy.spec.unwrap().egress.unwrap();
        assert_eq!(egress.len(), 1);
    }

    #[test]
    fn restricted_mode_adds_github_rule_only_when_cidrs_present() {
        let cidrs = vec!["140.82.112.0/20".to_string()];
        let policy =
            desired_run_egress_network_policy("run-a", "ns", EgressMode::Restricted, &cidrs);
        let egress = policy.spec.unwrap().egress.unwrap();
        assert_eq!(egress.len(), 2);
    }

    #[test]
    fn github_egress_cidrs_drops_entries_without_a_slash() {
        let cidrs = github_egress_cidrs("140.82.112.0/20, not-a-cidr, 143.55.64.0/20");
        assert_eq!(cidrs, vec!["140.82.112.0/20", "143.55.64.0/20"]);
    }

    #[test]
    fn policy_name_is_derived_from_sanitized_run_name() {
        assert_eq!(run_egress_network_policy_name("My Run!"), "my-run-egress");
        assert_eq!(run_egress_network_policy_name(""), "run-egress");
    }
}
