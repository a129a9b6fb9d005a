//! Workload descriptions.
//!
//! A workload is immutable once received. Its identity is the SHA-256 of its
//! canonical JSON form, so a workload that keeps its name but changes any
//! field is a different workload.

use std::collections::BTreeMap;

use flotta_id::WorkloadId;
use serde::{Deserialize, Serialize};

/// Something the device should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Workload {
    Pod(PodWorkload),
    Ansible(AnsibleWorkload),
}

/// A pod: one or more containers described by a YAML specification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodWorkload {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub configmaps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registries: Option<ImageRegistries>,
    /// Opaque YAML pod specification.
    pub specification: String,
    /// Five-field cron expression restricting when the pod is reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<BTreeMap<String, String>>,
}

/// Reference to registry credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRegistries {
    pub auth_file: String,
}

/// An Ansible playbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnsibleWorkload {
    pub name: String,
    pub playbook: String,
}

impl Workload {
    pub fn name(&self) -> &str {
        match self {
            Workload::Pod(pod) => &pod.name,
            Workload::Ansible(ansible) => &ansible.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Workload::Pod(_) => "pod",
            Workload::Ansible(_) => "ansible",
        }
    }

    pub fn cron(&self) -> Option<&str> {
        match self {
            Workload::Pod(pod) => pod.cron.as_deref(),
            Workload::Ansible(_) => None,
        }
    }

    /// Hex SHA-256 of the canonical JSON serialization.
    pub fn hash(&self) -> String {
        self.id().to_string()
    }

    /// The workload's identity, equal to its [`Workload::hash`].
    pub fn id(&self) -> WorkloadId {
        // Strings and string maps always serialize.
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        WorkloadId::from_digest(&flotta_reconcile::content_digest(&value))
    }

    /// CPU limit in millicores, `None` when unlimited.
    pub fn cpu_limit(&self) -> Option<u64> {
        match self {
            Workload::Pod(pod) => pod.cpu_limit(),
            Workload::Ansible(_) => None,
        }
    }
}

impl From<PodWorkload> for Workload {
    fn from(pod: PodWorkload) -> Self {
        Workload::Pod(pod)
    }
}

impl From<AnsibleWorkload> for Workload {
    fn from(ansible: AnsibleWorkload) -> Self {
        Workload::Ansible(ansible)
    }
}

impl PodWorkload {
    /// Sum of the containers' CPU limits in millicores.
    ///
    /// Returns `None` when the specification does not parse or any container
    /// has no limit.
    pub fn cpu_limit(&self) -> Option<u64> {
        let doc: serde_yaml::Value = serde_yaml::from_str(&self.specification).ok()?;
        let spec = doc.get("spec").unwrap_or(&doc);
        let containers = spec.get("containers")?.as_sequence()?;
        if containers.is_empty() {
            return None;
        }

        containers.iter().try_fold(0u64, |total, container| {
            let cpu = container.get("resources")?.get("limits")?.get("cpu")?;
            total.checked_add(parse_cpu_quantity(cpu)?)
        })
    }
}

/// Largest accepted CPU quantity, in millicores.
pub const MAX_CPU_MILLICORES: u64 = 1 << 40;

/// Parse a CPU quantity (`2`, `0.5`, `"250m"`) into millicores.
pub fn parse_cpu_quantity(value: &serde_yaml::Value) -> Option<u64> {
    let millicores = match value {
        serde_yaml::Value::Number(n) => n.as_f64()? * 1000.0,
        serde_yaml::Value::String(s) => {
            let s = s.trim();
            match s.strip_suffix('m') {
                Some(milli) => milli.parse::<f64>().ok()?,
                None => s.parse::<f64>().ok()? * 1000.0,
            }
        }
        _ => return None,
    };

    if !millicores.is_finite() || millicores <= 0.0 || millicores > MAX_CPU_MILLICORES as f64 {
        return None;
    }
    Some(millicores.round() as u64)
}
