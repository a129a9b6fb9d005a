//! Control plane API client for the device agent.
//!
//! Every exchange goes through two endpoints per device:
//! - `POST .../data/{device}/out` carries a [`Message`] (enrolment,
//!   registration, heartbeat)
//! - `GET .../data/{device}/in` returns the device configuration
//!
//! The HTTP client is rebuilt whenever the client certificate changes, so a
//! freshly registered certificate is used from the next request on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotta_id::DeviceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::certificate::CertificateManager;
use crate::hardware::HardwareInfo;
use crate::heartbeat::Heartbeat;
use crate::scheduler::DesiredSet;
use crate::workload::{ImageRegistries, PodWorkload, Workload};

const API_PREFIX: &str = "api/flotta-management/v1/data";

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// 401 or 403: the client certificate is not accepted.
    #[error("{operation} unauthorized (status {status})")]
    Unauthorized { operation: &'static str, status: u16 },

    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to decode {operation} response: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized { .. })
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Envelope for everything the device sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub content: serde_json::Value,
    pub directive: String,
    #[serde(alias = "message-id")]
    pub message_id: String,
    pub sent: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
}

impl Message {
    /// A `command` message with a fresh ID.
    pub fn command(directive: &str, content: serde_json::Value) -> Self {
        Self {
            content,
            directive: directive.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            sent: Utc::now(),
            kind: "command".to_string(),
            version: 1,
        }
    }
}

/// Envelope for everything the control plane returns.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub directive: Option<String>,
    #[serde(default, alias = "message-id")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Enrolment request content.
#[derive(Debug, Clone, Serialize)]
pub struct EnrolmentInfo {
    #[serde(rename = "targetNamespace")]
    pub target_namespace: String,
    pub features: EnrolmentFeatures,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrolmentFeatures {
    pub hardware: HardwareInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceConfigurationMessage {
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    #[serde(default)]
    pub version: String,
    /// Seconds between metric samples.
    #[serde(rename = "workloads-monitoring-interval", default)]
    pub workloads_monitoring_interval: Option<u64>,
    #[serde(default)]
    pub configuration: DeviceConfiguration,
    #[serde(default)]
    pub workloads: Vec<WorkloadDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceConfiguration {
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfiguration>,
    #[serde(default)]
    pub profiles: Vec<DeviceProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HeartbeatConfiguration {
    #[serde(rename = "period-seconds", default)]
    pub period_seconds: Option<u64>,
    #[serde(rename = "hardware-profile", default)]
    pub hardware_profile: Option<HardwareProfileConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HardwareProfileConfiguration {
    #[serde(default)]
    pub include: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<ProfileCondition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProfileCondition {
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkloadDescriptor {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub configmaps: Vec<String>,
    #[serde(rename = "image-registries", default)]
    pub image_registries: Option<ImageRegistriesDescriptor>,
    pub specification: String,
    #[serde(default)]
    pub cron: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageRegistriesDescriptor {
    #[serde(rename = "auth-file", default)]
    pub auth_file: Option<String>,
}

impl From<WorkloadDescriptor> for Workload {
    fn from(descriptor: WorkloadDescriptor) -> Self {
        Workload::Pod(PodWorkload {
            name: descriptor.name,
            namespace: descriptor.namespace,
            annotations: descriptor.annotations,
            labels: descriptor.labels,
            configmaps: descriptor.configmaps,
            image_registries: descriptor
                .image_registries
                .and_then(|r| r.auth_file)
                .map(|auth_file| ImageRegistries { auth_file }),
            specification: descriptor.specification,
            cron: descriptor.cron.filter(|c| !c.trim().is_empty()),
            secrets: None,
        })
    }
}

impl DeviceConfigurationMessage {
    pub fn desired_set(&self) -> DesiredSet {
        DesiredSet::from_workloads(self.workloads.iter().cloned().map(Workload::from))
    }

    pub fn heartbeat_period(&self) -> Option<Duration> {
        self.configuration
            .heartbeat
            .as_ref()?
            .period_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn include_hardware(&self) -> bool {
        self.configuration
            .heartbeat
            .as_ref()
            .and_then(|h| h.hardware_profile.as_ref())
            .is_some_and(|p| p.include)
    }

    pub fn monitoring_interval(&self) -> Option<Duration> {
        self.workloads_monitoring_interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

// =============================================================================
// Client
// =============================================================================

/// Operations the controller needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn enrol(&self, device_id: &DeviceId, info: &EnrolmentInfo) -> Result<(), TransportError>;

    /// Submit a CSR; returns the signed certificate PEM.
    async fn register(&self, device_id: &DeviceId, csr_pem: &str) -> Result<String, TransportError>;

    async fn heartbeat(&self, device_id: &DeviceId, heartbeat: &Heartbeat) -> Result<(), TransportError>;

    async fn get_configuration(
        &self,
        device_id: &DeviceId,
    ) -> Result<DeviceConfigurationMessage, TransportError>;
}

struct TaggedClient {
    /// Client certificate signature the client was built with.
    signature: Option<String>,
    client: reqwest::Client,
}

/// HTTP implementation of [`ControlPlane`].
pub struct HttpControlPlaneClient {
    base_url: String,
    certificates: Arc<CertificateManager>,
    timeout: Duration,
    current: ArcSwap<TaggedClient>,
}

impl HttpControlPlaneClient {
    pub fn new(
        base_url: impl Into<String>,
        certificates: Arc<CertificateManager>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let initial = build_client(&certificates, timeout)?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            certificates,
            timeout,
            current: ArcSwap::from_pointee(initial),
        })
    }

    fn url(&self, device_id: &DeviceId, direction: &str) -> String {
        format!("{}/{API_PREFIX}/{device_id}/{direction}", self.base_url)
    }

    /// The HTTP client for the current certificate, rebuilt on change.
    fn client(&self) -> Result<reqwest::Client, TransportError> {
        let signature = self.certificates.signature();
        let current = self.current.load();
        if current.signature == signature {
            return Ok(current.client.clone());
        }

        info!(signature = ?signature, "Client certificate changed, rebuilding HTTP client");
        let rebuilt = build_client(&self.certificates, self.timeout)?;
        let client = rebuilt.client.clone();
        self.current.store(Arc::new(rebuilt));
        Ok(client)
    }

    async fn post_message(
        &self,
        operation: &'static str,
        device_id: &DeviceId,
        message: &Message,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self.url(device_id, "out");
        debug!(url = %url, directive = %message.directive, message_id = %message.message_id, "Posting message");

        let response = self.client()?.post(&url).json(message).send().await?;
        check_status(operation, response).await
    }
}

fn build_client(
    certificates: &CertificateManager,
    timeout: Duration,
) -> Result<TaggedClient, TransportError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .timeout(timeout);

    for der in certificates.ca_certificates() {
        let cert = reqwest::Certificate::from_der(der).map_err(|e| TransportError::Tls(e.to_string()))?;
        builder = builder.add_root_certificate(cert);
    }

    let material = certificates.client();
    if let Some(material) = &material {
        let identity = reqwest::Identity::from_pem(&material.identity_pem())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        builder = builder.identity(identity);
    }

    let client = builder
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(TaggedClient {
        signature: material.map(|m| m.signature().to_string()),
        client,
    })
}

async fn check_status(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(TransportError::Unauthorized {
            operation,
            status: status.as_u16(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    error!(operation, status = %status, body = %body, "Control plane request failed");
    Err(TransportError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode {
        operation,
        reason: e.to_string(),
    })
}

fn to_content<T: Serialize>(operation: &'static str, value: &T) -> Result<serde_json::Value, TransportError> {
    serde_json::to_value(value).map_err(|e| TransportError::Decode {
        operation,
        reason: e.to_string(),
    })
}

#[async_trait]
impl ControlPlane for HttpControlPlaneClient {
    async fn enrol(&self, device_id: &DeviceId, info: &EnrolmentInfo) -> Result<(), TransportError> {
        let message = Message::command("enrolment", to_content("enrolment", info)?);
        self.post_message("enrolment", device_id, &message).await?;
        Ok(())
    }

    async fn register(&self, device_id: &DeviceId, csr_pem: &str) -> Result<String, TransportError> {
        let content = serde_json::json!({ "certificate_request": csr_pem });
        let message = Message::command("registration", content);
        let response = self.post_message("registration", device_id, &message).await?;

        let body: MessageResponse = decode("registration", response).await?;
        body.content
            .get("certificate")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Decode {
                operation: "registration",
                reason: "response carries no certificate".to_string(),
            })
    }

    async fn heartbeat(&self, device_id: &DeviceId, heartbeat: &Heartbeat) -> Result<(), TransportError> {
        let message = Message::command("heartbeat", to_content("heartbeat", heartbeat)?);
        self.post_message("heartbeat", device_id, &message).await?;
        Ok(())
    }

    async fn get_configuration(
        &self,
        device_id: &DeviceId,
    ) -> Result<DeviceConfigurationMessage, TransportError> {
        let url = self.url(device_id, "in");
        debug!(url = %url, "Fetching device configuration");

        let response = self.client()?.get(&url).send().await?;
        let response = check_status("configuration", response).await?;
        let body: MessageResponse = decode("configuration", response).await?;

        let configuration: DeviceConfigurationMessage = serde_json::from_value(body.content)
            .map_err(|e| TransportError::Decode {
                operation: "configuration",
                reason: e.to_string(),
            })?;
        debug!(
            version = %configuration.version,
            workload_count = configuration.workloads.len(),
            "Fetched device configuration"
        );
        Ok(configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::test_support::TestCa;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DEVICE: &str = "5c1f3a0e9d2b4d3c8f1e2a7b6c5d4e3f";

    fn device_id() -> DeviceId {
        DeviceId::parse(DEVICE).unwrap()
    }

    fn out_path() -> String {
        format!("/{API_PREFIX}/{DEVICE}/out")
    }

    fn in_path() -> String {
        format!("/{API_PREFIX}/{DEVICE}/in")
    }

    fn client(server: &MockServer) -> (HttpControlPlaneClient, Arc<CertificateManager>, TestCa) {
        let ca = TestCa::new();
        let certificates = Arc::new(CertificateManager::from_pem(&ca.pem(), None).unwrap());
        let client =
            HttpControlPlaneClient::new(server.uri(), certificates.clone(), Duration::from_secs(2))
                .unwrap();
        (client, certificates, ca)
    }

    fn configuration_body() -> serde_json::Value {
        json!({
            "directive": "configuration",
            "content": {
                "deviceID": DEVICE,
                "version": "7",
                "workloads-monitoring-interval": 30,
                "configuration": {
                    "heartbeat": {
                        "period-seconds": 5,
                        "hardware-profile": { "include": true }
                    },
                    "profiles": [{
                        "name": "power",
                        "conditions": [{ "name": "low", "expression": "cpu_cores < 2" }]
                    }]
                },
                "workloads": [{
                    "name": "web",
                    "namespace": "default",
                    "labels": { "app": "web" },
                    "image-registries": { "auth-file": "/etc/auth.json" },
                    "specification": "containers: []"
                }]
            }
        })
    }

    #[test]
    fn test_message_serialization() {
        let message = Message::command("heartbeat", json!({"status": "up"}));
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "command");
        assert_eq!(value["directive"], "heartbeat");
        assert_eq!(value["version"], 1);
        assert_eq!(value["message_id"].as_str().unwrap().len(), 36);
    }

    #[test]
    fn test_configuration_decoding() {
        let body: MessageResponse = serde_json::from_value(configuration_body()).unwrap();
        let config: DeviceConfigurationMessage = serde_json::from_value(body.content).unwrap();

        assert_eq!(config.version, "7");
        assert_eq!(config.heartbeat_period(), Some(Duration::from_secs(5)));
        assert_eq!(config.monitoring_interval(), Some(Duration::from_secs(30)));
        assert!(config.include_hardware());
        assert_eq!(config.configuration.profiles[0].conditions[0].name, "low");

        let workload = Workload::from(config.workloads[0].clone());
        let Workload::Pod(pod) = &workload else {
            panic!("expected pod workload");
        };
        assert_eq!(pod.image_registries.as_ref().unwrap().auth_file, "/etc/auth.json");
        assert_eq!(config.desired_set().len(), 1);
    }

    #[test]
    fn test_empty_configuration_defaults() {
        let config: DeviceConfigurationMessage = serde_json::from_value(json!({})).unwrap();
        assert!(config.desired_set().is_empty());
        assert_eq!(config.heartbeat_period(), None);
        assert!(!config.include_hardware());
    }

    #[tokio::test]
    async fn test_get_configuration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(in_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(configuration_body()))
            .mount(&server)
            .await;

        let (client, _, _) = client(&server);
        let config = client.get_configuration(&device_id()).await.unwrap();

        assert_eq!(config.device_id, DEVICE);
        assert_eq!(config.workloads.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_posts_command() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(out_path()))
            .and(body_partial_json(json!({"directive": "heartbeat", "type": "command"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _, _) = client(&server);
        let heartbeat = Heartbeat::build(&[], "1", None, Utc::now());
        client.heartbeat(&device_id(), &heartbeat).await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_is_distinguished() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(in_path()))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(out_path()))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (client, _, _) = client(&server);
        let err = client.get_configuration(&device_id()).await.unwrap_err();
        assert!(err.is_unauthorized());

        let heartbeat = Heartbeat::build(&[], "1", None, Utc::now());
        let err = client.heartbeat(&device_id(), &heartbeat).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_malformed_configuration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(in_path()))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let (client, _, _) = client(&server);
        let err = client.get_configuration(&device_id()).await.unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_register_returns_certificate_and_rebuilds_client() {
        let server = MockServer::start().await;
        let (client, certificates, ca) = client(&server);
        let request = certificates.create_csr(&device_id()).unwrap();
        let signed = ca.sign(&request, DEVICE);

        Mock::given(method("POST"))
            .and(path(out_path()))
            .and(body_partial_json(json!({"directive": "registration"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": { "certificate": signed }
            })))
            .mount(&server)
            .await;

        let pem = client.register(&device_id(), &request.csr_pem).await.unwrap();
        assert_eq!(pem, signed);

        assert!(client.current.load().signature.is_none());
        certificates.install_certificate(&request, &pem).unwrap();
        client.client().unwrap();
        assert_eq!(client.current.load().signature, certificates.signature());
    }

    #[tokio::test]
    async fn test_register_without_certificate_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(out_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": {}})))
            .mount(&server)
            .await;

        let (client, _, _) = client(&server);
        let err = client.register(&device_id(), "csr").await.unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
    }
}
