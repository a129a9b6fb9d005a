//! End-to-end tests for the controller against a mocked control plane.
//!
//! The controller talks HTTP to a wiremock server, forwards the fetched
//! configuration to a real scheduler, and reports the scheduler's job
//! status back in the next heartbeat.

use std::sync::Arc;
use std::time::Duration;

use flotta_device_agent::certificate::{CertificateManager, ClientMaterial};
use flotta_device_agent::client::HttpControlPlaneClient;
use flotta_device_agent::controller::{Controller, ControllerChannels, ControllerConfig, Phase};
use flotta_device_agent::metrics::ProfileConfig;
use flotta_device_agent::scheduler::SchedulerConfig;
use flotta_device_agent::{MockExecutor, MockResourceManager, Scheduler, SystemClock};
use flotta_id::DeviceId;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEVICE: &str = "edge-42";

fn out_path() -> String {
    format!("/api/flotta-management/v1/data/{DEVICE}/out")
}

fn in_path() -> String {
    format!("/api/flotta-management/v1/data/{DEVICE}/in")
}

/// A CA and a client certificate it signed.
fn certificates() -> Arc<CertificateManager> {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "flotta-ca");
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, DEVICE);
    let cert = params.signed_by(&key, &ca, &ca_key).unwrap();

    let material = ClientMaterial::from_pem(&cert.pem(), &key.serialize_pem()).unwrap();
    Arc::new(CertificateManager::from_pem(&ca.pem(), Some(material)).unwrap())
}

fn configuration() -> serde_json::Value {
    json!({
        "directive": "configuration",
        "content": {
            "deviceID": DEVICE,
            "version": "3",
            "configuration": {
                "heartbeat": { "period-seconds": 2 }
            },
            "workloads": [{
                "name": "web",
                "namespace": "default",
                "specification": "containers: [nginx]"
            }]
        }
    })
}

struct Agent {
    controller: Controller,
    scheduler: Scheduler,
    desired_rx: mpsc::Receiver<flotta_device_agent::DesiredStateMessage>,
    _profiles_rx: watch::Receiver<ProfileConfig>,
}

fn agent(server: &MockServer) -> Agent {
    let certificates = certificates();
    let control_plane = Arc::new(
        HttpControlPlaneClient::new(server.uri(), certificates.clone(), Duration::from_secs(2))
            .unwrap(),
    );

    let scheduler = Scheduler::new(
        Arc::new(MockExecutor::new()),
        Arc::new(MockResourceManager::new()),
        Arc::new(SystemClock),
        SchedulerConfig::default(),
    );

    let (desired_tx, desired_rx) = mpsc::channel(4);
    let (profiles_tx, profiles_rx) = watch::channel(ProfileConfig::default());
    let controller = Controller::new(
        DeviceId::parse(DEVICE).unwrap(),
        control_plane,
        certificates,
        ControllerChannels {
            desired_tx,
            profiles_tx,
            status_rx: scheduler.subscribe(),
        },
        Arc::new(SystemClock),
        ControllerConfig::default(),
    );

    Agent {
        controller,
        scheduler,
        desired_rx,
        _profiles_rx: profiles_rx,
    }
}

#[tokio::test]
async fn test_heartbeat_reports_deployed_workload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(out_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(in_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(configuration()))
        .mount(&server)
        .await;

    let mut agent = agent(&server);
    assert_eq!(agent.controller.phase(), Phase::Operating);

    // First round: nothing deployed yet, the configuration arrives.
    agent.controller.step().await.unwrap();
    let message = agent.desired_rx.recv().await.unwrap();
    assert!(agent.scheduler.apply_message(message));
    agent.scheduler.tick().await;

    // Second round: the heartbeat carries the running workload.
    agent.controller.step().await.unwrap();
    assert_eq!(agent.controller.period(), Duration::from_secs(2));

    let heartbeats: Vec<serde_json::Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(heartbeats.len(), 2);

    assert_eq!(heartbeats[0]["directive"], "heartbeat");
    assert_eq!(heartbeats[0]["content"]["version"], "");
    assert_eq!(heartbeats[0]["content"]["workloads"], json!([]));

    let content = &heartbeats[1]["content"];
    assert_eq!(content["status"], "up");
    assert_eq!(content["version"], "3");
    assert_eq!(content["workloads"][0]["name"], "web");
    assert_eq!(content["workloads"][0]["status"], "Running");
}

#[tokio::test]
async fn test_rejected_certificate_rewinds_to_registration() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(out_path()))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let mut agent = agent(&server);
    let err = agent.controller.step().await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(agent.controller.phase(), Phase::Registering);
    assert_eq!(agent.controller.next_delay(), Duration::from_secs(1));
}

#[tokio::test]
async fn test_unreachable_server_keeps_operating() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(out_path()))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut agent = agent(&server);
    for expected in [1, 2, 4, 8] {
        assert!(agent.controller.step().await.is_err());
        assert_eq!(agent.controller.phase(), Phase::Operating);
        assert_eq!(agent.controller.next_delay(), Duration::from_secs(expected));
    }
}
