//! End-to-end linking test.
//!
//! Runs the full deployment flow against an in-process two-node cluster:
//!
//! 1. Deploy a search stack (elasticsearch + logstash-style ingest + a
//!    dashboard) to node1 and verify convergence.
//! 2. Send messages through the ingest port and prove they arrive in the
//!    search index via the declared link.
//! 3. Relocate the search index to node2 with a brand-new config, verify
//!    convergence again, and prove the link still works with the previously
//!    delivered records declared as prior state.
//!
//! The "nodes" are axum servers speaking the node unit API; applications
//! become active after a short delay so verification genuinely polls. One
//! shared record set backs the search index on whichever node it runs,
//! standing in for the data volume that moves with the application.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p stevedore-e2e --test linking
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use stevedore_engine::client::{StartApplicationRequest, UnitsResponse};
use stevedore_engine::{
    ConvergenceDriver, DeploymentVerifier, LinkCheck, LinkError, LinkVerifier, NodeClient,
    SearchIndexProbe, TcpLineSender, VerificationError, VerifyOpts,
};
use stevedore_model::{
    expected_state, resolve_unit, ActivationState, ApplicationCatalog, ApplicationConfig,
    DeploymentConfig, Link, PortMapping, Unit, VolumeSpec, CONFIG_VERSION, DEFAULT_VOLUME_ROOT,
};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;

/// How long a fake node takes to move a unit from activating to active.
const ACTIVATION_DELAY: Duration = Duration::from_millis(300);

/// How long the fake search index takes to make an ingested line queryable.
const INGEST_DELAY: Duration = Duration::from_millis(150);

type UnitMap = Arc<Mutex<BTreeMap<String, Unit>>>;
type Records = Arc<Mutex<BTreeSet<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stevedore_engine=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn volume_root() -> &'static std::path::Path {
    std::path::Path::new(DEFAULT_VOLUME_ROOT)
}

// ---------------------------------------------------------------------------
// Fake node: the per-node unit API.
// ---------------------------------------------------------------------------

async fn start_application(
    State(units): State<UnitMap>,
    Path(name): Path<String>,
    Json(request): Json<StartApplicationRequest>,
) -> StatusCode {
    if request.version != CONFIG_VERSION {
        return StatusCode::UNPROCESSABLE_ENTITY;
    }

    let target = resolve_unit(&name, &request.application, volume_root());
    let mut starting = target.clone();
    starting.activation_state = ActivationState::Activating;
    units.lock().unwrap().insert(name.clone(), starting);

    // Converge to active after a delay, like a real container start.
    let units = Arc::clone(&units);
    tokio::spawn(async move {
        tokio::time::sleep(ACTIVATION_DELAY).await;
        let mut map = units.lock().unwrap();
        if let Some(unit) = map.get_mut(&name) {
            *unit = target;
        }
    });

    StatusCode::OK
}

async fn stop_application(State(units): State<UnitMap>, Path(name): Path<String>) -> StatusCode {
    if units.lock().unwrap().remove(&name).is_some() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn list_units(State(units): State<UnitMap>) -> Json<UnitsResponse> {
    Json(UnitsResponse {
        units: units.lock().unwrap().values().cloned().collect(),
        observed_at: Utc::now(),
    })
}

/// Start one fake node; returns its node identifier (host:port) and a handle
/// on its unit map.
async fn spawn_node() -> (String, UnitMap) {
    let units: UnitMap = Arc::new(Mutex::new(BTreeMap::new()));
    let app = Router::new()
        .route(
            "/v1/applications/{name}",
            put(start_application).delete(stop_application),
        )
        .route("/v1/units", get(list_units))
        .with_state(Arc::clone(&units));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr.to_string(), units)
}

// ---------------------------------------------------------------------------
// Fake search index: answers wherever the elasticsearch unit is active.
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct StoreState {
    cluster: Vec<UnitMap>,
    records: Records,
}

impl StoreState {
    fn index_active(&self) -> bool {
        self.cluster.iter().any(|units| {
            units.lock().unwrap().values().any(|unit| {
                unit.name == "elasticsearch" && unit.activation_state == ActivationState::Active
            })
        })
    }
}

async fn store_ping(State(state): State<StoreState>) -> StatusCode {
    if state.index_active() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn store_search(State(state): State<StoreState>) -> (StatusCode, Json<serde_json::Value>) {
    if !state.index_active() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({})));
    }

    let hits: Vec<serde_json::Value> = state
        .records
        .lock()
        .unwrap()
        .iter()
        .map(|message| serde_json::json!({ "_source": { "message": message } }))
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({ "hits": { "total": hits.len(), "hits": hits } })),
    )
}

async fn spawn_store(cluster: Vec<UnitMap>, records: Records) -> u16 {
    let app = Router::new()
        .route("/", get(store_ping))
        .route("/_search", get(store_search))
        .with_state(StoreState { cluster, records });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Line-oriented ingest socket: every received line becomes a queryable
/// record after a short delay.
async fn spawn_ingest(records: Records) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let records = Arc::clone(&records);
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.is_empty() {
                        continue;
                    }
                    let records = Arc::clone(&records);
                    tokio::spawn(async move {
                        tokio::time::sleep(INGEST_DELAY).await;
                        records.lock().unwrap().insert(line);
                    });
                }
            });
        }
    });
    port
}

// ---------------------------------------------------------------------------
// Cluster fixture.
// ---------------------------------------------------------------------------

struct FakeCluster {
    node1: String,
    node2: String,
    es_port: u16,
    log_port: u16,
    records: Records,
}

impl FakeCluster {
    async fn start() -> Self {
        init_tracing();

        let (node1, units1) = spawn_node().await;
        let (node2, units2) = spawn_node().await;
        let records: Records = Arc::new(Mutex::new(BTreeSet::new()));
        let es_port = spawn_store(vec![units1, units2], Arc::clone(&records)).await;
        let log_port = spawn_ingest(Arc::clone(&records)).await;

        Self {
            node1,
            node2,
            es_port,
            log_port,
            records,
        }
    }

    fn deployment(&self, node1_apps: &[&str], node2_apps: &[&str]) -> DeploymentConfig {
        DeploymentConfig {
            version: CONFIG_VERSION,
            nodes: BTreeMap::from([
                (
                    self.node1.clone(),
                    node1_apps.iter().map(|s| s.to_string()).collect(),
                ),
                (
                    self.node2.clone(),
                    node2_apps.iter().map(|s| s.to_string()).collect(),
                ),
            ]),
        }
    }

    fn opts(&self) -> VerifyOpts {
        VerifyOpts {
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
        }
    }

    fn link_verifier(&self) -> LinkVerifier<SearchIndexProbe, TcpLineSender> {
        LinkVerifier::new(
            SearchIndexProbe::new("127.0.0.1", self.es_port),
            TcpLineSender::new("127.0.0.1", self.log_port),
        )
    }

    fn link_check(&self, prior: BTreeSet<String>) -> LinkCheck {
        LinkCheck {
            prior,
            messages: messages(),
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
        }
    }
}

fn elk_catalog(es_port: u16, log_port: u16) -> ApplicationCatalog {
    let mut applications = BTreeMap::new();
    applications.insert(
        "elasticsearch".to_string(),
        ApplicationConfig {
            image: "clusterhq/elasticsearch".to_string(),
            ports: vec![PortMapping {
                internal: 9200,
                external: es_port,
            }],
            links: vec![],
            environment: BTreeMap::new(),
            volume: Some(VolumeSpec {
                mountpoint: std::path::PathBuf::from("/var/lib/elasticsearch"),
            }),
        },
    );
    applications.insert(
        "logging".to_string(),
        ApplicationConfig {
            image: "clusterhq/logstash".to_string(),
            ports: vec![PortMapping {
                internal: 5000,
                external: log_port,
            }],
            links: vec![Link {
                local_port: 9200,
                remote_port: es_port,
                alias: "es".to_string(),
            }],
            environment: BTreeMap::new(),
            volume: None,
        },
    );
    applications.insert(
        "dashboard".to_string(),
        ApplicationConfig {
            image: "clusterhq/kibana".to_string(),
            ports: vec![PortMapping {
                internal: 8080,
                external: 8880,
            }],
            links: vec![],
            environment: BTreeMap::new(),
            volume: None,
        },
    );
    ApplicationCatalog {
        version: CONFIG_VERSION,
        applications,
    }
}

fn messages() -> BTreeSet<String> {
    BTreeSet::from([
        r#"{"firstname": "Joe", "lastname": "Bloggs"}"#.to_string(),
        r#"{"firstname": "Fred", "lastname": "Bloggs"}"#.to_string(),
    ])
}

// ---------------------------------------------------------------------------
// Tests.
// ---------------------------------------------------------------------------

/// The full flow: deploy, verify, prove the link, relocate the search index
/// to the other node, verify again, prove the link again.
#[tokio::test]
async fn e2e_linking_survives_relocation() {
    let cluster = FakeCluster::start().await;
    let catalog = elk_catalog(cluster.es_port, cluster.log_port);

    let client = NodeClient::new();
    let driver = ConvergenceDriver::new(client.clone());
    let verifier = DeploymentVerifier::new(client.clone());

    // Everything starts on node1.
    let initial = cluster.deployment(&["elasticsearch", "logging", "dashboard"], &[]);
    let ack = driver.apply(&initial, &catalog).await.unwrap();
    assert_eq!(ack.changed, vec![cluster.node1.clone()]);

    let expected = expected_state(&initial, &catalog, volume_root()).unwrap();
    verifier.verify(&expected, cluster.opts()).await.unwrap();

    cluster
        .link_verifier()
        .verify(&cluster.link_check(BTreeSet::new()))
        .await
        .unwrap();
    assert_eq!(*cluster.records.lock().unwrap(), messages());

    // Relocate the search index. A relocation is a brand-new config with
    // the application listed under the other node.
    let moved = cluster.deployment(&["logging", "dashboard"], &["elasticsearch"]);
    let ack = driver.apply(&moved, &catalog).await.unwrap();
    assert_eq!(ack.changed.len(), 2, "both nodes had a delta: {ack:?}");

    let expected = expected_state(&moved, &catalog, volume_root()).unwrap();
    verifier.verify(&expected, cluster.opts()).await.unwrap();

    // The link resolves by alias, so the same check passes against the new
    // location; the first delivery is declared as prior state.
    cluster
        .link_verifier()
        .verify(&cluster.link_check(messages()))
        .await
        .unwrap();
    assert_eq!(*cluster.records.lock().unwrap(), messages());
}

/// Re-submitting an applied config issues nothing.
#[tokio::test]
async fn e2e_reapplying_same_config_is_a_noop() {
    let cluster = FakeCluster::start().await;
    let catalog = elk_catalog(cluster.es_port, cluster.log_port);

    let client = NodeClient::new();
    let driver = ConvergenceDriver::new(client.clone());

    let config = cluster.deployment(&["elasticsearch"], &[]);
    let ack = driver.apply(&config, &catalog).await.unwrap();
    assert_eq!(ack.changed, vec![cluster.node1.clone()]);

    let expected = expected_state(&config, &catalog, volume_root()).unwrap();
    DeploymentVerifier::new(client.clone())
        .verify(&expected, cluster.opts())
        .await
        .unwrap();

    let ack = driver.apply(&config, &catalog).await.unwrap();
    assert!(ack.changed.is_empty(), "no delta expected: {ack:?}");
    assert_eq!(ack.unchanged.len(), 2);
    assert!(ack.unchanged.contains(&cluster.node1));
    assert!(ack.unchanged.contains(&cluster.node2));
}

/// Two separate deploy invocations: the second driver starts with no
/// memory of the first and must pick up the cluster's actual state before
/// diffing, or the relocated application is never stopped on its old node.
#[tokio::test]
async fn e2e_second_invocation_relocates_without_shared_state() {
    let cluster = FakeCluster::start().await;
    let catalog = elk_catalog(cluster.es_port, cluster.log_port);
    let client = NodeClient::new();

    let initial = cluster.deployment(&["elasticsearch"], &[]);
    let first = ConvergenceDriver::new(client.clone());
    first.sync_with_cluster(&client, &initial).await.unwrap();
    first.apply(&initial, &catalog).await.unwrap();

    let expected = expected_state(&initial, &catalog, volume_root()).unwrap();
    DeploymentVerifier::new(client.clone())
        .verify(&expected, cluster.opts())
        .await
        .unwrap();

    let moved = cluster.deployment(&[], &["elasticsearch"]);
    let second = ConvergenceDriver::new(client.clone());
    second.sync_with_cluster(&client, &moved).await.unwrap();
    let ack = second.apply(&moved, &catalog).await.unwrap();
    assert_eq!(ack.changed.len(), 2, "both nodes had a delta: {ack:?}");

    let expected = expected_state(&moved, &catalog, volume_root()).unwrap();
    DeploymentVerifier::new(client)
        .verify(&expected, cluster.opts())
        .await
        .unwrap();
}

/// Records left over from an earlier run fail the link check up front
/// instead of polluting the receipt wait.
#[tokio::test]
async fn e2e_leftover_records_fail_the_link_check() {
    let cluster = FakeCluster::start().await;
    let catalog = elk_catalog(cluster.es_port, cluster.log_port);
    cluster
        .records
        .lock()
        .unwrap()
        .insert("leftover from another run".to_string());

    let client = NodeClient::new();
    let driver = ConvergenceDriver::new(client.clone());
    let config = cluster.deployment(&["elasticsearch", "logging"], &[]);
    driver.apply(&config, &catalog).await.unwrap();

    let expected = expected_state(&config, &catalog, volume_root()).unwrap();
    DeploymentVerifier::new(client)
        .verify(&expected, cluster.opts())
        .await
        .unwrap();

    let err = cluster
        .link_verifier()
        .verify(&cluster.link_check(BTreeSet::new()))
        .await
        .unwrap_err();
    match err {
        LinkError::PriorStateViolated { found, .. } => {
            assert!(found.contains("leftover from another run"));
        }
        other => panic!("expected PriorStateViolated, got {other:?}"),
    }
}

/// Verifying against a cluster that never received the deployment times out
/// with a per-node diff naming the missing units.
#[tokio::test]
async fn e2e_unconverged_cluster_reports_diff() {
    let cluster = FakeCluster::start().await;
    let catalog = elk_catalog(cluster.es_port, cluster.log_port);

    let config = cluster.deployment(&["elasticsearch"], &[]);
    let expected = expected_state(&config, &catalog, volume_root()).unwrap();

    let opts = VerifyOpts {
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(700),
    };
    let VerificationError::Timeout { diffs, .. } = DeploymentVerifier::new(NodeClient::new())
        .verify(&expected, opts)
        .await
        .unwrap_err();

    let node1 = diffs.iter().find(|d| d.node == cluster.node1).unwrap();
    assert!(node1.missing.iter().any(|u| u.name == "elasticsearch"));
    assert!(node1.unreachable.is_none());
}
