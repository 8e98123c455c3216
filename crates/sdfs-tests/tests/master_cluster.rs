//! Scenario-level tests against a real `ConsensusService` + `Namespace`
//! (spec.md §8 scenarios 5 and 6): single-master self-election and
//! committed-command visibility. The namespace handle is built by the
//! test and handed to `ConsensusService::new`, so assertions read the
//! same `Arc<RwLock<Namespace>>` the service applies commands into.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sdfs_master::api::{self, MasterState};
use sdfs_master::consensus_service::ConsensusService;
use sdfs_master::replica::ReplicaManager;
use sdfs_master::upload::UploadCoordinator;
use sdfs_meta::{Command, Digest, MemoryKvStore, Namespace, NodeId, NodeRegistry, PeerId, RaftConfig, RaftLogStore};

fn single_node_service() -> (Arc<ConsensusService>, Arc<RwLock<Namespace>>) {
    std::env::set_var("RAFT_FORCE_MORE_REELECTION", "1");
    let kv = Arc::new(MemoryKvStore::new());
    let log_store = RaftLogStore::new(kv);
    let config = RaftConfig::from_env(PeerId::new(1), Vec::new());
    let namespace = Arc::new(RwLock::new(Namespace::new()));
    let registry = Arc::new(NodeRegistry::new());
    let service = Arc::new(ConsensusService::new(
        config,
        log_store,
        HashMap::new(),
        namespace.clone(),
        registry,
    ));
    (service, namespace)
}

async fn wait_for_leadership(service: &Arc<ConsensusService>) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !service.is_leader() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("single-node cluster should self-elect");
}

#[tokio::test]
async fn single_master_cluster_self_elects_without_peers() {
    let (service, _namespace) = single_node_service();
    tokio::spawn(service.clone().run_election_timer());
    wait_for_leadership(&service).await;
}

#[tokio::test]
async fn committed_add_file_is_visible_in_the_namespace() {
    let (service, namespace) = single_node_service();
    tokio::spawn(service.clone().run_election_timer());
    wait_for_leadership(&service).await;

    let digest = Digest::of_bytes(b"hello");
    service
        .submit_command(Command::AddFile {
            host_ids: vec![NodeId::new(7)],
            path: "/docs/readme.md".to_string(),
            digest: digest.clone(),
        })
        .await
        .expect("leader must accept the command");

    let ns = namespace.read();
    let file = ns.get_file("/docs/readme.md").expect("file must be visible after commit");
    assert_eq!(file.digest, digest);
    assert_eq!(file.replica_count(), 1);
}

#[tokio::test]
async fn delete_file_command_removes_the_path() {
    let (service, namespace) = single_node_service();
    tokio::spawn(service.clone().run_election_timer());
    wait_for_leadership(&service).await;

    let digest = Digest::of_bytes(b"hello");
    service
        .submit_command(Command::AddFile {
            host_ids: vec![NodeId::new(7)],
            path: "/docs/readme.md".to_string(),
            digest,
        })
        .await
        .unwrap();

    service
        .submit_command(Command::DeleteFile { path: "/docs/readme.md".to_string() })
        .await
        .unwrap();

    let ns = namespace.read();
    assert!(ns.get_file("/docs/readme.md").is_err());
}

#[tokio::test]
async fn dedup_via_two_commits_yields_replica_count_two() {
    let (service, namespace) = single_node_service();
    tokio::spawn(service.clone().run_election_timer());
    wait_for_leadership(&service).await;

    let digest = Digest::of_bytes(b"hello");
    service
        .submit_command(Command::AddFile {
            host_ids: vec![NodeId::new(1)],
            path: "/docs/readme.md".to_string(),
            digest: digest.clone(),
        })
        .await
        .unwrap();
    service
        .submit_command(Command::AddFile {
            host_ids: vec![NodeId::new(1)],
            path: "/docs/copy.md".to_string(),
            digest,
        })
        .await
        .unwrap();

    let ns = namespace.read();
    assert_eq!(ns.get_file("/docs/copy.md").unwrap().replica_count(), 2);
    assert_eq!(ns.file_count(), 1);
}

#[tokio::test]
async fn non_leader_heartbeat_gets_temporary_redirect() {
    // No election timer is spawned, so this master never becomes leader
    // and never learns a leader address — exactly the "leader unknown"
    // branch of spec.md §8 scenario 6 (heartbeat to a non-leader master).
    let (consensus, namespace) = single_node_service();
    let registry = Arc::new(NodeRegistry::new());
    let state = Arc::new(MasterState {
        consensus,
        namespace,
        registry: registry.clone(),
        uploads: UploadCoordinator::new(registry),
        replicas: ReplicaManager::spawn(),
        http: reqwest::Client::new(),
        replication_factor: 2,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    let http = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap();
    let resp = http
        .post(format!("http://{addr}/api/sdfs/heartbeat"))
        .json(&serde_json::json!({ "host": "node-a:9000", "cpu": 0.0, "size": 0, "memory": 0.0, "disk": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::TEMPORARY_REDIRECT);
}
