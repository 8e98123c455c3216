//! End-to-end scenarios 1-4 from spec.md §8, driven against a real
//! storage-node HTTP server (sdfs-storage's axum router) over a local
//! TCP listener.

use std::net::SocketAddr;
use std::time::Duration;

use sdfs_storage::content_store::ContentStore;
use sdfs_storage::digest::Digest;
use sdfs_storage::server::{router, NodeConfig, NodeState};

async fn spawn_node() -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(dir.path()).unwrap();
    let config = NodeConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        data_prefix: dir.path().to_path_buf(),
        advertise_addr: "127.0.0.1:0".to_string(),
        master_addrs: Vec::new(),
        heartbeat_interval: Duration::from_secs(3600),
    };
    let state = NodeState::new(store, config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (addr, dir)
}

async fn upload(http: &reqwest::Client, addr: SocketAddr, id: &str, bytes: &'static str) -> String {
    http.get(format!("http://{addr}/api/sdfs/upload?id={id}"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    let resp = http
        .post(format!("http://{addr}/api/upload?id={id}"))
        .body(bytes)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED, "upload must reply 202 per spec.md §8 scenario 1");
    let resp: serde_json::Value = resp.json().await.unwrap();
    resp["hash"].as_str().unwrap().to_string()
}

async fn download_ticket(http: &reqwest::Client, addr: SocketAddr, hash: &str) -> String {
    let resp: serde_json::Value = http
        .get(format!("http://{addr}/api/sdfs/download?hash={hash}&name=readme.md"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    resp["ticket"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn upload_then_download_round_trips_bytes() {
    let (addr, _dir) = spawn_node().await;
    let http = reqwest::Client::new();

    let hash = upload(&http, addr, "up1", "hello").await;
    assert_eq!(hash, Digest::of_bytes(b"hello").as_str());

    let ticket = download_ticket(&http, addr, &hash).await;
    let body = http
        .get(format!("http://{addr}/api/download?id={ticket}"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello");
}

#[tokio::test]
async fn duplicate_upload_dedups_to_single_object() {
    let (addr, dir) = spawn_node().await;
    let http = reqwest::Client::new();

    let h1 = upload(&http, addr, "up-a", "same bytes").await;
    let h2 = upload(&http, addr, "up-b", "same bytes").await;
    assert_eq!(h1, h2);

    let store = ContentStore::open(dir.path()).unwrap();
    assert_eq!(store.object_count(), 1);
}

#[tokio::test]
async fn partial_range_returns_206_with_content_range() {
    let (addr, _dir) = spawn_node().await;
    let http = reqwest::Client::new();

    let hash = upload(&http, addr, "up2", "hello").await;
    let ticket = download_ticket(&http, addr, &hash).await;

    let resp = http
        .get(format!("http://{addr}/api/download?id={ticket}"))
        .header("Range", "bytes=0-0")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    let content_range = resp
        .headers()
        .get("content-range")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(content_range, "bytes 0-0/5");
    assert_eq!(resp.text().await.unwrap(), "h");
}

#[tokio::test]
async fn suffix_range_returns_last_n_bytes() {
    let (addr, _dir) = spawn_node().await;
    let http = reqwest::Client::new();

    let hash = upload(&http, addr, "up2b", "hello").await;
    let ticket = download_ticket(&http, addr, &hash).await;

    let resp = http
        .get(format!("http://{addr}/api/download?id={ticket}"))
        .header("Range", "bytes=-3")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.text().await.unwrap(), "llo");
}

#[tokio::test]
async fn invalid_range_returns_server_error() {
    let (addr, _dir) = spawn_node().await;
    let http = reqwest::Client::new();

    let hash = upload(&http, addr, "up3", "hello").await;
    let ticket = download_ticket(&http, addr, &hash).await;

    let resp = http
        .get(format!("http://{addr}/api/download?id={ticket}"))
        .header("Range", "bytes=5-20")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn delete_is_busy_while_open_then_succeeds() {
    let (addr, dir) = spawn_node().await;
    let http = reqwest::Client::new();

    let hash = upload(&http, addr, "up4", "hello").await;

    let store = ContentStore::open(dir.path()).unwrap();
    let digest = Digest::from_encoded(hash.clone());
    let handle = store.get(&digest).unwrap();

    let resp = http
        .get(format!("http://{addr}/api/sdfs/delete?hash={hash}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

    drop(handle);
    let resp = http
        .get(format!("http://{addr}/api/sdfs/delete?hash={hash}"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn delete_after_dedup_leaves_one_replica() {
    let (addr, dir) = spawn_node().await;
    let http = reqwest::Client::new();

    let h1 = upload(&http, addr, "up5", "copy me").await;
    let h2 = upload(&http, addr, "up6", "copy me").await;
    assert_eq!(h1, h2);

    let resp = http
        .get(format!("http://{addr}/api/sdfs/delete?hash={h1}"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let store = ContentStore::open(dir.path()).unwrap();
    assert!(store.contains(&Digest::from_encoded(h1)));
}

#[tokio::test]
async fn replica_request_is_idempotent_when_already_held() {
    let (addr, dir) = spawn_node().await;
    let store = ContentStore::open(dir.path()).unwrap();
    let digest = store.add(b"hello").unwrap();

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("http://{addr}/api/sdfs/replica/request"))
        .json(&serde_json::json!({ "link": "http://unused", "hash": digest.as_str() }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}
