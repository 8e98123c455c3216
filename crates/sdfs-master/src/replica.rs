//! Replica manager (C7): a bounded-parallelism worker pool fed by a FIFO,
//! per spec §4.7. Each task asks the source host for a download link and
//! POSTs it to every target's replica endpoint; partial failure retries
//! with a TTL, exhaustion is logged and the task dropped.

use std::sync::Arc;

use sdfs_meta::Digest;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

/// Retries left before a task with failed targets is dropped. spec §4.7
/// does not name a default; three attempts gives a transient node blip
/// room to clear without retrying forever.
const DEFAULT_TTL: u32 = 3;
const POOL_CAPACITY: usize = 10;

/// One outstanding cross-node replication job.
#[derive(Clone, Debug)]
pub struct ReplicaTask {
    pub source_host: String,
    pub target_hosts: Vec<String>,
    pub digest: Digest,
    pub failed_hosts: Vec<String>,
    pub ttl: u32,
}

impl ReplicaTask {
    pub fn new(source_host: String, target_hosts: Vec<String>, digest: Digest) -> Self {
        Self { source_host, target_hosts, digest, failed_hosts: Vec::new(), ttl: DEFAULT_TTL }
    }
}

/// Queues replication tasks and runs them with bounded concurrency.
pub struct ReplicaManager {
    tx: mpsc::UnboundedSender<ReplicaTask>,
}

impl ReplicaManager {
    /// Spawns the poller loop and returns a handle to enqueue tasks on.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(poll_loop(rx, tx.clone()));
        Self { tx }
    }

    pub fn enqueue(&self, task: ReplicaTask) {
        let _ = self.tx.send(task);
    }
}

async fn poll_loop(mut rx: mpsc::UnboundedReceiver<ReplicaTask>, requeue: mpsc::UnboundedSender<ReplicaTask>) {
    let tickets = Arc::new(Semaphore::new(POOL_CAPACITY));
    let http = reqwest::Client::new();
    while let Some(task) = rx.recv().await {
        let permit = tickets.clone().acquire_owned().await.expect("semaphore never closes");
        let http = http.clone();
        let requeue = requeue.clone();
        tokio::spawn(async move {
            let _permit = permit;
            execute(&http, task, &requeue).await;
        });
    }
}

async fn execute(http: &reqwest::Client, mut task: ReplicaTask, requeue: &mpsc::UnboundedSender<ReplicaTask>) {
    let link = match request_download_link(http, &task.source_host, &task.digest).await {
        Some(link) => link,
        None => {
            warn!(source = %task.source_host, digest = %task.digest, "source host unreachable for replica task");
            task.failed_hosts = task.target_hosts.clone();
            retry_or_drop(task, requeue);
            return;
        }
    };

    let mut failed = Vec::new();
    for target in &task.target_hosts {
        if !push_replica(http, target, &link, &task.digest).await {
            failed.push(target.clone());
        }
    }

    if failed.is_empty() {
        info!(digest = %task.digest, targets = task.target_hosts.len(), "replica task completed");
        return;
    }

    task.target_hosts = failed.clone();
    task.failed_hosts = failed;
    retry_or_drop(task, requeue);
}

fn retry_or_drop(mut task: ReplicaTask, requeue: &mpsc::UnboundedSender<ReplicaTask>) {
    if task.ttl == 0 {
        warn!(digest = %task.digest, failed = ?task.failed_hosts, "replica task exhausted its ttl, dropping");
        return;
    }
    task.ttl -= 1;
    let _ = requeue.send(task);
}

async fn request_download_link(http: &reqwest::Client, source_host: &str, digest: &Digest) -> Option<String> {
    let url = format!("http://{source_host}/api/sdfs/download?hash={digest}&name={digest}");
    let resp = http.get(&url).send().await.ok()?.error_for_status().ok()?;
    #[derive(serde::Deserialize)]
    struct TicketResponse {
        ticket: String,
    }
    let body: TicketResponse = resp.json().await.ok()?;
    Some(format!("http://{source_host}/api/download?id={}", body.ticket))
}

async fn push_replica(http: &reqwest::Client, target_host: &str, link: &str, digest: &Digest) -> bool {
    #[derive(serde::Serialize)]
    struct ReplicaRequest<'a> {
        link: &'a str,
        hash: &'a str,
    }
    let url = format!("http://{target_host}/api/sdfs/replica/request");
    http.post(&url)
        .json(&ReplicaRequest { link, hash: digest.as_str() })
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_with_default_ttl_and_no_failures() {
        let task = ReplicaTask::new("node-a".into(), vec!["node-b".into()], Digest::of_bytes(b"x"));
        assert_eq!(task.ttl, DEFAULT_TTL);
        assert!(task.failed_hosts.is_empty());
    }
}
