//! End-to-end behaviour of the coordinator over SQLite.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vtq_core::domain::DEFAULT_TASK_PRIORITY;
use vtq_core::ports::FixedClock;
use vtq_core::{BrokerConfig, Coordinator, SqliteStore, TaskId, TaskStatus, TaskUpdate, VtqError};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn config(toml: &str) -> BrokerConfig {
    let mut config = BrokerConfig::from_toml_str(toml).unwrap();
    config.ticker.enabled = false;
    config
}

fn fixed(toml: &str) -> (Coordinator<SqliteStore>, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(t0()));
    let coordinator = Coordinator::builder()
        .config(config(toml))
        .clock(clock.clone())
        .open_in_memory()
        .unwrap();
    (coordinator, clock)
}

fn realtime(toml: &str) -> Coordinator<SqliteStore> {
    Coordinator::builder()
        .config(config(toml))
        .open_in_memory()
        .unwrap()
}

async fn put(c: &Coordinator<SqliteStore>, vqueue: &str) -> TaskId {
    c.enqueue(b"payload".to_vec(), vqueue, DEFAULT_TASK_PRIORITY, Duration::ZERO)
        .await
        .unwrap()
}

#[tokio::test]
async fn expired_lease_is_delivered_again() {
    let (c, clock) = fixed(
        r#"
        [defaults]
        visibility_timeout_seconds = 30
        "#,
    );
    let id = put(&c, "jobs").await;

    let first = c.receive(1, Duration::ZERO).await.unwrap();
    assert_eq!(first[0].id, id);
    assert_eq!(first[0].visible_at, t0() + chrono::Duration::seconds(30));

    clock.advance(Duration::from_secs(29));
    assert!(c.receive(1, Duration::ZERO).await.unwrap().is_empty());
    assert_eq!(c.counts().await.unwrap().leased, 1);

    clock.advance(Duration::from_secs(1));
    assert_eq!(c.counts().await.unwrap().expired_leases, 1);
    let second = c.receive(1, Duration::ZERO).await.unwrap();
    assert_eq!(second[0].id, id);
    assert_eq!(second[0].lease_count, 2);

    // 先に lease した consumer の ack も通る
    assert!(c.ack(id).await.unwrap());
    assert!(c.is_empty().await.unwrap());
}

#[tokio::test]
async fn update_extends_lease() {
    let (c, clock) = fixed(
        r#"
        [defaults]
        visibility_timeout_seconds = 30
        "#,
    );
    let id = put(&c, "jobs").await;
    c.receive(1, Duration::ZERO).await.unwrap();

    assert!(
        c.update(id, TaskUpdate::visible_after(Duration::from_secs(120)))
            .await
            .unwrap()
    );
    clock.advance(Duration::from_secs(60));
    assert!(c.receive(1, Duration::ZERO).await.unwrap().is_empty());
    clock.advance(Duration::from_secs(60));
    assert_eq!(c.receive(1, Duration::ZERO).await.unwrap()[0].id, id);
}

#[tokio::test]
async fn requeue_and_delete() {
    let (c, _) = fixed("");
    let id = put(&c, "jobs").await;
    c.receive(1, Duration::ZERO).await.unwrap();

    assert!(c.requeue(id).await.unwrap());
    assert!(c.requeue(id).await.unwrap());
    assert_eq!(c.get(id).await.unwrap().unwrap().status, TaskStatus::Pending);

    assert!(c.delete(id).await.unwrap());
    assert!(!c.delete(id).await.unwrap());
    assert!(!c.ack(id).await.unwrap());
    assert_eq!(c.get(id).await.unwrap(), None);
}

#[tokio::test]
async fn vqueue_priority_beats_task_priority() {
    let (c, _) = fixed(
        r#"
        [[vqueues]]
        pattern = "urgent"
        priority = 90
        "#,
    );
    let low = c
        .enqueue(b"a".to_vec(), "bulk", 100, Duration::ZERO)
        .await
        .unwrap();
    let high = c
        .enqueue(b"b".to_vec(), "urgent", 0, Duration::ZERO)
        .await
        .unwrap();

    let got: Vec<TaskId> = c
        .receive(2, Duration::ZERO)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(got, vec![high, low]);

    let urgent = c.ensure_vqueue("urgent").await.unwrap();
    assert_eq!(urgent.policy.priority, 90);
    assert_eq!(c.vqueues().await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_vqueue_can_be_refused() {
    let (c, _) = fixed(
        r#"
        allow_unknown_vqueues = false

        [[vqueues]]
        pattern = "known-*"
        "#,
    );
    put(&c, "known-1").await;
    let err = c
        .enqueue(b"x".to_vec(), "stranger", 50, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, VtqError::ConfigurationMissing(name) if name == "stranger"));
    assert_eq!(c.len().await.unwrap(), 1);
}

#[tokio::test]
async fn fixed_window_suspends_until_window_ends() {
    let (c, clock) = fixed(
        r#"
        [[rate_limiters]]
        name = "window"
        type = "fixed_window"
        limit = 2
        window_seconds = 60
        vqueues = ["limited"]
        "#,
    );
    for _ in 0..5 {
        put(&c, "limited").await;
    }
    put(&c, "free").await;

    let first = c.receive(10, Duration::ZERO).await.unwrap();
    let limited = first.iter().filter(|t| t.vqueue_name == "limited").count();
    assert_eq!(limited, 2);
    assert_eq!(c.suspended_limiters(), vec!["window".to_string()]);

    clock.advance(Duration::from_secs(30));
    assert!(!c.sweep().await.unwrap().reopened());
    assert!(c.receive(10, Duration::ZERO).await.unwrap().is_empty());

    clock.advance(Duration::from_secs(30));
    assert!(c.sweep().await.unwrap().reopened());
    assert_eq!(c.receive(10, Duration::ZERO).await.unwrap().len(), 2);
}

#[tokio::test]
async fn mutex_allows_one_lease_per_vqueue() {
    let (c, _) = fixed(
        r#"
        [[rate_limiters]]
        name = "mutex-{vqueue_name}"
        type = "mutex"
        vqueues = ["report-*"]
        "#,
    );
    for _ in 0..2 {
        put(&c, "report-a").await;
        put(&c, "report-b").await;
    }

    let batch = c.receive(10, Duration::ZERO).await.unwrap();
    let vqueues: HashSet<&str> = batch.iter().map(|t| t.vqueue_name.as_str()).collect();
    assert_eq!(batch.len(), 2);
    assert_eq!(vqueues, HashSet::from(["report-a", "report-b"]));

    let a = batch.iter().find(|t| t.vqueue_name == "report-a").unwrap();
    assert!(c.ack(a.id).await.unwrap());
    let next = c.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].vqueue_name, "report-a");
}

#[tokio::test]
async fn limiter_leaves_operator_pause_alone() {
    let (c, _) = fixed(
        r#"
        [[rate_limiters]]
        name = "shared"
        type = "mutex"
        vqueues = ["jobs-*"]
        "#,
    );
    put(&c, "jobs-a").await;
    put(&c, "jobs-a").await;
    let paused = put(&c, "jobs-b").await;

    // 運用者が先に止めた VQ は limiter の解除対象にならない
    assert!(c.set_vqueue_hidden("jobs-b", true).await.unwrap());
    let leased = c.receive(5, Duration::ZERO).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert!(c.ack(leased[0].id).await.unwrap());

    let next = c.receive(5, Duration::ZERO).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].vqueue_name, "jobs-a");
    assert!(c.ack(next[0].id).await.unwrap());
    assert!(c.receive(5, Duration::ZERO).await.unwrap().is_empty());

    assert!(c.set_vqueue_hidden("jobs-b", false).await.unwrap());
    assert_eq!(c.receive(5, Duration::ZERO).await.unwrap()[0].id, paused);
}

#[tokio::test]
async fn shared_mutex_allows_one_lease_in_total() {
    let (c, _) = fixed(
        r#"
        [[rate_limiters]]
        name = "shared"
        type = "mutex"
        vqueues = ["jobs-*"]
        "#,
    );
    for _ in 0..2 {
        put(&c, "jobs-a").await;
        put(&c, "jobs-b").await;
    }

    let leased = c.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert!(c.vqueues().await.unwrap().iter().all(|vq| vq.hidden));

    assert!(c.ack(leased[0].id).await.unwrap());
    assert_eq!(c.receive(10, Duration::ZERO).await.unwrap().len(), 1);
}

fn reopen(path: &std::path::Path, toml: &str) -> Coordinator<SqliteStore> {
    let mut config = config(toml);
    config.store.path = path.to_path_buf();
    Coordinator::builder().config(config).open().unwrap()
}

#[tokio::test]
async fn window_hidden_vqueue_reopens_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vtq.db");
    let toml = r#"
        [[rate_limiters]]
        name = "window"
        type = "fixed_window"
        limit = 1
        window_seconds = 1
        vqueues = ["limited"]
        "#;

    let first = reopen(&path, toml);
    put(&first, "limited").await;
    put(&first, "limited").await;
    assert_eq!(first.receive(10, Duration::ZERO).await.unwrap().len(), 1);
    first.close().await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let second = reopen(&path, toml);
    assert_eq!(second.receive(1, Duration::ZERO).await.unwrap().len(), 1);
    let vq = &second.vqueues().await.unwrap()[0];
    assert_eq!(vq.hidden_by.as_deref(), Some("window"));
}

#[tokio::test]
async fn mutex_held_across_restart_until_ack() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vtq.db");
    let toml = r#"
        [[rate_limiters]]
        name = "mx"
        type = "mutex"
        vqueues = ["single"]
        "#;

    let first = reopen(&path, toml);
    put(&first, "single").await;
    put(&first, "single").await;
    let leased = first.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(leased.len(), 1);
    first.close().await;

    // lease が残っているので、別プロセスでも隠れたまま
    let second = reopen(&path, toml);
    assert!(second.receive(1, Duration::ZERO).await.unwrap().is_empty());
    assert_eq!(second.suspended_limiters(), vec!["mx".to_string()]);

    assert!(second.ack(leased[0].id).await.unwrap());
    assert_eq!(second.receive(1, Duration::ZERO).await.unwrap().len(), 1);
}

#[tokio::test]
async fn long_poll_wakes_on_enqueue() {
    let c = realtime(
        r#"
        [receive]
        poll_interval_ms = 10000
        "#,
    );
    let receiver = {
        let c = c.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let tasks = c.receive(1, Duration::from_secs(5)).await.unwrap();
            (tasks, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let id = put(&c, "jobs").await;

    let (tasks, elapsed) = receiver.await.unwrap();
    assert_eq!(tasks[0].id, id);
    assert!(elapsed < Duration::from_secs(3), "woke after {elapsed:?}");
}

#[tokio::test]
async fn long_poll_times_out_empty() {
    let c = realtime(
        r#"
        [receive]
        poll_interval_ms = 50
        "#,
    );
    let started = Instant::now();
    let tasks = c.receive(1, Duration::from_millis(200)).await.unwrap();
    assert!(tasks.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn waiting_receivers_are_served_in_arrival_order() {
    let c = realtime("");
    let spawn_receiver = |c: Coordinator<SqliteStore>| {
        tokio::spawn(async move { c.receive(1, Duration::from_secs(5)).await.unwrap() })
    };

    let first = spawn_receiver(c.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = spawn_receiver(c.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let a = put(&c, "jobs").await;
    assert_eq!(first.await.unwrap()[0].id, a);
    let b = put(&c, "jobs").await;
    assert_eq!(second.await.unwrap()[0].id, b);
}

#[tokio::test]
async fn cancelled_receive_does_not_leak_leases() {
    let c = realtime("");
    for _ in 0..20 {
        put(&c, "jobs").await;
    }

    let mut delivered = 0;
    for _ in 0..40 {
        if let Ok(tasks) =
            tokio::time::timeout(Duration::from_micros(1), c.receive(1, Duration::ZERO)).await
        {
            delivered += tasks.unwrap().len();
        }
    }

    // 受け取り手のいない claim は requeue される
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let leased = c.counts().await.unwrap().leased as usize;
        if leased == delivered {
            break;
        }
        assert!(Instant::now() < deadline, "leased={leased} delivered={delivered}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_receivers_get_each_task_once() {
    let c = realtime("");
    for _ in 0..100 {
        put(&c, "jobs").await;
    }

    let receivers: Vec<_> = (0..8)
        .map(|_| {
            let c = c.clone();
            tokio::spawn(async move {
                let mut got = Vec::new();
                loop {
                    let tasks = c.receive(3, Duration::ZERO).await.unwrap();
                    if tasks.is_empty() && c.counts().await.unwrap().pending == 0 {
                        return got;
                    }
                    got.extend(tasks.into_iter().map(|t| t.id));
                }
            })
        })
        .collect();

    let mut all = Vec::new();
    for receiver in receivers {
        all.extend(receiver.await.unwrap());
    }
    let unique: HashSet<TaskId> = all.iter().copied().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);
}

#[tokio::test]
async fn workspaces_share_a_file_independently() {
    let dir = tempfile::tempdir().unwrap();
    let open = |workspace: &str| {
        let mut config = config("");
        config.store.path = dir.path().join("vtq.db");
        config.store.workspace = workspace.to_string();
        Coordinator::builder().config(config).open().unwrap()
    };
    let alpha = open("alpha");
    let beta = open("beta");

    put(&alpha, "jobs").await;
    put(&alpha, "jobs").await;
    assert_eq!(alpha.len().await.unwrap(), 2);
    assert_eq!(beta.len().await.unwrap(), 0);
    assert!(beta.receive(1, Duration::ZERO).await.unwrap().is_empty());

    alpha.flush().await.unwrap();
    assert_eq!(alpha.len().await.unwrap(), 0);
    assert!(alpha.vqueues().await.unwrap().is_empty());
}

#[tokio::test]
async fn ticker_delivers_delayed_task_to_waiting_receiver() {
    let mut config = config(
        r#"
        [receive]
        poll_interval_ms = 10000
        "#,
    );
    config.ticker.enabled = true;
    config.ticker.interval_ms = 10000;
    let c = Coordinator::builder().config(config).open_in_memory().unwrap();

    let id = c
        .enqueue(b"x".to_vec(), "jobs", 50, Duration::from_millis(200))
        .await
        .unwrap();

    let started = Instant::now();
    let tasks = c.receive(1, Duration::from_secs(5)).await.unwrap();
    assert_eq!(tasks[0].id, id);
    assert!(started.elapsed() < Duration::from_secs(3));
    c.close().await;
}
