use std::sync::Arc;
use std::time::{Duration, Instant};

use analysis_worker::queue::{QueueKeys, QueueManager};
use analysis_worker::store::{FastCache, RedisCache};
use analysis_worker::task::TaskStatus;
use analysis_worker_test_utils::fake_redis::FakeRedis;
use analysis_worker_test_utils::{init_tracing, with_timeout};

async fn connect() -> (FakeRedis, RedisCache) {
    init_tracing();
    let server = FakeRedis::start().await;
    let cache = with_timeout(RedisCache::connect(&server.url()))
        .await
        .expect("connect to fake redis");
    (server, cache)
}

#[tokio::test]
async fn idle_blocking_move_waits_out_the_poll_timeout() {
    let (server, cache) = connect().await;

    let started = Instant::now();
    let moved = with_timeout(cache.move_head_to_tail(
        "jobs:pending",
        "jobs:processing",
        Duration::from_secs(1),
    ))
    .await;

    assert_eq!(moved.unwrap(), None);
    assert!(
        started.elapsed() >= Duration::from_millis(900),
        "returned after {:?}",
        started.elapsed()
    );
    assert!(server.commands().contains(&"BLMOVE".to_string()));
}

#[tokio::test]
async fn blocking_move_picks_up_a_late_push() {
    let (server, cache) = connect().await;

    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move {
            cache
                .move_head_to_tail("jobs:pending", "jobs:processing", Duration::from_secs(2))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.push_tail("jobs:pending", "late").await.unwrap();

    let moved = with_timeout(waiter).await.unwrap().unwrap();
    assert_eq!(moved.as_deref(), Some("late"));
    assert_eq!(server.list("jobs:processing"), vec!["late".to_string()]);
    assert!(server.list("jobs:pending").is_empty());
}

#[tokio::test]
async fn moves_take_the_head_and_append_to_the_tail() {
    let (server, cache) = connect().await;
    for id in ["a", "b", "c"] {
        cache.push_tail("jobs:pending", id).await.unwrap();
    }

    let first = cache
        .move_head_to_tail("jobs:pending", "jobs:processing", Duration::ZERO)
        .await
        .unwrap();
    let second = cache
        .move_head_to_tail("jobs:pending", "jobs:processing", Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(first.as_deref(), Some("a"));
    assert_eq!(second.as_deref(), Some("b"));
    assert_eq!(
        cache.list("jobs:processing").await.unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );
    assert_eq!(cache.list_len("jobs:pending").await.unwrap(), 1);

    let commands = server.commands();
    assert!(commands.contains(&"LMOVE".to_string()));
    assert!(commands.contains(&"BLMOVE".to_string()));
}

#[tokio::test]
async fn remove_all_drops_every_occurrence_once() {
    let (_server, cache) = connect().await;
    for id in ["t1", "t2", "t1"] {
        cache.push_tail("jobs:processing", id).await.unwrap();
    }

    assert_eq!(cache.remove_all("jobs:processing", "t1").await.unwrap(), 2);
    assert_eq!(cache.remove_all("jobs:processing", "t1").await.unwrap(), 0);
    assert_eq!(
        cache.list("jobs:processing").await.unwrap(),
        vec!["t2".to_string()]
    );
}

#[tokio::test]
async fn queue_round_trip_over_redis() {
    let (server, cache) = connect().await;
    let queue = QueueManager::new(
        Arc::new(cache),
        QueueKeys::new("jobs"),
        Duration::from_secs(60),
    );

    assert!(queue.enqueue("t1", "ref-a").await);
    assert!(server.string("task:t1").unwrap().contains("\"status\":\"pending\""));

    let task = with_timeout(queue.dequeue(Duration::from_secs(1)))
        .await
        .expect("task should dequeue");
    assert_eq!(task.task_id, "t1");
    assert_eq!(task.source_ref, "ref-a");
    assert_eq!(task.status, TaskStatus::Processing);
    assert!(task.lease_expires.is_some());
    assert_eq!(server.list("jobs:processing"), vec!["t1".to_string()]);

    assert!(queue.ack("t1").await);
    assert!(server.list("jobs:processing").is_empty());
    assert!(with_timeout(queue.dequeue(Duration::from_secs(1))).await.is_none());
}
