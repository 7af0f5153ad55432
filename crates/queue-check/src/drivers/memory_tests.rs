//! Tests for the in-memory driver.

use super::*;

fn queue(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

async fn connected_driver() -> InMemoryDriver {
    let mut driver = InMemoryDriver::new();
    driver
        .open_connection(&DriverOptions::new())
        .await
        .expect("in-memory connect");
    driver
}

#[tokio::test]
async fn test_operations_require_connection() {
    let mut driver = InMemoryDriver::new();

    let err = driver
        .add_message_to_queue("hello", &queue("default"))
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::NotConnected { .. }));
    assert!(!driver.is_connected());
}

#[tokio::test]
async fn test_clear_checks_connection_before_queue() {
    let mut driver = InMemoryDriver::new();

    let err = driver.clear_queue(&queue("missing")).await.unwrap_err();

    assert!(matches!(err, QueueError::NotConnected { .. }));
}

#[tokio::test]
async fn test_enqueue_creates_queue_and_counts() {
    let mut driver = connected_driver().await;
    let default = queue("default");

    driver.add_message_to_queue("one", &default).await.unwrap();
    driver.add_message_to_queue("two", &default).await.unwrap();

    assert_eq!(driver.queues().await.unwrap(), vec!["default".to_string()]);
    assert_eq!(driver.current_count(&default).await.unwrap(), 2);
    assert_eq!(driver.total_count(&default).await.unwrap(), 2);
}

#[tokio::test]
async fn test_clear_keeps_lifetime_total() {
    let mut driver = connected_driver().await;
    let default = queue("default");

    driver.add_message_to_queue("one", &default).await.unwrap();
    driver.clear_queue(&default).await.unwrap();
    driver.clear_queue(&default).await.unwrap();

    let stats = driver.stats(&default).await.unwrap();
    assert_eq!(stats.current, 0);
    assert_eq!(stats.total, 1);
}

#[tokio::test]
async fn test_unknown_queue_raises_not_found() {
    let mut driver = connected_driver().await;

    let err = driver.current_count(&queue("missing")).await.unwrap_err();
    assert!(err.is_not_found());

    let err = driver.clear_queue(&queue("missing")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_predeclared_queues_are_listed() {
    let mut driver = InMemoryDriver::with_queues(["a", "b"]);
    driver.open_connection(&DriverOptions::new()).await.unwrap();

    let mut names = driver.queues().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(driver.current_count(&queue("a")).await.unwrap(), 0);
}
