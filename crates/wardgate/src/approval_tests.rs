use std::sync::Arc;
use std::time::Duration;

use wardgate_core::{signal, SystemClock};

use super::*;
use crate::notify::NotifierSet;

fn manager(timeout: Duration) -> ApprovalManager {
    ApprovalManager::new(
        "http://localhost:8080",
        timeout,
        5,
        NotifierSet::default(),
        Arc::new(SystemClock),
    )
}

fn request() -> NewApprovalRequest {
    NewApprovalRequest {
        endpoint: "todoist".to_string(),
        method: "POST".to_string(),
        path: "tasks".to_string(),
        agent_id: "tessa".to_string(),
        content: None,
    }
}

#[tokio::test]
async fn approve_by_id_unblocks_waiter_with_true() {
    let mgr = Arc::new(manager(Duration::from_secs(5)));
    let (_trigger, watcher) = signal::new();

    let mgr2 = mgr.clone();
    let waiter = tokio::spawn(async move { mgr2.request_approval(request(), watcher).await });

    // give request_approval a moment to register before approving.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let pending = mgr.list();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].id.len() == 16);

    mgr.approve_by_id(&pending[0].id).unwrap();
    let approved = waiter.await.unwrap().unwrap();
    assert!(approved);
    assert!(mgr.list().is_empty());
    assert_eq!(mgr.history(10).len(), 1);
    assert_eq!(mgr.history(10)[0].status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn deny_by_id_unblocks_waiter_with_false() {
    let mgr = Arc::new(manager(Duration::from_secs(5)));
    let (_trigger, watcher) = signal::new();
    let mgr2 = mgr.clone();
    let waiter = tokio::spawn(async move { mgr2.request_approval(request(), watcher).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let id = mgr.list()[0].id.clone();
    mgr.deny_by_id(&id).unwrap();
    let approved = waiter.await.unwrap().unwrap();
    assert!(!approved);
}

#[tokio::test]
async fn token_mismatch_is_rejected() {
    let mgr = manager(Duration::from_secs(5));
    let (_trigger, watcher) = signal::new();
    let handle = tokio::spawn({
        let result = mgr.request_approval(request(), watcher);
        result
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let id = mgr.list()[0].id.clone();
    assert!(matches!(
        mgr.approve(&id, "wrong-token"),
        Err(ApprovalError::BadToken(_))
    ));
    // request is still pending afterward
    assert_eq!(mgr.list().len(), 1);
    mgr.deny_by_id(&id).unwrap();
    let _ = handle.await;
}

#[tokio::test(start_paused = true)]
async fn timeout_expires_and_is_reported() {
    let mgr = Arc::new(manager(Duration::from_millis(100)));
    let (_trigger, watcher) = signal::new();
    let result = mgr.request_approval(request(), watcher).await;
    assert!(matches!(result, Err(ApprovalError::Timeout(_))));
    let history = mgr.history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ApprovalStatus::Expired);
}

#[tokio::test]
async fn cancellation_unblocks_waiter_with_error() {
    let mgr = Arc::new(manager(Duration::from_secs(30)));
    let (trigger, watcher) = signal::new();
    let mgr2 = mgr.clone();
    let waiter = tokio::spawn(async move { mgr2.request_approval(request(), watcher).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    trigger.shutdown();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(ApprovalError::Cancelled)));
}

#[tokio::test]
async fn cannot_respond_twice() {
    let mgr = manager(Duration::from_secs(5));
    let (_trigger, watcher) = signal::new();
    let handle = tokio::spawn({
        let fut = mgr.request_approval(request(), watcher);
        fut
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let id = mgr.list()[0].id.clone();
    mgr.approve_by_id(&id).unwrap();
    assert!(matches!(
        mgr.approve_by_id(&id),
        Err(ApprovalError::NotPending(_, ApprovalStatus::Approved))
    ));
    let _ = handle.await;
}

#[tokio::test]
async fn history_is_capped_and_newest_first() {
    let mgr = manager(Duration::from_secs(5));
    for i in 0..8 {
        let (_trigger, watcher) = signal::new();
        let mut req = request();
        req.path = format!("tasks/{i}");
        let fut = mgr.request_approval(req, watcher);
        let handle = tokio::spawn(fut);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let id = mgr.list()[0].id.clone();
        mgr.approve_by_id(&id).unwrap();
        let _ = handle.await;
    }
    let history = mgr.history(100);
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].path, "tasks/7");
}

#[test]
fn admin_view_never_serializes_token() {
    let req = ApprovalRequest {
        id: "abc".to_string(),
        token: "super-secret".to_string(),
        endpoint: "todoist".to_string(),
        method: "POST".to_string(),
        path: "tasks".to_string(),
        agent_id: "tessa".to_string(),
        status: ApprovalStatus::Pending,
        created_at: Utc::now(),
        expires_at: Utc::now(),
        responded_at: None,
        content: None,
    };
    let json = serde_json::to_string(&req).unwrap();
    assert!(!json.contains("super-secret"));
    assert!(!json.contains("\"token\""));
}
