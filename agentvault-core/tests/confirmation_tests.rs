mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::{tempdir, TempDir};

use agentvault_core::gateway::{FailoverGateway, MockProvider, TxStatus};
use agentvault_core::transaction::{TrackingSettings, TxState};
use agentvault_core::ConfirmationTracker;
use test_utils::*;

fn settings() -> TrackingSettings {
    TrackingSettings {
        required_confirmations: 6,
        poll_interval: Duration::from_secs(30),
        max_poll_interval: Duration::from_secs(100),
        not_found_window: ChronoDuration::minutes(30),
    }
}

fn tracker_with(names: &[&str]) -> (TempDir, Vec<Arc<MockProvider>>, Arc<FailoverGateway>, ConfirmationTracker) {
    init_test_environment();
    let dir = tempdir().unwrap();
    let (mocks, gateway) = mock_gateway(names);
    let tracker = ConfirmationTracker::open(dir.path(), settings(), gateway.clone()).unwrap();
    (dir, mocks, gateway, tracker)
}

fn status(n: u32, confirmations: u32) -> TxStatus {
    TxStatus {
        txid: txid(n),
        confirmations,
        block_height: (confirmations > 0).then_some(1_000),
    }
}

#[test]
fn progresses_from_pending_to_confirmed() {
    let (_dir, mocks, _gw, tracker) = tracker_with(&["primary"]);
    tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();

    mocks[0].set_transaction(status(1, 0));
    assert!(tracker.poll_once().unwrap().is_empty());
    assert_eq!(tracker.get(&txid(1)).unwrap().state, TxState::Pending);

    mocks[0].set_transaction(status(1, 2));
    let changes = tracker.poll_once().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].from, TxState::Pending);
    assert_eq!(changes[0].to, TxState::Confirming);

    mocks[0].set_transaction(status(1, 6));
    let changes = tracker.poll_once().unwrap();
    assert_eq!(changes[0].to, TxState::Confirmed);
    assert_eq!(changes[0].confirmations, 6);
    assert!(tracker.active().is_empty());
}

#[test]
fn confirmed_is_terminal() {
    let (_dir, mocks, _gw, tracker) = tracker_with(&["primary"]);
    tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
    mocks[0].set_transaction(status(1, 6));
    tracker.poll_once().unwrap();

    // A later reorg report does not move it back
    mocks[0].remove_transaction(&txid(1));
    assert!(tracker.poll_once().unwrap().is_empty());
    assert_eq!(tracker.get(&txid(1)).unwrap().state, TxState::Confirmed);
}

#[test]
fn not_found_for_the_whole_window_fails() {
    let (_dir, _mocks, _gw, tracker) = tracker_with(&["primary"]);
    tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
    let start = Utc::now();

    assert!(tracker.poll_once_at(start).unwrap().is_empty());
    assert!(tracker
        .poll_once_at(start + ChronoDuration::minutes(29))
        .unwrap()
        .is_empty());

    let changes = tracker.poll_once_at(start + ChronoDuration::minutes(30)).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].to, TxState::Failed);
}

#[test]
fn reappearing_transaction_resets_the_window() {
    let (_dir, mocks, _gw, tracker) = tracker_with(&["primary"]);
    tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
    let start = Utc::now();

    tracker.poll_once_at(start).unwrap();
    mocks[0].set_transaction(status(1, 0));
    tracker.poll_once_at(start + ChronoDuration::minutes(20)).unwrap();
    mocks[0].remove_transaction(&txid(1));
    tracker.poll_once_at(start + ChronoDuration::minutes(40)).unwrap();

    assert_eq!(tracker.get(&txid(1)).unwrap().state, TxState::Pending);
}

#[test]
fn degraded_answer_marks_unverified_instead_of_failed() {
    let (_dir, mocks, _gw, tracker) = tracker_with(&["primary", "backup"]);
    tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
    mocks[0].set_down(true);

    let start = Utc::now();
    let changes = tracker.poll_once_at(start + ChronoDuration::hours(2)).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].to, TxState::Unverified);
    assert_eq!(tracker.get(&txid(1)).unwrap().not_found_since, None);
}

#[test]
fn polling_backs_off_while_degraded() {
    let (_dir, mocks, _gw, tracker) = tracker_with(&["primary"]);
    tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
    assert_eq!(tracker.next_interval(), Duration::from_secs(30));

    mocks[0].set_down(true);
    tracker.poll_once().unwrap();
    assert_eq!(tracker.next_interval(), Duration::from_secs(60));
    tracker.poll_once().unwrap();
    assert_eq!(tracker.next_interval(), Duration::from_secs(100));

    mocks[0].set_down(false);
    mocks[0].set_transaction(status(1, 1));
    tracker.poll_once().unwrap();
    assert_eq!(tracker.next_interval(), Duration::from_secs(30));
    assert_eq!(tracker.get(&txid(1)).unwrap().state, TxState::Confirming);
}

#[test]
fn tracked_transactions_survive_reopen() {
    init_test_environment();
    let dir = tempdir().unwrap();
    let (_mocks, gateway) = mock_gateway(&["primary"]);
    {
        let tracker = ConfirmationTracker::open(dir.path(), settings(), gateway.clone()).unwrap();
        tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
        tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
    }
    let reopened = ConfirmationTracker::open(dir.path(), settings(), gateway).unwrap();
    let list = reopened.list();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].state, TxState::Pending);
}

#[test]
fn finished_transactions_are_dropped_after_retention() {
    let (dir, mocks, gateway, tracker) = tracker_with(&["primary"]);
    tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
    tracker.track(&txid(2), "DRecipient", COIN, 1_000).unwrap();
    let start = Utc::now();

    mocks[0].set_transaction(status(1, 6));
    mocks[0].set_transaction(status(2, 0));
    tracker.poll_once_at(start).unwrap();
    assert_eq!(tracker.get(&txid(1)).unwrap().finished_at, Some(start));

    tracker.poll_once_at(start + ChronoDuration::days(6)).unwrap();
    assert_eq!(tracker.list().len(), 2);

    tracker.poll_once_at(start + ChronoDuration::days(8)).unwrap();
    assert!(tracker.get(&txid(1)).is_none());
    assert_eq!(tracker.get(&txid(2)).unwrap().state, TxState::Pending);

    let reopened = ConfirmationTracker::open(dir.path(), settings(), gateway).unwrap();
    assert_eq!(reopened.list().len(), 1);
}

#[test]
fn idle_tracker_still_prunes() {
    let (dir, mocks, gateway, tracker) = tracker_with(&["primary"]);
    tracker.track(&txid(1), "DRecipient", COIN, 1_000).unwrap();
    let start = Utc::now();
    mocks[0].set_transaction(status(1, 6));
    tracker.poll_once_at(start).unwrap();
    assert!(tracker.active().is_empty());

    assert!(tracker.poll_once_at(start + ChronoDuration::days(8)).unwrap().is_empty());
    assert!(tracker.list().is_empty());
    let reopened = ConfirmationTracker::open(dir.path(), settings(), gateway).unwrap();
    assert!(reopened.list().is_empty());
}
