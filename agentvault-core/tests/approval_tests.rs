mod test_utils;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::{tempdir, TempDir};

use agentvault_common::WalletError;
use agentvault_core::policy::{ApprovalStatus, Reservation, AUTO_TIMEOUT_ACTOR};
use agentvault_core::{ApprovalQueue, PolicyDecision, SpendAction};
use test_utils::*;

const HOLD: Duration = Duration::from_secs(60);

fn open_queue() -> (TempDir, ApprovalQueue) {
    init_test_environment();
    let dir = tempdir().unwrap();
    let queue = ApprovalQueue::open(dir.path(), OWNER).unwrap();
    (dir, queue)
}

fn decision(tier: &str, action: SpendAction) -> PolicyDecision {
    PolicyDecision {
        allowed: true,
        tier: tier.to_string(),
        action,
        reason: "within policy".to_string(),
    }
}

#[test]
fn only_the_owner_can_decide() {
    let (_dir, queue) = open_queue();
    let entry = queue
        .enqueue("DRecipient", 2_000 * COIN, &decision("large", SpendAction::OwnerApproval), HOLD)
        .unwrap();
    assert_eq!(entry.status, ApprovalStatus::Pending);

    assert!(matches!(queue.approve(&entry.id, "agent"), Err(WalletError::ApprovalUnauthorized)));
    assert!(matches!(
        queue.approve(&entry.id, AUTO_TIMEOUT_ACTOR),
        Err(WalletError::ApprovalUnauthorized)
    ));
    assert!(matches!(queue.deny(&entry.id, "agent"), Err(WalletError::ApprovalUnauthorized)));
    assert_eq!(queue.get(&entry.id).unwrap().status, ApprovalStatus::Pending);

    let approved = queue.approve(&entry.id, OWNER).unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert_eq!(approved.decided_by.as_deref(), Some(OWNER));
    assert!(approved.decided_at.is_some());
}

#[test]
fn timeout_actor_cannot_be_configured_as_owner() {
    init_test_environment();
    let dir = tempdir().unwrap();
    let queue = ApprovalQueue::open(dir.path(), AUTO_TIMEOUT_ACTOR).unwrap();
    let entry = queue
        .enqueue("DRecipient", COIN, &decision("large", SpendAction::OwnerApproval), HOLD)
        .unwrap();
    assert!(matches!(
        queue.approve(&entry.id, AUTO_TIMEOUT_ACTOR),
        Err(WalletError::ApprovalUnauthorized)
    ));
}

#[test]
fn decisions_are_final() {
    let (_dir, queue) = open_queue();
    let entry = queue
        .enqueue("DRecipient", COIN, &decision("large", SpendAction::OwnerApproval), HOLD)
        .unwrap();

    queue.deny(&entry.id, OWNER).unwrap();
    assert!(matches!(queue.approve(&entry.id, OWNER), Err(WalletError::InvalidTransition(_))));
    assert!(matches!(queue.deny(&entry.id, OWNER), Err(WalletError::InvalidTransition(_))));
    assert_eq!(queue.get(&entry.id).unwrap().status, ApprovalStatus::Denied);
}

#[test]
fn unknown_id_is_reported() {
    let (_dir, queue) = open_queue();
    assert!(matches!(queue.approve("apr-missing", OWNER), Err(WalletError::ApprovalNotFound(_))));
}

#[test]
fn non_queued_actions_are_rejected() {
    let (_dir, queue) = open_queue();
    assert!(queue
        .enqueue("DRecipient", COIN, &decision("micro", SpendAction::Auto), HOLD)
        .is_err());
    assert!(queue.list().is_empty());
}

#[test]
fn delay_entries_auto_approve_at_expiry() {
    let (_dir, queue) = open_queue();
    let now = Utc::now();
    let entry = queue
        .enqueue_at("DRecipient", 500 * COIN, &decision("medium", SpendAction::Delay), HOLD, now)
        .unwrap();
    assert_eq!(entry.expires_at, now + ChronoDuration::seconds(60));

    assert!(queue
        .sweep_expired_at(now + ChronoDuration::seconds(59))
        .unwrap()
        .is_empty());

    let changed = queue.sweep_expired_at(now + ChronoDuration::seconds(60)).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].status, ApprovalStatus::Approved);
    assert_eq!(changed[0].decided_by.as_deref(), Some(AUTO_TIMEOUT_ACTOR));
    assert_eq!(queue.list_approved().len(), 1);
}

#[test]
fn owner_entries_expire_unanswered() {
    let (_dir, queue) = open_queue();
    let now = Utc::now();
    let approve = queue
        .enqueue_at("DRecipient", 2_000 * COIN, &decision("large", SpendAction::OwnerApproval), HOLD, now)
        .unwrap();
    let confirm = queue
        .enqueue_at("DRecipient", 9_000 * COIN, &decision("sweep", SpendAction::OwnerConfirmation), HOLD, now)
        .unwrap();

    let changed = queue.sweep_expired_at(now + ChronoDuration::minutes(5)).unwrap();
    assert_eq!(changed.len(), 2);
    assert!(changed.iter().all(|e| e.status == ApprovalStatus::Expired));
    assert!(queue.list_pending().is_empty());
    assert_eq!(queue.get(&approve.id).unwrap().status, ApprovalStatus::Expired);
    assert_eq!(queue.get(&confirm.id).unwrap().status, ApprovalStatus::Expired);
}

#[test]
fn late_approval_loses_to_the_timeout() {
    let (_dir, queue) = open_queue();
    let now = Utc::now();
    let entry = queue
        .enqueue_at("DRecipient", 2_000 * COIN, &decision("large", SpendAction::OwnerApproval), HOLD, now)
        .unwrap();

    let late = queue.approve_at(&entry.id, OWNER, now + ChronoDuration::seconds(61));
    assert!(matches!(late, Err(WalletError::InvalidTransition(_))));
    assert_eq!(queue.get(&entry.id).unwrap().status, ApprovalStatus::Expired);
}

#[test]
fn executed_only_after_approval() {
    let (_dir, queue) = open_queue();
    let entry = queue
        .enqueue("DRecipient", COIN, &decision("large", SpendAction::OwnerApproval), HOLD)
        .unwrap();
    assert!(matches!(
        queue.mark_executed(&entry.id, &txid(1)),
        Err(WalletError::InvalidTransition(_))
    ));

    queue.approve(&entry.id, OWNER).unwrap();
    let executed = queue.mark_executed(&entry.id, &txid(1)).unwrap();
    assert_eq!(executed.status, ApprovalStatus::Executed);
    assert_eq!(executed.txid, Some(txid(1)));
    assert!(queue.list_approved().is_empty());
}

#[test]
fn queue_survives_reopen() {
    init_test_environment();
    let dir = tempdir().unwrap();
    let id = {
        let queue = ApprovalQueue::open(dir.path(), OWNER).unwrap();
        queue
            .enqueue("DRecipient", COIN, &decision("large", SpendAction::OwnerApproval), HOLD)
            .unwrap()
            .id
    };

    let queue = ApprovalQueue::open(dir.path(), OWNER).unwrap();
    let pending = queue.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].action, SpendAction::OwnerApproval);
}

#[test]
fn open_entries_are_reserved() {
    let (_dir, queue) = open_queue();
    let large = decision("large", SpendAction::OwnerApproval);
    let a = queue.enqueue("DRecipient", 2_000 * COIN, &large, HOLD).unwrap();
    let b = queue.enqueue("DRecipient", 3_000 * COIN, &large, HOLD).unwrap();
    queue.approve(&b.id, OWNER).unwrap();

    assert_eq!(queue.outstanding(None), Reservation { amount: 5_000 * COIN, count: 2 });
    assert_eq!(queue.outstanding(Some(&b.id)), Reservation { amount: 2_000 * COIN, count: 1 });

    queue.deny(&a.id, OWNER).unwrap();
    queue.mark_executed(&b.id, &txid(1)).unwrap();
    assert_eq!(queue.outstanding(None), Reservation::default());
}

#[test]
fn decided_entries_are_dropped_after_retention() {
    init_test_environment();
    let dir = tempdir().unwrap();
    let queue = ApprovalQueue::open(dir.path(), OWNER).unwrap();
    let large = decision("large", SpendAction::OwnerApproval);
    let start = Utc::now();

    let denied = queue.enqueue_at("DRecipient", COIN, &large, HOLD, start).unwrap();
    let approved = queue.enqueue_at("DRecipient", COIN, &large, HOLD, start).unwrap();
    queue.deny_at(&denied.id, OWNER, start + ChronoDuration::seconds(10)).unwrap();
    queue.approve_at(&approved.id, OWNER, start + ChronoDuration::seconds(10)).unwrap();

    queue
        .enqueue_at("DRecipient", COIN, &large, HOLD, start + ChronoDuration::days(6))
        .unwrap();
    assert_eq!(queue.list().len(), 3);

    let later = queue
        .enqueue_at("DRecipient", COIN, &large, HOLD, start + ChronoDuration::days(8))
        .unwrap();
    assert!(queue.get(&denied.id).is_none());
    // Approved but not executed still holds its reservation
    assert_eq!(queue.get(&approved.id).unwrap().status, ApprovalStatus::Approved);
    assert!(queue.get(&later.id).is_some());

    let reopened = ApprovalQueue::open(dir.path(), OWNER).unwrap();
    assert_eq!(reopened.list().len(), 3);
}
