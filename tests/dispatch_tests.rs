//! Batch release, pause gating, failure tolerance and task completion.

mod test_harness;

use ibex_dispatch::admission::TaskForm;
use ibex_dispatch::scheduler::{ActionKind, HostStatus, PauseReason, ScheduleOutcome};
use ibex_dispatch::store::SchedulerStore;
use test_harness::*;

const T0: i64 = 1_700_000_000;

fn outcome_of(outcomes: &[(i64, ScheduleOutcome)], id: i64) -> ScheduleOutcome {
    outcomes
        .iter()
        .find(|(task, _)| *task == id)
        .map(|(_, outcome)| outcome.clone())
        .expect("task was not scheduled")
}

#[tokio::test]
async fn test_batch_release_follows_host_order() {
    let mut replica = TestReplica::standalone();
    let id = replica
        .add(
            &TaskForm {
                batch: 2,
                ..form(&["a", "b", "c", "d"])
            },
            T0,
        )
        .await;

    let outcomes = replica.tick(T0).await;
    assert_eq!(
        outcome_of(&outcomes, id),
        ScheduleOutcome::Released {
            hosts: vec!["a".to_string(), "b".to_string()],
            paused_at: None,
        }
    );
    assert_eq!(doing_hosts(&replica.store, id).await, vec!["a", "b"]);
    assert_eq!(
        hosts_with(&replica.store, id, HostStatus::Waiting).await,
        vec!["c", "d"]
    );

    // Nothing finished yet: batch is full.
    let outcomes = replica.tick(T0 + 1).await;
    assert_eq!(outcome_of(&outcomes, id), ScheduleOutcome::Idle);

    replica.project().await;
    replica.report("a", vec![reported(id, T0, "success")]).await;

    let outcomes = replica.tick(T0 + 2).await;
    assert_eq!(
        outcome_of(&outcomes, id),
        ScheduleOutcome::Released {
            hosts: vec!["c".to_string()],
            paused_at: None,
        }
    );
    assert_eq!(doing_hosts(&replica.store, id).await, vec!["b", "c"]);
    assert_eq!(
        hosts_with(&replica.store, id, HostStatus::Success).await,
        vec!["a"]
    );
}

#[tokio::test]
async fn test_doing_count_never_exceeds_batch() {
    let mut replica = TestReplica::standalone();
    let hosts: Vec<String> = (0..12).map(|i| format!("h{i:02}")).collect();
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
    let id = replica
        .add(
            &TaskForm {
                batch: 3,
                ..form(&host_refs)
            },
            T0,
        )
        .await;

    for step in 0..12 {
        let now = T0 + step;
        replica.tick(now).await;
        let doing = doing_hosts(&replica.store, id).await;
        assert!(doing.len() <= 3, "step {step}: {doing:?}");

        // Finish one in-flight host per step.
        replica.project().await;
        if let Some(host) = doing.first() {
            let clock = replica.doing.find(host, id).await.unwrap().clock;
            replica.report(host, vec![reported(id, clock, "success")]).await;
        }
    }
}

#[tokio::test]
async fn test_batch_zero_releases_everything() {
    let replica = TestReplica::standalone();
    let id = replica.add(&form(&["a", "b", "c"]), T0).await;

    replica.tick(T0).await;
    assert_eq!(doing_hosts(&replica.store, id).await, vec!["a", "b", "c"]);
    assert_eq!(replica.store.waiting_host_count(id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_pause_host_gates_release_until_restart() {
    let replica = TestReplica::standalone();
    let id = replica
        .add(
            &TaskForm {
                batch: 10,
                pause: "h3".to_string(),
                ..form(&["h1", "h2", "h3", "h4"])
            },
            T0,
        )
        .await;

    let outcomes = replica.tick(T0).await;
    assert_eq!(
        outcome_of(&outcomes, id),
        ScheduleOutcome::Released {
            hosts: vec!["h1".to_string(), "h2".to_string(), "h3".to_string()],
            paused_at: Some("h3".to_string()),
        }
    );
    assert_eq!(
        hosts_with(&replica.store, id, HostStatus::Waiting).await,
        vec!["h4"]
    );
    let action = replica.store.task_action(id).await.unwrap().unwrap();
    assert_eq!(action.action, ActionKind::Pause);

    let outcomes = replica.tick(T0 + 1).await;
    assert_eq!(
        outcome_of(&outcomes, id),
        ScheduleOutcome::Held(ActionKind::Pause)
    );

    // Restarting clears ownership; the next heartbeat reclaims the task.
    replica
        .admission
        .update_action(id, "start", T0 + 2)
        .await
        .unwrap();
    assert_eq!(replica.store.owner_of(id).await.as_deref(), Some(""));

    let outcomes = replica.tick(T0 + 3).await;
    assert_eq!(
        outcome_of(&outcomes, id),
        ScheduleOutcome::Released {
            hosts: vec!["h4".to_string()],
            paused_at: None,
        }
    );
    assert_eq!(
        replica.store.owner_of(id).await.as_deref(),
        Some(replica.identity.as_str())
    );
}

#[tokio::test]
async fn test_tolerance_breach_pauses_task() {
    let mut replica = TestReplica::standalone();
    let id = replica
        .add(
            &TaskForm {
                batch: 5,
                tolerance: 1,
                ..form(&["h1", "h2", "h3", "h4", "h5", "h6"])
            },
            T0,
        )
        .await;

    replica.tick(T0).await;
    replica.project().await;
    for host in ["h1", "h2", "h3", "h4"] {
        replica.report(host, vec![reported(id, T0, "failed")]).await;
    }

    let outcomes = replica.tick(T0 + 1).await;
    assert_eq!(
        outcome_of(&outcomes, id),
        ScheduleOutcome::Paused(PauseReason::Tolerance {
            unexpected: 4,
            tolerance: 1,
        })
    );
    assert_eq!(
        hosts_with(&replica.store, id, HostStatus::Waiting).await,
        vec!["h6"]
    );
    let action = replica.store.task_action(id).await.unwrap().unwrap();
    assert_eq!(action.action, ActionKind::Pause);
}

#[tokio::test]
async fn test_tolerance_at_limit_keeps_releasing() {
    let mut replica = TestReplica::standalone();
    let id = replica
        .add(
            &TaskForm {
                batch: 1,
                tolerance: 1,
                ..form(&["h1", "h2"])
            },
            T0,
        )
        .await;

    replica.tick(T0).await;
    replica.project().await;
    replica.report("h1", vec![reported(id, T0, "failed")]).await;

    let outcomes = replica.tick(T0 + 1).await;
    assert_eq!(
        outcome_of(&outcomes, id),
        ScheduleOutcome::Released {
            hosts: vec!["h2".to_string()],
            paused_at: None,
        }
    );
}

#[tokio::test]
async fn test_task_completes_once_drained() {
    let mut replica = TestReplica::standalone();
    let id = replica.add(&form(&["a"]), T0).await;

    replica.tick(T0).await;
    replica.project().await;
    replica.report("a", vec![reported(id, T0, "success")]).await;

    let outcomes = replica.tick(T0 + 1).await;
    assert_eq!(outcome_of(&outcomes, id), ScheduleOutcome::Done);
    assert!(replica.store.task_action(id).await.unwrap().is_none());
    assert_eq!(replica.store.owner_of(id).await, None);
    assert_eq!(replica.admission.done_ids(&[id]).await.unwrap(), vec![id]);

    // A done task is no longer scheduled.
    let outcomes = replica.tick(T0 + 2).await;
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn test_done_task_stays_done() {
    let mut replica = TestReplica::standalone();
    let id = replica.add(&form(&["a", "b"]), T0).await;

    replica.tick(T0).await;
    replica.project().await;
    replica.report("a", vec![reported(id, T0, "success")]).await;
    replica.report("b", vec![reported(id, T0, "failed")]).await;
    replica.tick(T0 + 1).await;
    assert!(replica.store.task_action(id).await.unwrap().is_none());

    // Nothing can bring hosts of a done task back to running.
    let released = replica
        .store
        .run_waiting_hosts(id, &["a".to_string(), "b".to_string()], T0 + 2)
        .await
        .unwrap();
    assert!(released.is_empty());

    let err = replica
        .admission
        .update_action(id, "start", T0 + 2)
        .await
        .unwrap_err();
    assert!(matches!(err, ibex_dispatch::DispatchError::TaskNotFound(_)));

    let err = replica
        .admission
        .host_action(id, "b", "redo".parse().unwrap(), T0 + 2)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already done"), "{err}");
    assert!(doing_hosts(&replica.store, id).await.is_empty());
}

#[tokio::test]
async fn test_created_paused_task_is_not_claimed() {
    let replica = TestReplica::standalone();
    let id = replica
        .add(
            &TaskForm {
                action: "pause".to_string(),
                ..form(&["a"])
            },
            T0,
        )
        .await;

    let outcomes = replica.tick(T0).await;
    assert!(outcomes.is_empty());
    assert_eq!(replica.store.owner_of(id).await.as_deref(), Some(""));
    assert_eq!(
        hosts_with(&replica.store, id, HostStatus::Waiting).await,
        vec!["a"]
    );
}
