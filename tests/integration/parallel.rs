//! Parallel loop: admission limits, prerequisite gating, conflicts,
//! worktree finalization, cancellation.

use std::sync::atomic::Ordering;
use std::time::Duration;

use storyloop::events::BuildEvent;
use storyloop::settings::AutonomyLevel;
use storyloop::{BuildMode, BuildStatus, BuildSummary, LoopExit, Story, StoryStatus};

use crate::support::{Harness, Script};

fn independent_stories() -> Vec<Story> {
    vec![
        Story::new("P-001", "Render invoice totals", 1),
        Story::new("P-002", "Export audit trail", 2),
        Story::new("P-003", "Configure payment webhooks", 3),
    ]
}

fn completed(exit: LoopExit) -> BuildSummary {
    match exit {
        LoopExit::Completed(summary) => summary,
        other => panic!("expected completion, got {:?}", other),
    }
}

async fn run_parallel(h: &Harness) -> LoopExit {
    h.controller
        .start_with_mode(&h.project, BuildMode::Parallel)
        .await
        .expect("parallel build")
}

#[tokio::test]
async fn test_runs_up_to_the_agent_limit_in_worktrees() {
    let h = Harness::new(independent_stories());
    h.settings
        .update_preferences(|prefs| prefs.max_parallel_agents = 2);
    for id in ["P-001", "P-002", "P-003"] {
        h.spawner
            .script(id, Script::success().with_runtime(Duration::from_millis(60)));
    }

    let summary = completed(run_parallel(&h).await);
    assert!(summary.all_passed);
    assert_eq!(summary.complete, 3);
    assert_eq!(summary.blocked, 0);

    let log = h.spawner.log.lock().expect("lock");
    assert_eq!(log.max_active, 2);
    // the lowest priority story waits for a free slot
    assert_eq!(log.spawned[2], "P-003");
    for dir in &log.working_directories {
        assert!(dir.starts_with(h.project.path().join(".storyloop/worktrees")));
    }
    drop(log);

    assert!(h.snapshots.prepared.lock().expect("lock").is_empty());
    let finalized = h.worktrees.finalized.lock().expect("lock");
    assert_eq!(finalized.len(), 3);
    assert!(finalized.iter().all(|(_, success)| *success));

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.status, BuildStatus::Idle);
    assert_eq!(state.mode, Some(BuildMode::Parallel));
    assert!(state.active_processes.is_empty());
}

#[tokio::test]
async fn test_prerequisites_finish_before_dependents_start() {
    let mut stories = independent_stories();
    stories[0] = stories[0]
        .clone()
        .with_description("Uses the export produced by P-002.");
    let h = Harness::new(stories);
    h.settings
        .update_preferences(|prefs| prefs.max_parallel_agents = 3);

    let summary = completed(run_parallel(&h).await);
    assert!(summary.all_passed);

    let log = h.spawner.log.lock().expect("lock");
    let spawned_at = |id: &str| log.spawned.iter().position(|s| s == id).expect("spawned");
    let finished_at = |id: &str| log.finished.iter().position(|s| s == id).expect("finished");
    assert!(spawned_at("P-001") > spawned_at("P-002"));
    assert!(!log.overlaps.contains(&("P-001".to_string(), "P-002".to_string())));
    assert!(!log.overlaps.contains(&("P-002".to_string(), "P-001".to_string())));
    assert!(finished_at("P-002") < finished_at("P-001"));
}

#[tokio::test]
async fn test_stories_touching_the_same_file_never_overlap() {
    let h = Harness::new(vec![
        Story::new("P-001", "Render invoice totals", 1)
            .with_description("Update src/billing/totals.rs to round per line."),
        Story::new("P-002", "Export audit trail", 2)
            .with_description("Add an export hook in src/billing/totals.rs."),
        Story::new("P-003", "Configure payment webhooks", 3),
    ]);
    h.settings
        .update_preferences(|prefs| prefs.max_parallel_agents = 3);
    for id in ["P-001", "P-002", "P-003"] {
        h.spawner
            .script(id, Script::success().with_runtime(Duration::from_millis(40)));
    }

    let summary = completed(run_parallel(&h).await);
    assert!(summary.all_passed);

    let log = h.spawner.log.lock().expect("lock");
    assert!(!log.overlaps.contains(&("P-001".to_string(), "P-002".to_string())));
    assert!(!log.overlaps.contains(&("P-002".to_string(), "P-001".to_string())));
    // the unrelated story still ran alongside
    assert_eq!(log.max_active, 2);
}

#[tokio::test]
async fn test_failure_blocks_dependents_but_not_others() {
    let mut stories = independent_stories();
    stories[1] = stories[1]
        .clone()
        .with_description("Include the totals from P-001 in every row.");
    let h = Harness::new(stories);
    h.settings
        .update_preferences(|prefs| prefs.max_parallel_agents = 3);
    h.spawner.script("P-001", Script::exit(1));

    let summary = completed(run_parallel(&h).await);
    assert_eq!(summary.complete, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.blocked_stories, vec!["P-002".to_string()]);
    assert_eq!(summary.incomplete, 2);
    assert!(!summary.all_passed);
    assert_eq!(
        summary.headline(),
        "2 stories incomplete, 1 failed, 1 blocked"
    );

    assert_eq!(h.spawner.spawned().len(), 2);
    assert!(h.backlog.passes("P-003"));
    let state = h.controller.state(&h.project).await;
    assert_eq!(state.story_status("P-001"), StoryStatus::Failed);
    assert_eq!(state.story_status("P-002"), StoryStatus::Pending);
    assert!(h
        .worktrees
        .finalized
        .lock()
        .expect("lock")
        .contains(&("P-001".to_string(), false)));
}

#[tokio::test]
async fn test_parallel_mode_ignores_autonomy() {
    let h = Harness::new(independent_stories());
    h.settings.set_autonomy(AutonomyLevel::Manual);

    let summary = completed(run_parallel(&h).await);
    assert!(summary.all_passed);
    assert_eq!(h.events.count(|e| matches!(e, BuildEvent::Paused { .. })), 0);
}

#[tokio::test]
async fn test_merge_conflict_is_recorded_and_dismissable() {
    let h = Harness::new(independent_stories());
    h.worktrees
        .conflicting
        .lock()
        .expect("lock")
        .insert("P-001".to_string());

    let summary = completed(run_parallel(&h).await);
    assert_eq!(summary.complete, 2);
    assert_eq!(summary.failed, 1);
    assert!(!h.backlog.passes("P-001"));

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.conflicted_branches.len(), 1);
    assert_eq!(state.conflicted_branches[0].story_id, "P-001");
    assert_eq!(state.conflicted_branches[0].branch_name, "story/p-001");
    assert_eq!(
        h.events.count(|e| matches!(e, BuildEvent::MergeConflict { conflict, .. } if conflict.story_id == "P-001")),
        1
    );

    assert!(h.controller.dismiss_conflict(&h.project, "P-001").await);
    assert!(!h.controller.dismiss_conflict(&h.project, "P-001").await);
    assert!(h
        .controller
        .state(&h.project)
        .await
        .conflicted_branches
        .is_empty());
}

#[tokio::test]
async fn test_cancel_kills_every_agent_and_removes_worktrees() {
    let h = Harness::new(independent_stories());
    h.settings
        .update_preferences(|prefs| prefs.max_parallel_agents = 3);
    for id in ["P-001", "P-002", "P-003"] {
        h.spawner.script(id, Script::hang());
    }

    let controller = h.controller.clone();
    let project = h.project.clone();
    let run = tokio::spawn(async move {
        controller
            .start_with_mode(&project, BuildMode::Parallel)
            .await
    });
    h.wait_for("three agents", |h| h.spawner.spawned().len() == 3)
        .await;

    assert!(h.controller.cancel(&h.project).await.expect("cancel"));
    assert_eq!(run.await.expect("join").expect("loop"), LoopExit::Cancelled);
    assert_eq!(h.spawner.kill_count(), 3);
    assert_eq!(h.worktrees.cleanups.load(Ordering::SeqCst), 1);

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.status, BuildStatus::Idle);
    assert!(state.active_processes.is_empty());
    for id in ["P-001", "P-002", "P-003"] {
        assert_eq!(state.story_status(id), StoryStatus::Pending);
    }

    assert!(!h.controller.cancel(&h.project).await.expect("second cancel"));
    assert_eq!(h.spawner.kill_count(), 3);
    assert_eq!(h.worktrees.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_prerequisite_cycle_members_are_reported_blocked() {
    let h = Harness::new(vec![
        Story::new("P-001", "Render invoice totals", 1).with_description("Builds on P-002."),
        Story::new("P-002", "Export audit trail", 2).with_description("Builds on P-001."),
        Story::new("P-003", "Configure payment webhooks", 3),
    ]);

    let summary = completed(run_parallel(&h).await);
    assert_eq!(summary.complete, 1);
    assert_eq!(summary.blocked, 2);
    assert_eq!(
        summary.blocked_stories,
        vec!["P-001".to_string(), "P-002".to_string()]
    );
    assert_eq!(h.spawner.spawned(), vec!["P-003"]);
}

#[tokio::test]
async fn test_pause_stops_admission_until_resume() {
    let h = Harness::new(independent_stories());
    h.settings
        .update_preferences(|prefs| prefs.max_parallel_agents = 1);
    h.spawner.script(
        "P-001",
        Script::success().with_runtime(Duration::from_millis(100)),
    );

    let controller = h.controller.clone();
    let project = h.project.clone();
    let run = tokio::spawn(async move {
        controller
            .start_with_mode(&project, BuildMode::Parallel)
            .await
    });
    h.wait_for("first agent", |h| h.spawner.spawned().len() == 1)
        .await;
    assert!(h.controller.pause(&h.project).await);

    h.wait_for("running agent drained", |h| {
        h.spawner.log.lock().expect("lock").finished.len() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.spawner.spawned(), vec!["P-001"]);
    assert_eq!(h.controller.state(&h.project).await.status, BuildStatus::Paused);

    assert_eq!(
        h.controller.resume(&h.project).await.expect("resume"),
        LoopExit::AlreadyRunning
    );
    let summary = completed(run.await.expect("join").expect("loop"));
    assert!(summary.all_passed);
    assert_eq!(h.spawner.spawned(), vec!["P-001", "P-002", "P-003"]);
}

#[tokio::test]
async fn test_plan_reports_order_prerequisites_and_cycles_without_spawning() {
    let h = Harness::new(vec![
        Story::new("P-000", "Bootstrap workspace", 0).passing(),
        Story::new("P-001", "Render invoice totals", 1).with_description("Needs P-003 first."),
        Story::new("P-002", "Export audit trail", 2).with_description("Mirrors P-004."),
        Story::new("P-003", "Configure payment webhooks", 3),
        Story::new("P-004", "Archive audit exports", 4).with_notes("Shares the format of P-002."),
    ]);

    let plan = h.controller.plan(&h.project).await.expect("plan");

    let order: Vec<&str> = plan.stories.iter().map(|p| p.story.id.as_str()).collect();
    assert_eq!(order, vec!["P-001", "P-002", "P-003", "P-004"]);
    assert_eq!(plan.stories[0].prerequisites, vec!["P-003".to_string()]);
    assert_eq!(plan.cycles.len(), 1);
    assert_eq!(plan.cycles[0].story_ids, vec!["P-002", "P-004"]);
    assert_eq!(
        plan.total_estimated_tokens(),
        plan.stories.iter().map(|p| p.estimate.estimated_tokens).sum::<u64>()
    );
    assert!(h.spawner.spawned().is_empty());
}

#[tokio::test]
async fn test_crashed_story_task_frees_its_slot() {
    let h = Harness::new(independent_stories());
    h.settings
        .update_preferences(|prefs| prefs.max_parallel_agents = 1);
    h.worktrees
        .panicking
        .lock()
        .expect("lock")
        .insert("P-001".to_string());

    let summary = completed(run_parallel(&h).await);

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.complete, 2);
    assert!(summary.blocked_stories.is_empty());
    assert_eq!(h.spawner.spawned(), vec!["P-002", "P-003"]);

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.story_status("P-001"), StoryStatus::Failed);
    assert!(state.active_processes.is_empty());
}

#[tokio::test]
async fn test_cancel_keeps_branches_awaiting_conflict_resolution() {
    let h = Harness::new(independent_stories());
    h.settings
        .update_preferences(|prefs| prefs.max_parallel_agents = 2);
    h.worktrees
        .conflicting
        .lock()
        .expect("lock")
        .insert("P-001".to_string());
    h.spawner.script("P-002", Script::hang());

    let controller = h.controller.clone();
    let project = h.project.clone();
    let run = tokio::spawn(async move {
        controller
            .start_with_mode(&project, BuildMode::Parallel)
            .await
    });
    h.wait_for("the conflict on P-001", |h| {
        h.events
            .count(|e| matches!(e, BuildEvent::MergeConflict { .. }))
            == 1
    })
    .await;

    assert!(h.controller.cancel(&h.project).await.expect("cancel"));
    assert_eq!(run.await.expect("join").expect("loop"), LoopExit::Cancelled);

    assert_eq!(
        *h.worktrees.kept_on_cleanup.lock().expect("lock"),
        vec![vec!["story/p-001".to_string()]]
    );
    let state = h.controller.state(&h.project).await;
    assert_eq!(state.conflicted_branches.len(), 1);
    assert_eq!(state.conflicted_branches[0].branch_name, "story/p-001");
}
