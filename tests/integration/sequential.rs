//! Sequential loop: ordering, autonomy pauses, failure handling, retry,
//! cancellation.

use std::time::Duration;

use storyloop::error::BuildError;
use storyloop::events::BuildEvent;
use storyloop::settings::AutonomyLevel;
use storyloop::state::LogLevel;
use storyloop::{BuildStatus, BuildSummary, LoopExit, PauseReason, Story, StoryStatus};

use crate::support::{Harness, Script};

fn two_stories() -> Vec<Story> {
    vec![
        Story::new("US-001", "Create invoice table", 1).with_criteria(["Migration runs"]),
        Story::new("US-002", "Render invoice list", 2)
            .with_description("Reads the table created in US-001."),
    ]
}

fn completed(exit: LoopExit) -> BuildSummary {
    match exit {
        LoopExit::Completed(summary) => summary,
        other => panic!("expected completion, got {:?}", other),
    }
}

fn logged(h: &Harness, needle: &str) -> bool {
    h.events.count(|e| match e {
        BuildEvent::Log { entry, .. } => entry.message.contains(needle),
        _ => false,
    }) > 0
}

#[tokio::test]
async fn test_autonomous_build_runs_in_priority_order() {
    let mut stories = two_stories();
    stories.reverse();
    let h = Harness::new(stories);

    let summary = completed(h.controller.start(&h.project).await.expect("start"));

    assert!(summary.all_passed);
    assert_eq!(summary.complete, 2);
    assert_eq!(h.spawner.spawned(), vec!["US-001", "US-002"]);
    assert!(h.backlog.passes("US-001"));
    assert!(h.backlog.passes("US-002"));

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.status, BuildStatus::Idle);
    assert!(state.current_story_id.is_none());
    assert!(state.story_snapshots.is_empty());
    assert_eq!(h.snapshots.prepared.lock().expect("lock").len(), 2);
    assert_eq!(h.snapshots.discarded.lock().expect("lock").len(), 2);
    assert_eq!(
        h.events.count(|e| matches!(e, BuildEvent::BuildFinished { summary, .. } if summary.all_passed)),
        1
    );
    assert!(!h.controller.build(&h.project).await.is_owned());
}

#[tokio::test]
async fn test_manual_autonomy_pauses_before_second_story() {
    let h = Harness::new(two_stories());
    h.settings.set_autonomy(AutonomyLevel::Manual);

    let exit = h.controller.start(&h.project).await.expect("start");
    assert_eq!(exit, LoopExit::Paused(PauseReason::BeforeStory));
    assert_eq!(h.spawner.spawned(), vec!["US-001"]);

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.status, BuildStatus::Paused);
    assert_eq!(state.current_story_id.as_deref(), Some("US-002"));
    assert_eq!(state.story_status("US-001"), StoryStatus::Complete);
    assert_eq!(state.story_status("US-002"), StoryStatus::Pending);

    let summary = completed(h.controller.resume(&h.project).await.expect("resume"));
    assert!(summary.all_passed);
    assert_eq!(h.spawner.spawned(), vec!["US-001", "US-002"]);
}

#[tokio::test]
async fn test_pause_between_stops_after_each_success() {
    let h = Harness::new(two_stories());
    h.settings.set_autonomy(AutonomyLevel::PauseBetween);

    let exit = h.controller.start(&h.project).await.expect("start");
    assert_eq!(exit, LoopExit::Paused(PauseReason::BetweenStories));
    let state = h.controller.state(&h.project).await;
    assert_eq!(state.current_story_id.as_deref(), Some("US-002"));

    // the last story has nothing after it, so the loop completes
    let summary = completed(h.controller.resume(&h.project).await.expect("resume"));
    assert!(summary.all_passed);
}

#[tokio::test]
async fn test_autonomy_is_reread_between_stories() {
    let mut stories = two_stories();
    stories.push(Story::new("US-003", "Email receipts", 3));
    let h = Harness::new(stories);
    h.spawner.script(
        "US-001",
        Script::success().with_runtime(Duration::from_millis(150)),
    );

    let controller = h.controller.clone();
    let project = h.project.clone();
    let run = tokio::spawn(async move { controller.start(&project).await });

    h.wait_for("first agent", |h| h.spawner.spawned().len() == 1)
        .await;
    h.settings.set_autonomy(AutonomyLevel::Manual);

    let exit = run.await.expect("join").expect("loop");
    assert_eq!(exit, LoopExit::Paused(PauseReason::BeforeStory));
    assert_eq!(h.spawner.spawned(), vec!["US-001"]);
}

#[tokio::test]
async fn test_soft_failure_pauses_and_keeps_snapshot() {
    let h = Harness::new(two_stories());
    h.spawner
        .script("US-001", Script::soft_failure("Error: rate limit exceeded, retry later"));

    let exit = h.controller.start(&h.project).await.expect("start");
    assert_eq!(exit, LoopExit::Paused(PauseReason::StoryFailed));
    assert_eq!(h.spawner.spawned(), vec!["US-001"]);
    assert!(!h.backlog.passes("US-001"));

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.status, BuildStatus::Paused);
    assert_eq!(state.story_status("US-001"), StoryStatus::Failed);
    assert!(state.story_snapshots.contains_key("US-001"));
    assert_eq!(state.retry_count("US-001"), 0);
    assert_eq!(state.story_retries["US-001"].attempts(), 1);
    assert!(h.snapshots.discarded.lock().expect("lock").is_empty());
    assert_eq!(
        h.events.count(|e| matches!(e, BuildEvent::StoryFailed { reason, .. } if reason.contains("rate limit"))),
        1
    );
}

#[tokio::test]
async fn test_nonzero_exit_is_a_failure() {
    let h = Harness::new(two_stories());
    h.spawner.script("US-001", Script::exit(2));

    let exit = h.controller.start(&h.project).await.expect("start");
    assert_eq!(exit, LoopExit::Paused(PauseReason::StoryFailed));
    assert!(logged(&h, "exited with code 2"));
    let state = h.controller.state(&h.project).await;
    assert!(state
        .log
        .iter()
        .any(|e| e.level == LogLevel::Stderr && e.message.contains("E0425")));
}

#[tokio::test]
async fn test_retry_injects_previous_failure_and_uses_override() {
    let h = Harness::new(two_stories());
    h.spawner
        .script("US-001", Script::soft_failure("Error: rate limit exceeded, retry later"));
    h.controller.start(&h.project).await.expect("start");

    let summary = completed(
        h.controller
            .retry_story(&h.project, "US-001", Some("amp".to_string()))
            .await
            .expect("retry"),
    );
    assert!(summary.all_passed);

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.retry_count("US-001"), 1);
    // the failed attempt's rollback point is dropped once the story passes
    assert!(state.story_snapshots.is_empty());

    let retried = h.spawner.prompt(1);
    assert!(retried.starts_with("Implement story US-001"));
    assert!(retried.contains("## Previous attempt failed"));
    assert!(retried.contains("rate limit exceeded"));
    assert!(!h.spawner.prompt(0).contains("Previous attempt failed"));

    let log = h.spawner.log.lock().expect("lock");
    assert_eq!(log.executables[0], "claude");
    assert_eq!(log.executables[1], "amp");
    // the override applies to the retried story only
    assert_eq!(log.executables[2], "claude");
}

#[tokio::test]
async fn test_passing_stories_are_never_rerun() {
    let mut stories = two_stories();
    stories[0] = stories[0].clone().passing();
    let h = Harness::new(stories);

    let summary = completed(h.controller.start(&h.project).await.expect("start"));
    assert!(summary.all_passed);
    assert_eq!(h.spawner.spawned(), vec!["US-002"]);
}

#[tokio::test]
async fn test_run_from_story() {
    let h = Harness::new(two_stories());

    let err = h
        .controller
        .run_from_story(&h.project, "US-404")
        .await
        .expect_err("unknown story");
    assert!(matches!(err, BuildError::UnknownStory(id) if id == "US-404"));
    assert_eq!(h.controller.state(&h.project).await.status, BuildStatus::Idle);

    let summary = completed(
        h.controller
            .run_from_story(&h.project, "US-002")
            .await
            .expect("run from"),
    );
    assert_eq!(h.spawner.spawned(), vec!["US-002"]);
    assert!(!summary.all_passed);
    assert_eq!(summary.incomplete, 1);
}

#[tokio::test]
async fn test_second_start_is_ignored_and_cancel_is_idempotent() {
    let h = Harness::new(two_stories());
    h.spawner.script("US-001", Script::hang());

    let controller = h.controller.clone();
    let project = h.project.clone();
    let run = tokio::spawn(async move { controller.start(&project).await });
    h.wait_for("agent spawned", |h| h.spawner.spawned().len() == 1)
        .await;

    assert_eq!(
        h.controller.start(&h.project).await.expect("second start"),
        LoopExit::AlreadyRunning
    );

    assert!(h.controller.cancel(&h.project).await.expect("cancel"));
    assert_eq!(run.await.expect("join").expect("loop"), LoopExit::Cancelled);
    assert_eq!(h.spawner.kill_count(), 1);

    assert!(!h.controller.cancel(&h.project).await.expect("second cancel"));
    assert_eq!(h.spawner.kill_count(), 1);

    let state = h.controller.state(&h.project).await;
    assert_eq!(state.status, BuildStatus::Idle);
    assert_eq!(state.story_status("US-001"), StoryStatus::Pending);
    assert!(state.current_process_id.is_none());
    assert!(state.story_snapshots.contains_key("US-001"));
    assert!(state.story_retries.get("US-001").map_or(true, |r| r.attempts() == 0));
    assert_eq!(h.events.count(|e| matches!(e, BuildEvent::Cancelled { .. })), 1);
    assert!(!h.controller.build(&h.project).await.is_owned());
}

#[tokio::test]
async fn test_pause_request_holds_next_story_until_resume() {
    let h = Harness::new(two_stories());
    h.spawner.script(
        "US-001",
        Script::success().with_runtime(Duration::from_millis(100)),
    );

    let controller = h.controller.clone();
    let project = h.project.clone();
    let run = tokio::spawn(async move { controller.start(&project).await });
    h.wait_for("first agent", |h| h.spawner.spawned().len() == 1)
        .await;

    assert!(h.controller.pause(&h.project).await);
    h.wait_for("loop waiting", |h| logged(h, "Paused before US-002"))
        .await;
    assert_eq!(h.spawner.spawned(), vec!["US-001"]);

    // the loop still owns the project, so resume wakes it in place
    assert_eq!(
        h.controller.resume(&h.project).await.expect("resume"),
        LoopExit::AlreadyRunning
    );
    let summary = completed(run.await.expect("join").expect("loop"));
    assert!(summary.all_passed);
}

#[tokio::test]
async fn test_cancel_while_paused_ends_the_loop() {
    let h = Harness::new(two_stories());
    h.spawner.script(
        "US-001",
        Script::success().with_runtime(Duration::from_millis(100)),
    );

    let controller = h.controller.clone();
    let project = h.project.clone();
    let run = tokio::spawn(async move { controller.start(&project).await });
    h.wait_for("first agent", |h| h.spawner.spawned().len() == 1)
        .await;
    assert!(h.controller.pause(&h.project).await);
    h.wait_for("loop waiting", |h| logged(h, "Paused before US-002"))
        .await;

    assert!(h.controller.cancel(&h.project).await.expect("cancel"));
    assert_eq!(run.await.expect("join").expect("loop"), LoopExit::Cancelled);
    assert_eq!(h.spawner.spawned(), vec!["US-001"]);
    assert_eq!(h.spawner.kill_count(), 0);
}

#[tokio::test]
async fn test_resume_on_idle_build() {
    let h = Harness::new(two_stories());
    assert_eq!(
        h.controller.resume(&h.project).await.expect("resume"),
        LoopExit::NotPaused
    );
}

#[tokio::test]
async fn test_rollback_restores_retained_snapshot_once() {
    let h = Harness::new(two_stories());
    h.spawner.script("US-001", Script::exit(1));
    h.controller.start(&h.project).await.expect("start");

    assert!(h
        .controller
        .rollback_story(&h.project, "US-001")
        .await
        .expect("rollback"));
    assert_eq!(
        *h.snapshots.restored.lock().expect("lock"),
        vec!["stash@{0}".to_string()]
    );
    let state = h.controller.state(&h.project).await;
    assert_eq!(state.story_status("US-001"), StoryStatus::Pending);
    assert!(!h
        .controller
        .rollback_story(&h.project, "US-001")
        .await
        .expect("second rollback"));
}

#[tokio::test]
async fn test_rollback_after_retries_returns_to_the_state_before_the_first_attempt() {
    let h = Harness::new(two_stories());
    h.spawner.script("US-001", Script::exit(1));
    h.spawner.script("US-001", Script::exit(1));
    assert_eq!(
        h.controller.start(&h.project).await.expect("start"),
        LoopExit::Paused(PauseReason::StoryFailed)
    );
    assert_eq!(
        h.controller
            .retry_story(&h.project, "US-001", None)
            .await
            .expect("retry"),
        LoopExit::Paused(PauseReason::StoryFailed)
    );

    assert_eq!(*h.snapshots.prepared.lock().expect("lock"), vec!["US-001".to_string()]);
    assert!(h.snapshots.discarded.lock().expect("lock").is_empty());

    assert!(h
        .controller
        .rollback_story(&h.project, "US-001")
        .await
        .expect("rollback"));
    assert_eq!(
        *h.snapshots.restored.lock().expect("lock"),
        vec!["stash@{0}".to_string()]
    );
    assert!(h.controller.state(&h.project).await.story_snapshots.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_story_timeout_kills_and_fails() {
    let h = Harness::new(two_stories());
    h.settings
        .update_preferences(|prefs| prefs.story_timeout_secs = Some(5));
    h.spawner.script("US-001", Script::hang());

    let exit = h.controller.start(&h.project).await.expect("start");
    assert_eq!(exit, LoopExit::Paused(PauseReason::StoryFailed));
    assert_eq!(h.spawner.kill_count(), 1);
    assert!(logged(&h, "timed out after 5s"));
}

#[tokio::test]
async fn test_enforced_token_limit_blocks_without_spawning() {
    let h = Harness::new(two_stories());
    h.settings.update_preferences(|prefs| {
        prefs.max_tokens_per_story = Some(100);
        prefs.enforce_token_limit = true;
    });

    let exit = h.controller.start(&h.project).await.expect("start");
    assert_eq!(exit, LoopExit::Paused(PauseReason::BudgetBlocked));
    assert!(h.spawner.spawned().is_empty());
    assert!(h.events.count(|e| matches!(e, BuildEvent::BudgetWarning { .. })) >= 1);
}

#[tokio::test]
async fn test_token_limit_is_advisory_by_default() {
    let h = Harness::new(two_stories());
    h.settings
        .update_preferences(|prefs| prefs.max_tokens_per_story = Some(100));

    let summary = completed(h.controller.start(&h.project).await.expect("start"));
    assert!(summary.all_passed);
    assert_eq!(
        h.events.count(|e| matches!(e, BuildEvent::BudgetWarning { .. })),
        2
    );
}

#[tokio::test]
async fn test_unknown_agent_fails_the_story() {
    let h = Harness::new(two_stories());
    h.settings.project.lock().expect("lock").agent = Some("nope".to_string());

    let exit = h.controller.start(&h.project).await.expect("start");
    assert_eq!(exit, LoopExit::Paused(PauseReason::StoryFailed));
    assert!(h.spawner.spawned().is_empty());
    assert!(logged(&h, "unknown agent nope"));
}

#[tokio::test]
async fn test_notifications_follow_preference() {
    let h = Harness::new(two_stories());
    h.controller.start(&h.project).await.expect("start");
    // two stories and the final summary
    assert_eq!(
        h.events.count(|e| matches!(e, BuildEvent::Notification { .. })),
        3
    );

    let h = Harness::new(two_stories());
    h.settings
        .update_preferences(|prefs| prefs.build_notifications = false);
    h.controller.start(&h.project).await.expect("start");
    assert_eq!(
        h.events.count(|e| matches!(e, BuildEvent::Notification { .. })),
        0
    );
}
