use super::{harness, test_config};

#[tokio::test]
async fn stop_clears_all_tracking_for_the_project() {
    let h = harness(test_config("echo started; sleep 30"), Vec::new()).await;
    let launch = h.manager.launch(h.project_id, 3, 1).await.unwrap();
    h.wait_for_event("agent_started").await;

    assert!(h.manager.stop(h.project_id).await.unwrap());

    let status = h.manager.get_status(h.project_id).await.unwrap();
    assert_eq!(status.status, "stopped");
    assert!(status.agents.is_empty());
    assert_eq!(status.output_lines, 0);

    let run = h.manager.get_run(launch.run_id).await.unwrap();
    assert_eq!(run.status, "stopped");
    assert!(run.ended_at.is_some());
    assert_eq!(run.summary.unwrap()["reason"], "cancelled");

    // Stopping again is harmless, and the project can be relaunched.
    assert!(!h.manager.stop(h.project_id).await.unwrap());
    let again = h.manager.launch(h.project_id, 1, 1).await.unwrap();
    assert_ne!(again.run_id, launch.run_id);
    h.manager.stop(h.project_id).await.unwrap();
}

#[tokio::test]
async fn run_timeout_stops_every_agent() {
    let mut config = test_config("sleep 30");
    config.supervisor.run_timeout_secs = 1;
    let h = harness(config, Vec::new()).await;

    let launch = h.manager.launch(h.project_id, 2, 1).await.unwrap();
    let run = h.wait_for_finish().await;
    assert_eq!(run.id, launch.run_id);
    assert_eq!(run.status, "stopped");
    assert_eq!(run.summary.unwrap()["reason"], "timeout");

    let status = h.manager.get_status(h.project_id).await.unwrap();
    assert!(status.agents.iter().all(|a| !a.alive));
    assert_eq!(h.events("agent_stopped").await.len(), 2);
}

#[tokio::test]
async fn run_history_and_comparison() {
    let h = harness(test_config("echo one"), Vec::new()).await;
    let first = h.manager.launch(h.project_id, 1, 1).await.unwrap();
    h.wait_for_finish().await;

    let mut config = test_config("echo one; echo two; echo three");
    config.worker.pipe_stdin = false;
    let h2 = super::Harness {
        manager: crate::core::swarm::SwarmManager::new(h.manager.store().clone(), config),
        project_id: h.project_id,
        dir: h.dir,
    };
    let second = h2.manager.launch(h2.project_id, 1, 1).await.unwrap();
    h2.wait_for_finish().await;

    let history = h2.manager.get_run_history(h2.project_id, 10).await.unwrap();
    assert_eq!(
        history.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![second.run_id, first.run_id]
    );

    let cmp = h2
        .manager
        .compare_runs(first.run_id, second.run_id)
        .await
        .unwrap();
    assert_eq!(cmp.delta.total_output_lines, 2);
    assert_eq!(cmp.delta.crashes, 0);
    assert!(cmp.delta.duration_secs.is_some());

    let err = h2.manager.compare_runs(first.run_id, 424242).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn status_reports_the_filesystem_contract() {
    let h = harness(test_config("sleep 30"), Vec::new()).await;
    let swarm = h.dir.path().join(".swarm");
    std::fs::create_dir_all(swarm.join("signals")).unwrap();
    std::fs::create_dir_all(swarm.join("attention")).unwrap();
    std::fs::create_dir_all(swarm.join("heartbeats")).unwrap();
    std::fs::write(swarm.join("tasks.md"), "- [x] parse\n- [ ] emit\n").unwrap();
    std::fs::write(swarm.join("phase"), "2\n").unwrap();
    std::fs::write(swarm.join("signals/build-green"), "").unwrap();
    std::fs::write(swarm.join("attention/W-1"), "").unwrap();
    std::fs::write(swarm.join("heartbeats/W-1"), "").unwrap();

    h.manager.launch(h.project_id, 2, 3).await.unwrap();
    let status = h.manager.get_status(h.project_id).await.unwrap();
    assert_eq!(status.tasks.total, 2);
    assert_eq!(status.tasks.done, 1);
    assert_eq!(status.tasks.percent, 50);
    assert_eq!(status.phase, 2);
    assert_eq!(status.max_phases, 3);
    assert_eq!(status.signals, vec!["build-green"]);

    let w1 = &status.agents[0];
    assert_eq!(w1.name, "W-1");
    assert!(w1.needs_attention);
    assert!(w1.last_heartbeat_secs.is_some());
    assert_eq!(w1.breaker, "closed");
    assert!(!status.agents[1].needs_attention);

    h.manager.stop(h.project_id).await.unwrap();
}

#[tokio::test]
async fn prompt_edits_during_a_run_are_reported() {
    let h = harness(test_config("sleep 30"), Vec::new()).await;
    h.manager.launch(h.project_id, 1, 1).await.unwrap();
    let prompt = h.dir.path().join(".swarm/prompts/W-1.md");
    std::fs::write(&prompt, "focus on the tokenizer").unwrap();

    let changed = h.wait_for_event("prompt_changed").await;
    assert_eq!(changed.agent_name, "W-1");
    assert_eq!(changed.detail, "updated");

    std::fs::remove_file(&prompt).unwrap();
    let mut details = Vec::new();
    for _ in 0..100 {
        details = h
            .events("prompt_changed")
            .await
            .into_iter()
            .map(|e| e.detail)
            .collect();
        if details.len() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(details, vec!["removed", "updated"]);
    h.manager.stop(h.project_id).await.unwrap();
}
