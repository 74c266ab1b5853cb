use super::{harness, test_config};

const W2_CRASHES: &str = r#"if [ "$SWARM_AGENT_NAME" = "W-2" ]; then echo "W-2 giving up"; exit 1; fi; echo "$SWARM_AGENT_NAME up"; sleep 30"#;

#[tokio::test]
async fn crashed_agent_is_reported_alongside_live_ones() {
    let h = harness(test_config(W2_CRASHES), Vec::new()).await;

    let launch = h.manager.launch(h.project_id, 4, 1).await.unwrap();
    assert_eq!(launch.launched, vec!["W-1", "W-2", "W-3", "W-4"]);
    assert!(launch.failed.is_empty());
    assert!(launch.pid > 0);

    let crashed = h.wait_for_event("agent_crashed").await;
    assert_eq!(crashed.agent_name, "W-2");
    assert_eq!(crashed.run_id, Some(launch.run_id));

    let status = h.manager.get_status(h.project_id).await.unwrap();
    assert_eq!(status.status, "running");
    assert_eq!(status.agents.len(), 4);
    let w2 = status.agents.iter().find(|a| a.name == "W-2").unwrap();
    assert!(!w2.alive);
    assert_eq!(w2.exit_code, Some(1));

    assert!(h.manager.stop(h.project_id).await.unwrap());
    let run = h.manager.get_run(launch.run_id).await.unwrap();
    assert_eq!(run.status, "stopped");

    let summary = run.summary.unwrap();
    let agents = summary["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 4);
    for agent in agents {
        if agent["name"] == "W-2" {
            assert_eq!(agent["exit_code"], 1);
        } else {
            assert!(agent["exit_code"].is_null(), "{agent}");
        }
    }
    assert_eq!(summary["crashes"], 1);
}

#[tokio::test]
async fn second_launch_is_rejected_while_running() {
    let h = harness(test_config("sleep 30"), Vec::new()).await;
    h.manager.launch(h.project_id, 1, 1).await.unwrap();

    let err = h.manager.launch(h.project_id, 1, 1).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(err.to_string().contains("already running"));

    h.manager.stop(h.project_id).await.unwrap();
}

#[tokio::test]
async fn launch_validates_before_spawning() {
    let h = harness(test_config("sleep 30"), Vec::new()).await;

    for count in [0, 17] {
        let err = h.manager.launch(h.project_id, count, 1).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
    let err = h.manager.launch(9999, 1, 1).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(h.manager.get_run_history(h.project_id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn launch_with_no_startable_agent_fails_and_marks_run_crashed() {
    let mut config = test_config("true");
    config.worker.command = "/nonexistent/worker-binary".to_string();
    let h = harness(config, Vec::new()).await;

    let err = h.manager.launch(h.project_id, 2, 1).await.unwrap_err();
    assert_eq!(err.kind(), "spawn");

    let runs = h.manager.get_run_history(h.project_id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "crashed");
    assert!(h.manager.get_status(h.project_id).await.unwrap().agents.is_empty());
}

#[tokio::test]
async fn workers_see_the_swarm_environment_and_output_is_captured() {
    let script = r#"echo "name=$SWARM_AGENT_NAME phases=$SWARM_MAX_PHASES"; echo "dir=$SWARM_DIRECTIVE_FILE""#;
    let h = harness(test_config(script), Vec::new()).await;

    h.manager.launch(h.project_id, 2, 3).await.unwrap();
    let run = h.wait_for_finish().await;
    assert_eq!(run.status, "completed");

    let w1 = h
        .manager
        .get_output(h.project_id, Some("W-1"), 0, None)
        .await
        .unwrap();
    assert_eq!(w1.lines[0], "name=W-1 phases=3");
    assert!(w1.lines[1].ends_with(".swarm/directives/W-1.json"));
    assert!(!w1.has_more);

    let combined = h.manager.get_output(h.project_id, None, 0, None).await.unwrap();
    assert_eq!(combined.total, 4);
    assert!(combined.lines.iter().any(|l| l == "[W-2] name=W-2 phases=3"));

    let found = h
        .manager
        .search_output(h.project_id, "phases=3", None, 0, 10)
        .await
        .unwrap();
    assert_eq!(found.matches.len(), 2);

    assert!(
        h.dir
            .path()
            .join(".swarm/logs/W-1.log")
            .exists()
    );
}

#[tokio::test]
async fn bad_agent_names_never_reach_the_filesystem() {
    let h = harness(test_config("true"), Vec::new()).await;
    for bad in ["W-0", "W-17", "../W-1", "w-1", "W-1; rm -rf /"] {
        let err = h
            .manager
            .get_output(h.project_id, Some(bad), 0, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation", "{bad}");
        let err = h
            .manager
            .send_directive(h.project_id, bad, "hello", "normal")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation", "{bad}");
    }
    assert!(!h.dir.path().join(".swarm").exists());
}
