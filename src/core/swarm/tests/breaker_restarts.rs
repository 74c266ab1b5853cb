use super::{harness, test_config};

#[tokio::test]
async fn repeated_crashes_open_the_circuit() {
    let mut config = test_config("echo crashing; exit 1");
    config.supervisor.auto_restart = true;
    config.breaker.max_failures = 2;
    config.breaker.recovery_secs = 300;
    let h = harness(config, Vec::new()).await;

    h.manager.launch(h.project_id, 1, 1).await.unwrap();
    let run = h.wait_for_finish().await;
    assert_eq!(run.status, "completed");

    let restarts = h.events("agent_restarted").await;
    assert_eq!(restarts.len(), 1);
    assert!(restarts[0].detail.contains("reason=crash"));
    assert_eq!(h.events("agent_crashed").await.len(), 2);
    assert_eq!(h.events("circuit_opened").await.len(), 1);

    let summary = run.summary.unwrap();
    assert_eq!(summary["crashes"], 2);
    assert_eq!(summary["restarts"], 1);

    let status = h.manager.get_status(h.project_id).await.unwrap();
    assert_eq!(status.agents[0].breaker, "open");
    assert_eq!(status.agents[0].restarts, 1);
}

#[tokio::test]
async fn no_restart_when_auto_restart_is_off() {
    let h = harness(test_config("exit 2"), Vec::new()).await;
    h.manager.launch(h.project_id, 1, 1).await.unwrap();
    h.wait_for_finish().await;

    assert!(h.events("agent_restarted").await.is_empty());
    assert_eq!(h.events("agent_crashed").await.len(), 1);
}

#[tokio::test]
async fn clean_exit_is_not_restarted() {
    let mut config = test_config("echo ok");
    config.supervisor.auto_restart = true;
    let h = harness(config, Vec::new()).await;
    h.manager.launch(h.project_id, 1, 1).await.unwrap();
    h.wait_for_finish().await;

    assert!(h.events("agent_restarted").await.is_empty());
    let stopped = h.events("agent_stopped").await;
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].detail, "exit code 0");
}

#[tokio::test]
async fn recovered_agent_closes_the_circuit_while_others_keep_running() {
    let script = r#"if [ "$SWARM_AGENT_NAME" = W-2 ]; then
  n=$(cat w2.count 2>/dev/null || echo 0); n=$((n+1)); echo $n > w2.count
  if [ $n -le 2 ]; then echo crashing; exit 1; fi
fi
sleep 30"#;
    let mut config = test_config(script);
    config.supervisor.auto_restart = true;
    config.breaker.max_failures = 2;
    config.breaker.recovery_secs = 1;
    config.breaker.probe_grace_secs = 1;
    let h = harness(config, Vec::new()).await;
    h.manager.launch(h.project_id, 2, 1).await.unwrap();

    let mut closed = false;
    for _ in 0..200 {
        let status = h.manager.get_status(h.project_id).await.unwrap();
        if status
            .agents
            .iter()
            .any(|a| a.name.as_str() == "W-2" && a.restarts == 2 && a.breaker == "closed")
        {
            closed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(closed, "breaker for W-2 never closed again");

    assert_eq!(h.events("circuit_opened").await.len(), 1);
    let restarts = h.events("agent_restarted").await;
    let retries: Vec<_> = restarts
        .iter()
        .filter(|e| e.detail.contains("reason=probe"))
        .collect();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].agent_name, "W-2");
    assert!(restarts.iter().all(|e| e.agent_name == "W-2"));

    let status = h.manager.get_status(h.project_id).await.unwrap();
    assert_eq!(status.status, "running");
    assert!(status.agents.iter().all(|a| a.alive));
    h.manager.stop(h.project_id).await.unwrap();
}
