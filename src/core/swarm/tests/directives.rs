use super::{harness, test_config};

/// Waits for its mailbox, echoes the directive, deletes it, then idles.
const CONSUMER: &str = r#"while [ ! -f "$SWARM_DIRECTIVE_FILE" ]; do sleep 0.1; done; cat "$SWARM_DIRECTIVE_FILE"; rm -f "$SWARM_DIRECTIVE_FILE"; sleep 30"#;

#[tokio::test]
async fn normal_directive_is_consumed_by_the_worker() {
    let h = harness(test_config(CONSUMER), Vec::new()).await;
    h.manager.launch(h.project_id, 1, 1).await.unwrap();

    let receipt = h
        .manager
        .send_directive(h.project_id, "W-1", "focus on the lexer", "normal")
        .await
        .unwrap();
    assert!(!receipt.restarted);

    let consumed = h.wait_for_event("directive_consumed").await;
    assert_eq!(consumed.agent_name, "W-1");
    let pending = h.manager.get_directive(h.project_id, "W-1").await.unwrap();
    assert!(!pending.pending);
    assert_eq!(h.events("directive_queued").await.len(), 1);

    let found = h
        .manager
        .search_output(h.project_id, "lexer", Some("W-1"), 0, 5)
        .await
        .unwrap();
    assert!(!found.matches.is_empty());

    h.manager.stop(h.project_id).await.unwrap();
}

#[tokio::test]
async fn pending_directive_is_observable_without_a_run() {
    let h = harness(test_config("true"), Vec::new()).await;
    let receipt = h
        .manager
        .send_directive(h.project_id, "W-3", "rebase first", "NORMAL")
        .await
        .unwrap();
    assert_eq!(receipt.agent, "W-3");
    assert!(!receipt.restarted);

    let pending = h.manager.get_directive(h.project_id, "W-3").await.unwrap();
    assert!(pending.pending);
    assert_eq!(pending.text.as_deref(), Some("rebase first"));
    assert!(pending.queued_at.is_some());

    let err = h
        .manager
        .send_directive(h.project_id, "W-3", "x", "whenever")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn urgent_directive_restarts_the_agent() {
    let h = harness(test_config("echo booted; sleep 30"), Vec::new()).await;
    let launch = h.manager.launch(h.project_id, 2, 1).await.unwrap();
    h.wait_for_event("agent_started").await;
    let before = h.manager.get_status(h.project_id).await.unwrap();
    let old_pid = before.agents[0].pid;

    let receipt = h
        .manager
        .send_directive(h.project_id, "W-1", "stop and rerun the tests", "urgent")
        .await
        .unwrap();
    assert!(receipt.restarted);

    let restarted = h.wait_for_event("agent_restarted").await;
    assert_eq!(restarted.agent_name, "W-1");
    assert!(restarted.detail.contains("reason=directive"));
    assert_eq!(restarted.run_id, Some(launch.run_id));

    let after = h.manager.get_status(h.project_id).await.unwrap();
    let w1 = &after.agents[0];
    assert!(w1.alive);
    assert_eq!(w1.restarts, 1);
    assert_ne!(w1.pid, old_pid);
    // The other agent is untouched and the run keeps going.
    assert_eq!(after.agents[1].restarts, 0);
    assert_eq!(after.status, "running");
    // The mailbox survives the restart for the fresh process to read.
    assert!(h.manager.get_directive(h.project_id, "W-1").await.unwrap().pending);

    h.manager.stop(h.project_id).await.unwrap();
}

#[tokio::test]
async fn directive_queued_before_launch_is_reported_consumed() {
    let h = harness(test_config(CONSUMER), Vec::new()).await;
    h.manager
        .send_directive(h.project_id, "W-1", "start from the failing test", "normal")
        .await
        .unwrap();
    let launch = h.manager.launch(h.project_id, 1, 1).await.unwrap();

    let consumed = h.wait_for_event("directive_consumed").await;
    assert_eq!(consumed.agent_name, "W-1");
    assert_eq!(consumed.run_id, Some(launch.run_id));
    assert!(!h.manager.get_directive(h.project_id, "W-1").await.unwrap().pending);
    assert_eq!(h.events("directive_consumed").await.len(), 1);

    h.manager.stop(h.project_id).await.unwrap();
}

#[tokio::test]
async fn urgent_directive_to_an_unlaunched_agent_stays_queued() {
    let h = harness(test_config("sleep 30"), Vec::new()).await;
    let launch = h.manager.launch(h.project_id, 1, 1).await.unwrap();
    assert_eq!(launch.launched, vec!["W-1"]);

    let receipt = h
        .manager
        .send_directive(h.project_id, "W-5", "take over the docs", "urgent")
        .await
        .unwrap();
    assert!(!receipt.restarted);

    let status = h.manager.get_status(h.project_id).await.unwrap();
    let names: Vec<&str> = status.agents.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["W-1"]);
    assert!(h.events("agent_restarted").await.is_empty());
    assert!(h.manager.get_directive(h.project_id, "W-5").await.unwrap().pending);

    h.manager.stop(h.project_id).await.unwrap();
}

#[tokio::test]
async fn stdin_input_reaches_live_agents() {
    let h = harness(test_config(r#"read line; echo "got:$line"; sleep 30"#), Vec::new()).await;
    h.manager.launch(h.project_id, 2, 1).await.unwrap();

    let delivered = h
        .manager
        .send_input(h.project_id, "ping", Some("W-2"))
        .await
        .unwrap();
    assert_eq!(delivered, vec!["W-2"]);

    for _ in 0..100 {
        let page = h
            .manager
            .get_output(h.project_id, Some("W-2"), 0, None)
            .await
            .unwrap();
        if page.lines.iter().any(|l| l == "got:ping") {
            h.manager.stop(h.project_id).await.unwrap();
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("W-2 never echoed its input");
}
