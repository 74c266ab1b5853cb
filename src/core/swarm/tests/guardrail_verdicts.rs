use super::{harness, test_config};
use crate::core::swarm::guardrails::{GuardrailAction, GuardrailRule, RuleType};

fn must_finish() -> GuardrailRule {
    GuardrailRule {
        rule_type: RuleType::RegexMatch,
        pattern: Some("DONE".to_string()),
        threshold: None,
        action: GuardrailAction::Halt,
    }
}

#[tokio::test]
async fn missing_done_marker_fails_the_run() {
    let h = harness(test_config("echo still working"), vec![must_finish()]).await;
    h.manager.launch(h.project_id, 2, 1).await.unwrap();

    let run = h.wait_for_finish().await;
    assert_eq!(run.status, "failed_guardrail");
    assert_eq!(run.guardrail_results.len(), 1);
    assert!(!run.guardrail_results[0].passed);
    assert!(run.guardrail_results[0].detail.contains("not found"));

    let failed = h.events("guardrail_failed").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].agent_name, "swarm");
}

#[tokio::test]
async fn done_marker_completes_the_run() {
    let h = harness(test_config("echo working; echo DONE"), vec![must_finish()]).await;
    h.manager.launch(h.project_id, 1, 1).await.unwrap();

    let run = h.wait_for_finish().await;
    assert_eq!(run.status, "completed");
    assert!(run.guardrail_results[0].passed);
    assert_eq!(run.summary.unwrap()["reason"], "all_exited");
}

#[tokio::test]
async fn failed_warn_rules_are_recorded_without_changing_status() {
    let rules = vec![
        GuardrailRule {
            rule_type: RuleType::MaxErrors,
            pattern: None,
            threshold: Some(0),
            action: GuardrailAction::Warn,
        },
        GuardrailRule {
            rule_type: RuleType::MinLines,
            pattern: None,
            threshold: Some(1),
            action: GuardrailAction::Halt,
        },
    ];
    let h = harness(test_config("echo 'error: flaky test'"), rules).await;
    h.manager.launch(h.project_id, 1, 1).await.unwrap();

    let run = h.wait_for_finish().await;
    assert_eq!(run.status, "completed");
    assert!(!run.guardrail_results[0].passed);
    assert!(run.guardrail_results[1].passed);
}

#[tokio::test]
async fn crashed_agents_still_get_a_verdict() {
    let h = harness(test_config("echo partial; exit 3"), vec![must_finish()]).await;
    h.manager.launch(h.project_id, 1, 1).await.unwrap();

    let run = h.wait_for_finish().await;
    assert_eq!(run.status, "failed_guardrail");
    let summary = run.summary.unwrap();
    assert_eq!(summary["agents"][0]["exit_code"], 3);
    assert_eq!(summary["total_output_lines"], 1);
}
