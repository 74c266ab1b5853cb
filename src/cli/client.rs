use anyhow::{Result, anyhow};
use console::style;
use serde_json::Value;

use crate::core::terminal::{print_info, print_status, print_success, print_table, print_warn};

/// Thin HTTP client for a running daemon.
pub struct DaemonClient {
    base: String,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn new(api_url: &str) -> Self {
        Self {
            base: api_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn read(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| anyhow!("daemon returned an unreadable response ({status}): {e}"))?;
        if body.get("success").and_then(|v| v.as_bool()) == Some(true) {
            Ok(body)
        } else {
            let msg = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            Err(anyhow!("{msg} ({status})"))
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let resp = req.send().await.map_err(|e| {
            anyhow!(
                "could not reach swarmd at {} ({e}). Is 'swarmd serve' running?",
                self.base
            )
        })?;
        Self::read(resp).await
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.http.get(self.url(path))).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.send(self.http.post(self.url(path)).json(&body)).await
    }
}

fn str_of<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(|v| v.as_str()).unwrap_or("-")
}

fn num_of(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::Number(n)) => n.to_string(),
        _ => "-".to_string(),
    }
}

pub async fn project_add(client: &DaemonClient, name: &str, folder: &str) -> Result<()> {
    let folder = std::fs::canonicalize(folder)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| folder.to_string());
    let body = client
        .post(
            "/api/projects",
            serde_json::json!({ "name": name, "folder": folder }),
        )
        .await?;
    let project = &body["project"];
    print_success(&format!(
        "Registered project '{}' with id {}",
        str_of(project, "name"),
        num_of(project, "id")
    ));
    Ok(())
}

pub async fn project_list(client: &DaemonClient) -> Result<()> {
    let body = client.get("/api/projects").await?;
    let projects = body["projects"].as_array().cloned().unwrap_or_default();
    if projects.is_empty() {
        print_info("No projects registered. Use 'swarmd project add <name> <folder>'.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = projects
        .iter()
        .map(|p| {
            vec![
                num_of(p, "id"),
                str_of(p, "name").to_string(),
                str_of(p, "folder").to_string(),
                p["guardrails"].as_array().map(|g| g.len()).unwrap_or(0).to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "FOLDER", "GUARDRAILS"], &rows);
    Ok(())
}

pub async fn launch(client: &DaemonClient, project: i64, agents: usize, phases: usize) -> Result<()> {
    let body = client
        .post(
            &format!("/api/projects/{project}/swarm/launch"),
            serde_json::json!({ "agent_count": agents, "max_phases": phases }),
        )
        .await?;
    let launched = body["launched"].as_array().map(|a| a.len()).unwrap_or(0);
    print_success(&format!(
        "Run {} started with {} agent(s)",
        num_of(&body, "run_id"),
        launched
    ));
    for failure in body["failed"].as_array().cloned().unwrap_or_default() {
        print_warn(&format!(
            "{} failed to start: {}",
            str_of(&failure, "agent"),
            str_of(&failure, "error")
        ));
    }
    Ok(())
}

pub async fn stop(client: &DaemonClient, project: i64) -> Result<()> {
    let body = client
        .post(
            &format!("/api/projects/{project}/swarm/stop"),
            serde_json::json!({}),
        )
        .await?;
    if body["stopped"].as_bool() == Some(true) {
        print_success("Swarm stopped.");
    } else {
        print_info("No swarm was running; tracking cleared.");
    }
    Ok(())
}

pub async fn status(client: &DaemonClient, project: i64) -> Result<()> {
    let body = client
        .get(&format!("/api/projects/{project}/swarm/status"))
        .await?;
    let swarm = &body["swarm"];
    print_status("Status", str_of(swarm, "status"));
    print_status("Run", &num_of(swarm, "run_id"));
    print_status(
        "Phase",
        &format!("{}/{}", num_of(swarm, "phase"), num_of(swarm, "max_phases")),
    );
    let tasks = &swarm["tasks"];
    print_status(
        "Tasks",
        &format!(
            "{}/{} ({}%)",
            num_of(tasks, "done"),
            num_of(tasks, "total"),
            num_of(tasks, "percent")
        ),
    );
    if let Some(signals) = swarm["signals"].as_array()
        && !signals.is_empty()
    {
        let names: Vec<&str> = signals.iter().filter_map(|s| s.as_str()).collect();
        print_status("Signals", &names.join(", "));
    }
    println!();

    let rows: Vec<Vec<String>> = swarm["agents"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|a| {
            let state = if a["alive"].as_bool() == Some(true) {
                style("alive").green().to_string()
            } else {
                style("exited").dim().to_string()
            };
            let attention = if a["needs_attention"].as_bool() == Some(true) {
                style("!").yellow().bold().to_string()
            } else {
                String::new()
            };
            vec![
                str_of(a, "name").to_string(),
                state,
                num_of(a, "pid"),
                num_of(a, "exit_code"),
                num_of(a, "restarts"),
                num_of(a, "output_lines"),
                str_of(a, "breaker").to_string(),
                attention,
            ]
        })
        .collect();
    if rows.is_empty() {
        print_info("No agents tracked for this project.");
    } else {
        print_table(
            &["AGENT", "STATE", "PID", "EXIT", "RESTARTS", "LINES", "BREAKER", ""],
            &rows,
        );
    }
    Ok(())
}

pub async fn output(
    client: &DaemonClient,
    project: i64,
    agent: Option<&str>,
    offset: usize,
    limit: usize,
) -> Result<()> {
    let mut path = format!("/api/projects/{project}/swarm/output?offset={offset}&limit={limit}");
    if let Some(agent) = agent {
        path.push_str(&format!("&agent={agent}"));
    }
    let body = client.get(&path).await?;
    for line in body["lines"].as_array().cloned().unwrap_or_default() {
        println!("{}", line.as_str().unwrap_or_default());
    }
    if body["has_more"].as_bool() == Some(true) {
        print_info(&format!(
            "More output available: --offset {}",
            num_of(&body, "next_offset")
        ));
    }
    Ok(())
}

pub async fn directive(
    client: &DaemonClient,
    project: i64,
    agent: &str,
    text: &str,
    urgent: bool,
) -> Result<()> {
    let priority = if urgent { "urgent" } else { "normal" };
    let body = client
        .post(
            &format!("/api/projects/{project}/swarm/directives/{agent}"),
            serde_json::json!({ "text": text, "priority": priority }),
        )
        .await?;
    if body["directive"]["restarted"].as_bool() == Some(true) {
        print_success(&format!("Directive delivered; {agent} restarted to pick it up."));
    } else {
        print_success(&format!("Directive queued for {agent}."));
    }
    Ok(())
}

pub async fn events(client: &DaemonClient, project: i64, limit: usize) -> Result<()> {
    let body = client
        .get(&format!("/api/projects/{project}/events?limit={limit}"))
        .await?;
    let mut events = body["events"].as_array().cloned().unwrap_or_default();
    // Oldest first reads naturally in a terminal.
    events.reverse();
    let rows: Vec<Vec<String>> = events
        .iter()
        .map(|e| {
            vec![
                str_of(e, "timestamp").to_string(),
                str_of(e, "agent_name").to_string(),
                str_of(e, "event_type").to_string(),
                str_of(e, "detail").to_string(),
            ]
        })
        .collect();
    print_table(&["TIME", "AGENT", "EVENT", "DETAIL"], &rows);
    print_info(&format!(
        "Showing {} of {} event(s).",
        rows.len(),
        num_of(&body, "total")
    ));
    Ok(())
}

pub async fn history(client: &DaemonClient, project: i64) -> Result<()> {
    let body = client
        .get(&format!("/api/projects/{project}/runs"))
        .await?;
    let rows: Vec<Vec<String>> = body["runs"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|r| {
            let passed = r["guardrail_results"]
                .as_array()
                .map(|g| {
                    let ok = g.iter().filter(|x| x["passed"].as_bool() == Some(true)).count();
                    format!("{}/{}", ok, g.len())
                })
                .unwrap_or_default();
            vec![
                num_of(r, "id"),
                str_of(r, "status").to_string(),
                str_of(r, "started_at").to_string(),
                r["ended_at"].as_str().unwrap_or("-").to_string(),
                num_of(r, "agent_count"),
                passed,
            ]
        })
        .collect();
    if rows.is_empty() {
        print_info("No runs yet.");
    } else {
        print_table(
            &["RUN", "STATUS", "STARTED", "ENDED", "AGENTS", "GUARDRAILS"],
            &rows,
        );
    }
    Ok(())
}
