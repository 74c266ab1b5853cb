mod client;
mod daemon;

use anyhow::{Result, anyhow};
use console::style;

use crate::core::config::SwarmConfig;
use crate::core::terminal::{self, print_error, print_step};
use crate::platform::{NativePlatform, Platform};
use client::DaemonClient;

fn print_help() {
    terminal::print_banner();

    print_step("Daemon");
    print_command("serve [--api-host H] [--api-port P]", "Run the supervisor daemon in the foreground");

    print_step("Projects");
    print_command("project add <name> <folder>", "Register a project folder");
    print_command("project list", "List registered projects");

    print_step("Swarms");
    print_command("launch <project> [--agents N] [--phases N]", "Start a swarm run");
    print_command("stop <project>", "Stop the running swarm");
    print_command("status <project>", "Show agents, tasks and signals");
    print_command("output <project> [--agent W-n] [--offset N] [--limit N]", "Print buffered agent output");
    print_command("directive <project> <agent> <text> [--urgent]", "Send a directive to an agent");

    print_step("History");
    print_command("events <project> [--limit N]", "Show recent lifecycle events");
    print_command("history <project>", "Show past runs and guardrail verdicts");

    println!(
        "\n {} {} <command> [arguments] [--api-url URL]\n",
        style("Usage:").bold(),
        style("swarmd").green()
    );
}

fn print_command(usage: &str, description: &str) {
    println!("   {:<58} {}", style(usage).cyan(), style(description).dim());
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(17900);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

/// Flags and positional arguments shared by the client commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ClientArgs {
    pub positional: Vec<String>,
    pub api_url: Option<String>,
    pub agents: Option<usize>,
    pub phases: Option<usize>,
    pub agent: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub urgent: bool,
}

pub(crate) fn parse_client_args(args: &[String], start: usize) -> ClientArgs {
    let mut parsed = ClientArgs::default();
    let mut i = start;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--api-url", Some(v)) => {
                parsed.api_url = Some(v.clone());
                i += 2;
            }
            ("--agents" | "-n", Some(v)) => {
                parsed.agents = v.parse().ok();
                i += 2;
            }
            ("--phases", Some(v)) => {
                parsed.phases = v.parse().ok();
                i += 2;
            }
            ("--agent" | "-a", Some(v)) => {
                parsed.agent = Some(v.clone());
                i += 2;
            }
            ("--offset", Some(v)) => {
                parsed.offset = v.parse().ok();
                i += 2;
            }
            ("--limit", Some(v)) => {
                parsed.limit = v.parse().ok();
                i += 2;
            }
            ("--urgent", _) => {
                parsed.urgent = true;
                i += 1;
            }
            (flag, _) if flag.starts_with("--") => i += 1,
            (other, _) => {
                parsed.positional.push(other.to_string());
                i += 1;
            }
        }
    }
    parsed
}

fn project_arg(parsed: &ClientArgs) -> Result<i64> {
    let raw = parsed
        .positional
        .first()
        .ok_or_else(|| anyhow!("missing <project> id"))?;
    raw.parse()
        .map_err(|_| anyhow!("project id must be a number, got '{raw}'"))
}

async fn default_api_url() -> String {
    let config = SwarmConfig::load(&NativePlatform::data_dir())
        .await
        .unwrap_or_default();
    format!(
        "http://{}:{}",
        config.server.api_host, config.server.api_port
    )
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    match cmd {
        "serve" => return daemon::serve(&args).await,
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    let parsed = parse_client_args(&args, 2);
    let api_url = match parsed.api_url.clone() {
        Some(url) => url,
        None => default_api_url().await,
    };
    let client = DaemonClient::new(&api_url);

    match cmd {
        "project" => match parsed.positional.first().map(String::as_str) {
            Some("add") => {
                let (Some(name), Some(folder)) = (parsed.positional.get(1), parsed.positional.get(2))
                else {
                    return Err(anyhow!("usage: swarmd project add <name> <folder>"));
                };
                client::project_add(&client, name, folder).await
            }
            Some("list") | None => client::project_list(&client).await,
            Some(other) => Err(anyhow!("unknown project subcommand '{other}'")),
        },
        "launch" => {
            let project = project_arg(&parsed)?;
            client::launch(
                &client,
                project,
                parsed.agents.unwrap_or(4),
                parsed.phases.unwrap_or(1),
            )
            .await
        }
        "stop" => client::stop(&client, project_arg(&parsed)?).await,
        "status" => client::status(&client, project_arg(&parsed)?).await,
        "output" => {
            let project = project_arg(&parsed)?;
            client::output(
                &client,
                project,
                parsed.agent.as_deref(),
                parsed.offset.unwrap_or(0),
                parsed.limit.unwrap_or(crate::core::swarm::DEFAULT_OUTPUT_LIMIT),
            )
            .await
        }
        "directive" => {
            let project = project_arg(&parsed)?;
            let (Some(agent), Some(text)) = (parsed.positional.get(1), parsed.positional.get(2))
            else {
                return Err(anyhow!(
                    "usage: swarmd directive <project> <agent> <text> [--urgent]"
                ));
            };
            client::directive(&client, project, agent, text, parsed.urgent).await
        }
        "events" => {
            let project = project_arg(&parsed)?;
            client::events(&client, project, parsed.limit.unwrap_or(50)).await
        }
        "history" => client::history(&client, project_arg(&parsed)?).await,
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientArgs, parse_api_server_flags, parse_client_args, project_arg};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_api_server_flags_reads_host_and_port() {
        let args = argv(&["swarmd", "serve", "--api-host", "0.0.0.0", "--api-port", "19000"]);
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 17900);
        assert_eq!(host, "0.0.0.0");
        assert_eq!(port, 19000);
    }

    #[test]
    fn parse_api_server_flags_falls_back_on_bad_port() {
        let args = argv(&["swarmd", "serve", "--api-port", "nope"]);
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 18000);
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 17900);
    }

    #[test]
    fn parse_client_args_reads_launch_flags() {
        let args = argv(&[
            "swarmd", "launch", "3", "--agents", "6", "--phases", "2", "--api-url",
            "http://127.0.0.1:19090",
        ]);
        let parsed = parse_client_args(&args, 2);
        assert_eq!(
            parsed,
            ClientArgs {
                positional: vec!["3".to_string()],
                api_url: Some("http://127.0.0.1:19090".to_string()),
                agents: Some(6),
                phases: Some(2),
                ..ClientArgs::default()
            }
        );
        assert_eq!(project_arg(&parsed).unwrap(), 3);
    }

    #[test]
    fn parse_client_args_keeps_directive_text_and_urgent() {
        let args = argv(&["swarmd", "directive", "1", "W-2", "focus on tests", "--urgent"]);
        let parsed = parse_client_args(&args, 2);
        assert_eq!(parsed.positional, vec!["1", "W-2", "focus on tests"]);
        assert!(parsed.urgent);
    }

    #[test]
    fn project_arg_rejects_non_numeric_ids() {
        let parsed = parse_client_args(&argv(&["swarmd", "status", "demo"]), 2);
        assert!(project_arg(&parsed).is_err());
        let empty = parse_client_args(&argv(&["swarmd", "status"]), 2);
        assert!(project_arg(&empty).is_err());
    }
}
