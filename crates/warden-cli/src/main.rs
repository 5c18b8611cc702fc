//! warden: query and administer policies held by wardend.

use std::path::PathBuf;
use std::process;

use clap::{ArgGroup, Parser};

use warden::PolicyValue;
use warden::service::{DEFAULT_SOCKET, PolicyClient};
use warden_cli::{ChangeEvent, CliError, columns, execute, query};

/// Query and administer warden policies.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["query", "enroll", "disenroll", "activate", "deactivate", "admins", "watch"])
))]
struct Cli {
    /// Daemon socket.
    #[arg(long, env = "WARDEN_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Statement to run, e.g. "SELECT * FROM policy".
    #[arg(long)]
    query: Option<String>,

    /// Administrator voting with an UPDATE.
    #[arg(long, env = "WARDEN_ADMIN")]
    admin: Option<String>,

    /// Enroll an administrator.
    #[arg(long, value_name = "ADMIN")]
    enroll: Option<String>,

    /// Disenroll an administrator, dropping all their votes.
    #[arg(long, value_name = "ADMIN")]
    disenroll: Option<String>,

    /// Let an enrolled administrator's votes count again.
    #[arg(long, value_name = "ADMIN")]
    activate: Option<String>,

    /// Keep an administrator enrolled but ignore their votes.
    #[arg(long, value_name = "ADMIN")]
    deactivate: Option<String>,

    /// List enrolled administrators.
    #[arg(long)]
    admins: bool,

    /// Print policy changes as they happen.
    #[arg(long)]
    watch: bool,

    /// Print JSON instead of `name|value` rows.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    warden::logging::init_tracing("warn");
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    // Parse before connecting so usage errors never need the daemon.
    let statement = cli.query.as_deref().map(query::parse).transpose()?;
    let client = PolicyClient::connect(&cli.socket).await?;

    if let Some(statement) = statement {
        let rows = execute(&client, &statement, cli.admin.as_deref()).await?;
        let columns = columns(&statement);
        for row in rows {
            if cli.json {
                println!("{}", row.to_json(columns));
            } else {
                println!("{}", row.format(columns));
            }
        }
    } else if let Some(admin) = cli.enroll {
        if !client.enroll(&admin).await? {
            eprintln!("{admin} is already enrolled");
        }
    } else if let Some(admin) = cli.disenroll {
        if !client.disenroll(&admin).await? {
            eprintln!("{admin} is not enrolled");
        }
    } else if let Some(admin) = cli.activate {
        client.activate(&admin).await?;
    } else if let Some(admin) = cli.deactivate {
        client.deactivate(&admin).await?;
    } else if cli.admins {
        for admin in client.admins().await? {
            let state = if admin.activated { "active" } else { "inactive" };
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "name": admin.name, "activated": admin.activated })
                );
            } else {
                println!("{}|{state}", admin.name);
            }
        }
    } else if cli.watch {
        let mut changes = client.subscribe_changes().await?;
        while let Some((policy, value)) = changes.recv::<(String, PolicyValue)>().await? {
            if cli.json {
                let event = ChangeEvent {
                    policy: &policy,
                    value: &value,
                };
                println!("{}", serde_json::json!(event));
            } else {
                println!("{policy}|{value}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_action_required() {
        assert!(Cli::try_parse_from(["warden"]).is_err());
        assert!(
            Cli::try_parse_from(["warden", "--watch", "--enroll", "alice"]).is_err()
        );
        let cli = Cli::try_parse_from([
            "warden",
            "--query",
            "SELECT * FROM policy",
            "--admin",
            "alice",
        ])
        .unwrap();
        assert_eq!(cli.query.as_deref(), Some("SELECT * FROM policy"));
        assert_eq!(cli.admin.as_deref(), Some("alice"));
    }
}
