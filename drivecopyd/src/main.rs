use std::sync::Arc;

use anyhow::Context;
use drivecopy_core::{DirectoryClient, DriveClient, RobustHttp};
use drivecopyd::job::{JobConfig, JobRunner, RunOutcome};
use drivecopyd::sync::progress::NoopProgress;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const USER_SEARCH_LIMIT: u32 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Clear,
    Sites(String),
    Libraries(String),
    UserDrive(String),
    Folders {
        drive: String,
        parent: Option<String>,
    },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Run);
    };
    let mut operand = |what: &str| {
        args.next()
            .with_context(|| format!("`{command}` expects {what}"))
    };
    let mode = match command.as_str() {
        "run" => CliMode::Run,
        "clear" => CliMode::Clear,
        "sites" => CliMode::Sites(operand("a search query")?),
        "libraries" => CliMode::Libraries(operand("a site id")?),
        "user-drive" => CliMode::UserDrive(operand("a user principal name")?),
        "folders" => {
            let drive = operand("a drive id")?;
            CliMode::Folders {
                drive,
                parent: args.next(),
            }
        }
        "help" | "--help" | "-h" => CliMode::Help,
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn print_usage() {
    println!(
        "Usage: drivecopy [run|clear|sites <query>|libraries <site-id>|user-drive <upn>|folders <drive-id> [parent-id]|help]"
    );
    println!("  run                 Mirror the configured source folder (default)");
    println!("  clear               Remove the saved checkpoint of the configured job");
    println!("  sites <query>       Search sites, or resolve one by https:// URL");
    println!("  libraries <site-id> List the document libraries of a site");
    println!("  user-drive <upn>    Show the personal drive of a user");
    println!("  folders <drive-id> [parent-id]");
    println!("                      Show the drive root id and the folders under a parent");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DRIVECOPY_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            print_usage();
            Ok(())
        }
        CliMode::Clear => {
            let config = JobConfig::from_env()?;
            config
                .checkpoint_store()
                .clear(&config.signature())
                .await?;
            tracing::info!("checkpoint removed");
            Ok(())
        }
        CliMode::Run => run_job().await,
        lookup => run_lookup(lookup).await,
    }
}

async fn run_job() -> anyhow::Result<()> {
    let config = JobConfig::from_env()?;
    let credentials = config.token_provider()?;
    let cancel = CancellationToken::new();

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight transfers");
            on_interrupt.cancel();
        }
    });

    let runner = JobRunner::new(config, credentials, Arc::new(NoopProgress), cancel);
    let report = runner.run().await?;
    let stats = &report.stats;
    tracing::info!(
        files_done = stats.files_done,
        files_failed = stats.files_failed,
        bytes_done = stats.bytes_done,
        elapsed_secs = stats.elapsed.as_secs(),
        "run finished"
    );
    match report.outcome {
        RunOutcome::Completed(summary) if !summary.is_clean() => {
            anyhow::bail!(
                "audit found {} missing and {} mismatched files",
                summary.missing,
                summary.mismatched
            )
        }
        RunOutcome::Completed(_) => Ok(()),
        RunOutcome::Cancelled(phase) => {
            tracing::warn!(phase = phase.as_str(), "job cancelled; run again to resume");
            Ok(())
        }
    }
}

async fn run_lookup(mode: CliMode) -> anyhow::Result<()> {
    let config = JobConfig::from_env()?;
    let http = RobustHttp::new(config.token_provider()?)?;
    let drive_client = DriveClient::with_base_url(&config.graph_url, http)?;
    let directory = DirectoryClient::new(drive_client.clone());

    match mode {
        CliMode::Sites(query) if query.starts_with("https://") => {
            let site = directory.resolve_site_by_url(&query).await?;
            println!("{}\t{}", site.id, site.label());
        }
        CliMode::Sites(query) => {
            for site in directory.search_sites(&query).await? {
                println!("{}\t{}", site.id, site.label());
            }
        }
        CliMode::Libraries(site) => {
            for drive in directory.list_site_libraries(&site).await? {
                println!("{}\t{}", drive.id, drive.name.as_deref().unwrap_or("-"));
            }
        }
        CliMode::UserDrive(user) => {
            let hits = directory.search_users(&user, USER_SEARCH_LIMIT).await?;
            let upn = hits
                .iter()
                .find_map(|hit| hit.user_principal_name.clone())
                .unwrap_or(user);
            match directory.resolve_user_drive(&upn).await? {
                Some(drive) => println!("{}\t{upn}", drive.id),
                None => println!("{upn} has no personal drive"),
            }
        }
        CliMode::Folders { drive, parent } => {
            let root = drive_client.get_drive_root_id(&drive).await?;
            println!("root\t{root}");
            let parent = parent.unwrap_or(root);
            for (name, id) in drive_client.list_folders(&drive, &parent).await? {
                println!("{id}\t{name}");
            }
        }
        CliMode::Run | CliMode::Clear | CliMode::Help => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("drivecopy")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
        assert_eq!(parse_cli_mode(args(&["run"])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_lookups() {
        assert_eq!(
            parse_cli_mode(args(&["sites", "finance"])).unwrap(),
            CliMode::Sites("finance".into())
        );
        assert_eq!(
            parse_cli_mode(args(&["libraries", "site-1"])).unwrap(),
            CliMode::Libraries("site-1".into())
        );
        assert_eq!(
            parse_cli_mode(args(&["user-drive", "ada@contoso.example"])).unwrap(),
            CliMode::UserDrive("ada@contoso.example".into())
        );
    }

    #[test]
    fn parse_cli_mode_supports_folder_listing() {
        assert_eq!(
            parse_cli_mode(args(&["folders", "drive-1"])).unwrap(),
            CliMode::Folders {
                drive: "drive-1".into(),
                parent: None,
            }
        );
        assert_eq!(
            parse_cli_mode(args(&["folders", "drive-1", "item-9"])).unwrap(),
            CliMode::Folders {
                drive: "drive-1".into(),
                parent: Some("item-9".into()),
            }
        );
        assert!(parse_cli_mode(args(&["folders"])).is_err());
        assert!(parse_cli_mode(args(&["folders", "drive-1", "item-9", "x"])).is_err());
    }

    #[test]
    fn parse_cli_mode_supports_clear_and_help() {
        assert_eq!(parse_cli_mode(args(&["clear"])).unwrap(), CliMode::Clear);
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_bad_input() {
        assert!(parse_cli_mode(args(&["sites"])).is_err());
        assert!(parse_cli_mode(args(&["clear", "now"])).is_err());
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
