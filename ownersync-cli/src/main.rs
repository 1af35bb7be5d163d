use anyhow::Result;
use clap::Parser;
use ownersync_core::{mappings, sync, Config, SentryClient};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ownersync: push team, user and CODEOWNERS ownership data into Sentry
#[derive(Parser, Debug)]
#[command(name = "ownersync")]
#[command(about = "Sync ownership data from local mapping files into Sentry", long_about = None)]
struct Cli {
    /// Path to the team mapping file (team slug -> external team names)
    #[arg(long, default_value = "team_map.json")]
    team_map: PathBuf,

    /// Path to the user mapping file (email -> external usernames)
    #[arg(long, default_value = "user_map.json")]
    user_map: PathBuf,

    /// Path to the CODEOWNERS file to upload
    #[arg(long, default_value = ".github/CODEOWNERS")]
    codeowners: PathBuf,

    /// If set, do not make any changes, just print what would be done
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let team_map = mappings::load_team_map(&cli.team_map)?;
    let user_map = mappings::load_user_map(&cli.user_map)?;
    let codeowners = mappings::read_codeowners(&cli.codeowners)?;

    info!(
        "Loaded {} team(s) and {} user(s); CODEOWNERS at {} ({} bytes)",
        team_map.len(),
        user_map.len(),
        cli.codeowners.display(),
        codeowners.len()
    );
    info!(
        "Syncing ownership for organization {} project {}{}",
        config.organization_slug,
        config.project_slug,
        if cli.dry_run { " (dry run)" } else { "" }
    );

    let client = SentryClient::new(&config)?;
    let report = sync::run(
        &client,
        config.provider,
        &team_map,
        &user_map,
        &codeowners,
        cli.dry_run,
    )
    .await?;

    let codeowners_outcome = if report.codeowners_uploaded {
        "uploaded"
    } else if cli.dry_run {
        "validated"
    } else {
        "already present"
    };
    info!(
        "Sync complete: {} team link(s) created ({} already present), {} user link(s) created ({} already present), CODEOWNERS {}",
        report.team_links_created,
        report.team_links_existing,
        report.user_links_created,
        report.user_links_existing,
        codeowners_outcome
    );

    Ok(())
}
