use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use popolo_sources_core::{is_source_url, Source};
use popolo_sources_sync::{LedgerDb, LinkLedger, SourceStore, SourceUpdater, SyncConfig};
use sqlx::SqliteConnection;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str =
    "popolo_sources_cli=info,popolo_sources_sync=info,popolo_sources_import=info,popolo_sources_storage=info";

#[derive(Debug, Parser)]
#[command(name = "popolo-sources")]
#[command(about = "Synchronise local Popolo data with remote Popolo JSON sources")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Update from a source of Popolo JSON
    Update {
        #[arg(value_name = "POPOLO-JSON-URL | POPOLO-SOURCE-ID")]
        source: String,
        /// Create a new source for an unseen URL
        #[arg(long)]
        create: bool,
    },
    /// List known sources
    List,
    /// Show the ledger links recorded for a source
    Links { source_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceArg {
    Id(i64),
    Url(String),
}

fn parse_source_arg(arg: &str) -> Result<SourceArg> {
    if !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()) {
        let id = arg.parse().with_context(|| format!("Malformed argument: {arg}"))?;
        return Ok(SourceArg::Id(id));
    }
    if is_source_url(arg) {
        return Ok(SourceArg::Url(arg.to_string()));
    }
    bail!("Malformed argument: {arg}")
}

/// Resolve the operator's argument to a source, creating it when asked.
async fn select_source(
    conn: &mut SqliteConnection,
    arg: &str,
    create: bool,
    out: &mut dyn Write,
) -> Result<Source> {
    let existing = match parse_source_arg(arg)? {
        SourceArg::Id(id) => SourceStore::get(&mut *conn, id).await?,
        SourceArg::Url(url) => SourceStore::find_by_url(&mut *conn, &url).await?,
    };

    match (existing, create) {
        (Some(_), true) => bail!("You specified --create, but that source already exists"),
        (Some(source), false) => Ok(source),
        (None, true) => {
            if !is_source_url(arg) {
                bail!("If you specify --create, the argument must be a URL");
            }
            let source = SourceStore::create(&mut *conn, arg).await?;
            writeln!(out, "Created a source for that URL: {}", source.id)?;
            Ok(source)
        }
        (None, false) => {
            writeln!(out, "That source could not be found.")?;
            let known = SourceStore::list(&mut *conn).await?;
            if !known.is_empty() {
                writeln!(out, "Did you mean one of the following?")?;
                for source in known {
                    writeln!(out, "{}: {}", source.id, source.url)?;
                }
            }
            bail!("Source not found")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let db = LedgerDb::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    match cli.command {
        Commands::Update { source, create } => {
            let source = {
                let mut conn = db.acquire().await?;
                select_source(&mut conn, &source, create, &mut std::io::stdout()).await?
            };
            println!("Attempting to import from {source}");

            let fetcher = Arc::new(config.http_fetcher()?);
            let mut updater = SourceUpdater::new(db, source, fetcher)
                .with_id_prefix(config.id_prefix.clone())
                .with_archive(config.archive());
            let summary = updater
                .update_from_source()
                .await
                .context("updating from source")?;
            println!(
                "update complete: run_id={} processed={} created={} undeleted={} disappeared={}",
                summary.run_id, summary.processed, summary.created, summary.undeleted, summary.disappeared
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing update summary")?
            );
        }
        Commands::List => {
            let mut conn = db.acquire().await?;
            for source in SourceStore::list(&mut conn).await? {
                println!("{}: {}", source.id, source.url);
            }
        }
        Commands::Links { source_id } => {
            let mut conn = db.acquire().await?;
            if SourceStore::get(&mut conn, source_id).await?.is_none() {
                bail!("Source not found");
            }
            for link in LinkLedger::links_for_source(&mut conn, source_id).await? {
                let state = if link.deleted_from_source { "deleted" } else { "live" };
                println!("{}\t{}\t{state}", link.id, link.entity);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db_with_sources(urls: &[&str]) -> (LedgerDb, Vec<Source>) {
        let db = LedgerDb::in_memory().await.expect("db");
        let mut sources = Vec::new();
        {
            let mut conn = db.acquire().await.expect("conn");
            for url in urls {
                sources.push(SourceStore::create(&mut conn, url).await.expect("source"));
            }
        }
        (db, sources)
    }

    async fn run(db: &LedgerDb, arg: &str, create: bool) -> (Result<Source>, String) {
        let mut conn = db.acquire().await.expect("conn");
        let mut out = Vec::new();
        let result = select_source(&mut conn, arg, create, &mut out).await;
        (result, String::from_utf8(out).expect("utf8"))
    }

    #[test]
    fn source_args_are_ids_or_urls() {
        assert_eq!(parse_source_arg("12").expect("id"), SourceArg::Id(12));
        assert_eq!(
            parse_source_arg("https://example.com/a.json").expect("url"),
            SourceArg::Url("https://example.com/a.json".into())
        );
        let err = parse_source_arg("http://[::1").unwrap_err();
        assert!(err.to_string().starts_with("Malformed argument"));
    }

    #[tokio::test]
    async fn selects_existing_source_by_url_or_id() {
        let (db, sources) = db_with_sources(&["http://example.com/foo.json"]).await;

        let (by_url, _) = run(&db, "http://example.com/foo.json", false).await;
        assert_eq!(by_url.expect("by url"), sources[0]);
        let (by_id, _) = run(&db, &sources[0].id.to_string(), false).await;
        assert_eq!(by_id.expect("by id"), sources[0]);
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let (db, _) = db_with_sources(&[]).await;

        for arg in ["1", "http://example.com/asdpofiaj"] {
            let (result, out) = run(&db, arg, false).await;
            assert_eq!(result.unwrap_err().to_string(), "Source not found");
            assert_eq!(out.trim(), "That source could not be found.");
        }
    }

    #[tokio::test]
    async fn malformed_argument_is_rejected() {
        let (db, _) = db_with_sources(&[]).await;
        let (result, _) = run(&db, "http://[::1", false).await;
        assert!(result.unwrap_err().to_string().starts_with("Malformed argument"));
    }

    #[tokio::test]
    async fn create_rejects_existing_sources_and_non_urls() {
        let (db, _) = db_with_sources(&["http://example.com/foo.json"]).await;

        let (result, _) = run(&db, "http://example.com/foo.json", true).await;
        assert_eq!(
            result.unwrap_err().to_string(),
            "You specified --create, but that source already exists"
        );
        let (result, _) = run(&db, "7", true).await;
        assert_eq!(
            result.unwrap_err().to_string(),
            "If you specify --create, the argument must be a URL"
        );
    }

    #[tokio::test]
    async fn create_adds_a_new_source() {
        let (db, _) = db_with_sources(&[]).await;

        let (result, out) = run(&db, "http://example.com/foo.json", true).await;
        let source = result.expect("created");
        assert_eq!(source.url, "http://example.com/foo.json");
        assert_eq!(out.trim(), format!("Created a source for that URL: {}", source.id));

        let mut conn = db.acquire().await.expect("conn");
        assert_eq!(SourceStore::list(&mut conn).await.expect("list"), vec![source]);
    }

    #[tokio::test]
    async fn other_sources_are_suggested() {
        let (db, sources) =
            db_with_sources(&["http://example.com/foo.json", "http://example.com/bar.json"]).await;

        let (result, out) = run(&db, "http://foo", false).await;
        assert_eq!(result.unwrap_err().to_string(), "Source not found");
        assert_eq!(
            out.trim().lines().collect::<Vec<_>>(),
            vec![
                "That source could not be found.".to_string(),
                "Did you mean one of the following?".to_string(),
                format!("{}: {}", sources[0].id, sources[0].url),
                format!("{}: {}", sources[1].id, sources[1].url),
            ]
        );
    }
}
