use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use revmachine::{
    config::Config,
    ingest::{ArticleHistory, ChainWriter},
    maintenance,
    sqlite::SqliteStore,
    Revision, RevisionApi,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "revmachine", about = "Query and store diff-encoded revision histories")]
struct CommandLine {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overrides `[database] path`
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show a revision, by id or by article and counter/timestamp
    Revision {
        #[arg(long, conflicts_with = "article")]
        id: Option<i64>,

        #[arg(long)]
        article: Option<i64>,

        /// 1-based chronological position within the article
        #[arg(long, conflicts_with = "at")]
        counter: Option<i64>,

        /// RFC 3339 timestamp, e.g. 2006-01-02T15:04:05Z
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Print the reconstructed text
        #[arg(long)]
        text: bool,
    },

    /// Summarize an article's history
    Article { article_id: i64 },

    /// Store an article history read from a TOML file
    Import { file: PathBuf },

    /// Create and fill the revision count column
    Maintain,

    /// List articles by number of revisions
    Filter {
        #[arg(long, default_value_t = 1)]
        min: i64,

        #[arg(long)]
        max: Option<i64>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = CommandLine::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(database) = args.database {
        config.database.path = database;
    }

    let store = SqliteStore::open(&config.database.path).with_context(|| {
        format!(
            "failed to open database {}",
            config.database.path.display()
        )
    })?;

    match args.command {
        Command::Revision {
            id,
            article,
            counter,
            at,
            text,
        } => {
            let api = RevisionApi::with_config(store, &config)?;
            let revision = match (id, article, counter, at) {
                (Some(id), _, _, _) => api.get_revision(id)?,
                (None, Some(article), Some(counter), _) => {
                    api.get_revision_by_counter(article, counter)?
                }
                (None, Some(article), None, Some(at)) => api.get_revision_at(article, at)?,
                _ => bail!("either --id or --article with --counter or --at is required"),
            };
            print_revision(&revision, text)?;
        }
        Command::Article { article_id } => {
            let api = RevisionApi::with_config(store, &config)?;
            println!("article:       {article_id}");
            println!("revisions:     {}", api.number_of_revisions(article_id)?);
            println!("first:         {}", api.first_appearance(article_id)?);
            println!("last:          {}", api.last_appearance(article_id)?);
            println!(
                "contributors:  {} ({} registered)",
                api.number_of_unique_contributors(article_id, false)?,
                api.number_of_unique_contributors(article_id, true)?
            );
            for (counter, timestamp) in api.revision_timestamps(article_id)?.iter().enumerate() {
                println!("{:>6}  {timestamp}", counter + 1);
            }
        }
        Command::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let history: ArticleHistory = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let entry = ChainWriter::new(&store, &config)?.write_article(&history)?;
            println!(
                "stored article {} with {} revisions in {} runs",
                entry.article_id,
                entry.number_of_revisions(),
                entry.runs().len()
            );
        }
        Command::Maintain => {
            let filled = maintenance::ensure_number_revisions(&store)?;
            println!("filled revision counts of {filled} articles");
        }
        Command::Filter { min, max } => {
            let api = RevisionApi::with_config(store, &config)?;
            for article_id in api.articles_with_revision_count(min, max)? {
                println!("{article_id}");
            }
        }
    }

    Ok(())
}

fn print_revision(revision: &Revision, with_text: bool) -> Result<()> {
    println!("revision:      {}", revision.id);
    println!("article:       {}", revision.article_id);
    println!("counter:       {}", revision.counter);
    println!("timestamp:     {}", revision.timestamp);
    let contributor = &revision.contributor;
    println!(
        "contributor:   {}{}",
        contributor.name.as_deref().unwrap_or("<unknown>"),
        if contributor.is_registered { "" } else { " (anonymous)" }
    );
    if let Some(comment) = &revision.comment {
        println!("comment:       {comment}");
    }
    println!("minor:         {}", revision.minor);
    if with_text {
        println!();
        println!("{}", revision.text()?);
    }
    Ok(())
}
