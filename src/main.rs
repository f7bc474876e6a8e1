use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use read_stash::models::{ArticleFilter, ArticleStatus, ArticleWithTags};
use read_stash::pipeline::Callbacks;
use read_stash::{App, Config, Result};

/// Width used when rendering cached HTML as text on the terminal.
const READ_WIDTH: usize = 88;

/// Read-it-later article store: submit links, let them be extracted in the
/// background, then list, read and search them.
#[derive(Parser)]
#[command(name = "read-stash", version)]
struct Cli {
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run retry sweeps and cache cleanups on schedule until Ctrl-C.
    Serve,

    /// Save a URL and extract it.
    Submit {
        #[arg(long)]
        user: i64,
        url: String,
    },

    /// Run one retry sweep, wait for its retries to finish, then exit.
    Sweep,

    /// Delete cache entries older than the configured maximum age.
    Cleanup,

    /// Find articles whose content or metadata contains the query literally.
    Search {
        #[arg(long)]
        user: i64,
        query: String,
    },

    /// List a user's articles, newest first.
    List {
        #[arg(long)]
        user: i64,

        /// Only these statuses (repeatable).
        #[arg(long = "status")]
        statuses: Vec<String>,

        /// Show archived articles instead of the reading list.
        #[arg(long)]
        archived: bool,

        /// Literal text to match in title, description, summary or URL.
        #[arg(long)]
        query: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// List a user's tags.
    Tags {
        #[arg(long)]
        user: i64,
    },

    /// Print an article's content as text and mark it read.
    Read {
        #[arg(long)]
        user: i64,
        article_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let app = App::new(&config).await?;

    match cli.command {
        Commands::Serve => {
            app.run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                }
            })
            .await?;
        }

        Commands::Submit { user, url } => {
            let handle = app.submit_url(user, &url, Callbacks::none()).await?;
            let id = handle.article_id();
            let outcome = handle.wait().await;
            println!("Article {id}: {outcome:?}");
        }

        Commands::Sweep => {
            let (report, finished) = app.sweep_and_wait().await?;
            for event in &finished {
                println!("Article {}: {:?}", event.article_id, event.outcome);
            }
            println!(
                "Retried {}, {} already queued, gave up on {}, {} errors",
                report.retried, report.already_queued, report.terminalized, report.errors
            );
        }

        Commands::Cleanup => {
            let report = app.cleanup_cache().await?;
            println!(
                "Scanned {} files, deleted {}, {} errors",
                report.scanned, report.deleted, report.errors
            );
        }

        Commands::Search { user, query } => {
            let hits = app.search(user, &query).await?;
            if hits.is_empty() {
                println!("No matches for {query:?}");
            }
            for hit in &hits {
                print_article(hit);
            }
        }

        Commands::List {
            user,
            statuses,
            archived,
            query,
            limit,
        } => {
            let statuses = statuses
                .iter()
                .map(|s| s.parse::<ArticleStatus>())
                .collect::<Result<Vec<_>>>()?;
            let mut filter = ArticleFilter::for_user(user)
                .statuses(statuses)
                .archived(archived)
                .page(limit, 0);
            if let Some(query) = query {
                filter = filter.query(query);
            }
            for article in app.repository.list_articles(filter).await? {
                print_article(&article);
            }
        }

        Commands::Tags { user } => {
            for tag in app.repository.list_tags(user).await? {
                println!("{:>6}  {}", tag.id, tag.name);
            }
        }

        Commands::Read { user, article_id } => match app.read_content(user, article_id).await? {
            Some(content) => {
                let text = html2text::from_read(content.as_bytes(), READ_WIDTH)
                    .unwrap_or(content);
                println!("{text}");
                app.repository.mark_read(user, article_id).await?;
            }
            None => println!("Article {article_id} has not been extracted yet"),
        },
    }

    Ok(())
}

fn print_article(item: &ArticleWithTags) {
    let article = &item.article;
    let tags: Vec<&str> = item.tags.iter().map(|t| t.name.as_str()).collect();
    println!(
        "{:>6}  {:<10}  {}",
        article.id,
        article.status.as_str(),
        article.display_title()
    );
    println!("        {}", article.url);
    if !tags.is_empty() {
        println!("        tags: {}", tags.join(", "));
    }
}
