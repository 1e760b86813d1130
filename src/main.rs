use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use paddock::config::Config;
use paddock::engine::{FeedEngine, FeedEvent};
use paddock::feed::FeedFilter;
use paddock::storage::{CacheStore, FeedItem, FeedRegistry};
use paddock::util::{truncate_chars, validate_url};

const TITLE_WIDTH: usize = 80;

/// Get the config directory path (~/.config/paddock/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("paddock"))
}

/// Default cache directory (~/.cache/paddock/feeds/)
fn get_cache_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".cache").join("paddock").join("feeds"))
}

#[derive(Parser, Debug)]
#[command(name = "paddock", about = "Motorsport RSS/Atom feed reader")]
struct Args {
    /// Config file (defaults to ~/.config/paddock/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch feeds once and report what changed
    Fetch {
        /// Feed names or URLs; every registered feed when omitted
        feeds: Vec<String>,
    },
    /// Fetch every feed, then keep refreshing until Ctrl-C
    Watch,
    /// List the cached items of a feed
    Items {
        /// Feed name or URL
        feed: String,
        /// Only items whose category contains this text
        #[arg(long)]
        category: Option<String>,
        /// Only unread items
        #[arg(long)]
        unread: bool,
        /// Only items whose title, description or category contains this text
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark one item (by guid) or every item of a feed as read
    MarkRead {
        /// Feed name or URL
        feed: String,
        guid: Option<String>,
        #[arg(long, conflicts_with = "guid")]
        all: bool,
    },
    /// Show or edit the feed list
    Feeds {
        #[command(subcommand)]
        action: Option<FeedsAction>,
    },
    /// List feed categories
    Categories,
    /// Delete every cached feed file
    ClearCache,
}

#[derive(Subcommand, Debug)]
enum FeedsAction {
    List,
    Add {
        name: String,
        url: String,
        #[arg(long, default_value = "All")]
        category: String,
    },
    Remove {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    std::fs::create_dir_all(&config_dir).with_context(|| {
        format!(
            "Failed to create config directory '{}'",
            config_dir.display()
        )
    })?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;

    let (mut engine, mut events) = build_engine(config, &config_dir)?;

    match args.command {
        Command::Fetch { feeds } => {
            let urls = if feeds.is_empty() {
                engine.registry().feeds().iter().map(|f| f.url.clone()).collect()
            } else {
                feeds
                    .iter()
                    .map(|feed| resolve_feed(engine.registry(), feed))
                    .collect::<Result<Vec<_>>>()?
            };

            for url in &urls {
                engine.fetch_feed(url);
            }
            engine.settle().await;

            while let Ok(event) = events.try_recv() {
                print_event(&event);
            }
            for url in &urls {
                println!(
                    "{}: {} items, {} unread",
                    url,
                    engine.items(url).len(),
                    engine.unread_count(url)
                );
            }
        }

        Command::Watch => {
            let printer = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    print_event(&event);
                }
            });

            let (handle, engine_task) = engine.spawn();
            handle.fetch_all().await?;

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tracing::info!("Received Ctrl-C, shutting down");

            handle.shutdown().await?;
            engine_task.await.context("Feed engine task failed")?;
            printer.await.context("Event printer task failed")?;
        }

        Command::Items {
            feed,
            category,
            unread,
            search,
            limit,
        } => {
            let url = resolve_feed(engine.registry(), &feed)?;
            if !engine.load_cached(&url) {
                println!("No cached items for {url}. Run `paddock fetch` first.");
                return Ok(());
            }

            let filter = FeedFilter {
                category,
                unread_only: unread,
                search,
            };
            let items = engine.filtered_items(&url, &filter);
            for item in items.iter().take(limit) {
                print_item(item);
            }
            println!(
                "{} of {} items shown ({} unread)",
                items.len().min(limit),
                engine.items(&url).len(),
                engine.unread_count(&url)
            );
        }

        Command::MarkRead { feed, guid, all } => {
            let url = resolve_feed(engine.registry(), &feed)?;
            if !engine.load_cached(&url) {
                anyhow::bail!("No cached items for {url}");
            }

            match (guid, all) {
                (_, true) => {
                    let changed = engine.mark_all_read(&url);
                    println!("Marked {changed} items read");
                }
                (Some(guid), false) => {
                    if engine.mark_read(&url, &guid) {
                        println!("Marked {guid} read");
                    } else {
                        println!("No unread item with guid {guid}");
                    }
                }
                (None, false) => anyhow::bail!("Pass a guid or --all"),
            }
        }

        Command::Feeds { action } => match action.unwrap_or(FeedsAction::List) {
            FeedsAction::List => {
                for feed in engine.registry().feeds() {
                    println!("{:<24} {:<14} {}", feed.name, feed.category, feed.url);
                }
            }
            FeedsAction::Add {
                name,
                url,
                category,
            } => {
                engine
                    .add_feed(&name, &url, &category)
                    .with_context(|| format!("Failed to add feed '{name}'"))?;
                println!("Saved feed {name}");
            }
            FeedsAction::Remove { name } => {
                if engine
                    .remove_feed(&name)
                    .with_context(|| format!("Failed to remove feed '{name}'"))?
                {
                    println!("Removed feed {name}");
                } else {
                    println!("No feed named {name}");
                }
            }
        },

        Command::Categories => {
            for category in engine.registry().categories() {
                println!("{category}");
            }
        }

        Command::ClearCache => {
            engine.clear_cache();
            while let Ok(event) = events.try_recv() {
                print_event(&event);
            }
        }
    }

    Ok(())
}

fn build_engine(
    config: Config,
    config_dir: &Path,
) -> Result<(FeedEngine, mpsc::UnboundedReceiver<FeedEvent>)> {
    let cache_dir = match &config.cache_dir {
        Some(dir) => dir.clone(),
        None => get_cache_dir()?,
    };

    let registry_path = config_dir.join("feeds.json");
    let registry = FeedRegistry::load(&registry_path).with_context(|| {
        format!(
            "Failed to load feed registry '{}'",
            registry_path.display()
        )
    })?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = FeedEngine::new(config, CacheStore::new(cache_dir), registry, events_tx)
        .context("Failed to create HTTP client")?;
    Ok((engine, events_rx))
}

/// Registered feed name, or a URL typed directly.
fn resolve_feed(registry: &FeedRegistry, feed: &str) -> Result<String> {
    if let Some(url) = registry.url_for(feed) {
        return Ok(url.to_string());
    }
    let url = validate_url(feed)
        .with_context(|| format!("'{feed}' is neither a registered feed nor a valid URL"))?;
    Ok(url.to_string())
}

fn print_event(event: &FeedEvent) {
    match event {
        FeedEvent::Error { .. } => eprintln!("{event}"),
        _ => println!("{event}"),
    }
}

fn print_item(item: &FeedItem) {
    let marker = if item.is_read { ' ' } else { '*' };
    println!("{marker} {}", truncate_chars(&item.title, TITLE_WIDTH));
    if !item.pub_date.is_empty() {
        println!("    {}", item.pub_date);
    }
    println!("    {}", item.link);
    println!("    guid: {}", item.guid);
}
