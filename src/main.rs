use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use newsdeck::news::types::decode_articles;
use newsdeck::sync::UpdateKind;
use newsdeck::{ArticleQuery, Config, NewsClient, Repository, Snapshot, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "newsdeck")]
#[command(about = "Watch news queries with an offline-first local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/newsdeck/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Search query to watch (repeatable)
  #[arg(short, long)]
  query: Vec<String>,

  /// Headline category to watch (repeatable)
  #[arg(long)]
  category: Vec<String>,

  /// Print the first result per query and exit instead of watching
  #[arg(long)]
  once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing()?;

  let config = Config::load(args.config.as_deref())?;
  let api_key = Config::get_api_key()?;

  let store = Arc::new(match &config.cache_path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  });
  let client = Arc::new(NewsClient::new(
    &config.api.base_url,
    api_key,
    config.api.page_size,
  )?);
  let repo = Repository::new(Arc::clone(&store), client, config.sync.clone());

  let mut queries: Vec<ArticleQuery> = args
    .query
    .iter()
    .map(|q| ArticleQuery::search(q.clone()))
    .chain(args.category.iter().map(|c| ArticleQuery::headlines(c.clone())))
    .collect();
  if queries.is_empty() {
    queries.push(ArticleQuery::headlines("general"));
  }

  let mut subscriptions = Vec::new();
  for query in &queries {
    if let ArticleQuery::Search { query: q, .. } = query {
      store.record_search(q)?;
    }

    let (snapshot, subscription) = repo.subscribe(query)?;
    let served_fresh = snapshot.as_ref().is_some_and(|s| !s.is_stale);
    if let Some(snapshot) = &snapshot {
      print_snapshot(query, snapshot);
    }
    subscriptions.push((query.clone(), subscription, served_fresh));
  }

  if args.once {
    // Queries served fresh from cache get no update; wait on the rest.
    for (query, mut subscription, served_fresh) in subscriptions {
      if served_fresh {
        continue;
      }
      if let Some(event) = subscription.next_update().await {
        print_event(&query, &event.kind);
      }
    }
    return Ok(());
  }

  info!(queries = queries.len(), "watching");
  for (query, mut subscription, _) in subscriptions {
    tokio::spawn(async move {
      while let Some(event) = subscription.next_update().await {
        print_event(&query, &event.kind);
      }
    });
  }

  tokio::signal::ctrl_c().await?;
  info!("shutting down");
  Ok(())
}

fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::state_dir()
    .or_else(dirs::data_dir)
    .map(|d| d.join("newsdeck"))
    .unwrap_or_else(|| PathBuf::from("."));

  let appender = tracing_appender::rolling::daily(log_dir, "newsdeck.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newsdeck=info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn print_snapshot(query: &ArticleQuery, snapshot: &Snapshot) {
  let tag = if snapshot.is_stale { "cached, stale" } else { "cached" };
  print_payload(query, &snapshot.payload, tag);
}

fn print_event(query: &ArticleQuery, kind: &UpdateKind) {
  match kind {
    UpdateKind::Value { payload, from_cache } => {
      let tag = if *from_cache { "revalidated" } else { "live" };
      print_payload(query, payload, tag);
    }
    UpdateKind::Failed(e) => {
      eprintln!("[{}] error: {}", query.description(), e);
    }
  }
}

fn print_payload(query: &ArticleQuery, payload: &[u8], tag: &str) {
  match decode_articles(payload) {
    Ok(articles) => {
      println!("[{}] {} ({} articles)", query.description(), tag, articles.len());
      for article in articles.iter().take(10) {
        println!("  {}: {}", article.source.name, article.title);
      }
    }
    Err(e) => eprintln!("[{}] undecodable payload: {}", query.description(), e),
  }
}
