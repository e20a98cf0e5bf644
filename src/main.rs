use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rickdex::cache::CacheSource;
use rickdex::config::Config;
use rickdex::rickmorty::types::group_by_season;
use rickdex::rickmorty::{CachedRickAndMorty, Character};
use rickdex::sync::PageLoad;

#[derive(Parser, Debug)]
#[command(name = "rickdex")]
#[command(about = "Browse Rick and Morty episodes and characters, offline when needed")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rickdex/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List episodes grouped by season
  Episodes {
    /// Drop the cached list and fetch it again
    #[arg(long)]
    refresh: bool,

    /// Number of pages to have loaded before printing
    #[arg(long, default_value = "1")]
    pages: u32,
  },
  /// Show one character
  Character {
    id: u32,
  },
  /// Show several characters, fetched in one request
  Characters {
    #[arg(required = true)]
    ids: Vec<u32>,
  },
  /// Show the characters appearing in an episode
  EpisodeCharacters {
    episode_id: u32,
  },
  /// Write a character sheet to a text file
  Export {
    id: u32,

    /// Directory to write into
    #[arg(long, default_value = ".")]
    dir: PathBuf,
  },
  /// Delete everything cached
  Clear,
}

fn init_tracing() -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
    &log_dir,
    "rickdex.log",
  ));

  tracing_subscriber::registry()
    .with(tracing_subscriber::EnvFilter::new(
      std::env::var("RUST_LOG").unwrap_or_else(|_| "rickdex=info".to_string()),
    ))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_tracing()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let client = CachedRickAndMorty::new(&config)?;

  match args.command {
    Command::Episodes { refresh, pages } => episodes(&client, refresh, pages).await,
    Command::Character { id } => {
      let source = client.characters.load_entity(id).await?;
      let character = client
        .characters
        .character(id)
        .ok_or_else(|| eyre!("Character {} not found", id))?;
      print_character(&character);
      print_source(source);
      Ok(())
    }
    Command::Characters { ids } => {
      let outcome = client.characters.load_entities(&ids).await?;
      for character in client.characters.characters_for(&ids) {
        print_character(&character);
        println!();
      }
      if !outcome.missing.is_empty() {
        println!("Not found: {:?}", outcome.missing);
      }
      if !outcome.from_cache.is_empty() {
        println!("(offline: {} served from cache)", outcome.from_cache.len());
      }
      Ok(())
    }
    Command::EpisodeCharacters { episode_id } => episode_characters(&client, episode_id).await,
    Command::Export { id, dir } => {
      client.characters.load_entity(id).await?;
      let character = client
        .characters
        .character(id)
        .ok_or_else(|| eyre!("Character {} not found", id))?;
      let path = dir.join(character.export_file_name());
      std::fs::write(&path, character.export_text())
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      println!("Wrote {}", path.display());
      Ok(())
    }
    Command::Clear => {
      client.clear().await?;
      println!("Cache cleared");
      Ok(())
    }
  }
}

async fn episodes(client: &CachedRickAndMorty, refresh: bool, pages: u32) -> Result<()> {
  let source = client.episodes.load_collection(refresh).await?;

  while client.episodes.state().current_page < pages {
    match client.episodes.load_next_page().await? {
      PageLoad::Committed { .. } => {}
      PageLoad::Exhausted | PageLoad::AlreadyInFlight(_) | PageLoad::Discarded(_) => break,
    }
  }

  let state = client.episodes.state();
  for (season, episodes) in group_by_season(&state.items) {
    println!("Season {}", season);
    for episode in episodes {
      println!(
        "  {:>3}  {:<7} {:<40} {}",
        episode.id,
        episode.episode_code.as_deref().unwrap_or("-"),
        episode.name.as_deref().unwrap_or("Unknown"),
        episode.formatted_air_date().unwrap_or_default(),
      );
    }
  }

  println!(
    "\n{} of {} episodes (page {}{})",
    state.items.len(),
    state.total_count,
    state.current_page,
    if state.has_more { ", more available" } else { "" }
  );
  print_source(source);
  if client.episodes.should_show_refresh_hint() {
    if let Some(days) = client.episodes.days_since_last_fetch() {
      println!("Last updated {} days ago; run with --refresh to update", days);
    }
  }
  Ok(())
}

async fn episode_characters(client: &CachedRickAndMorty, episode_id: u32) -> Result<()> {
  client.episodes.load_collection(false).await?;

  // Page through until the episode shows up or the list runs out
  let episode = loop {
    if let Some(episode) = client
      .episodes
      .state()
      .items
      .into_iter()
      .find(|e| e.id == episode_id)
    {
      break episode;
    }
    match client.episodes.load_next_page().await? {
      PageLoad::Committed { .. } => {}
      _ => return Err(eyre!("Episode {} not found", episode_id)),
    }
  };

  let (characters, outcome) = client.load_episode_characters(&episode).await?;
  println!(
    "{} ({})",
    episode.name.as_deref().unwrap_or("Unknown"),
    episode.episode_code.as_deref().unwrap_or("-")
  );
  for character in characters {
    println!(
      "  {:>4}  {:<30} {}",
      character.id,
      character.name.as_deref().unwrap_or("Unknown"),
      character.status
    );
  }
  if !outcome.missing.is_empty() {
    println!("Not found: {:?}", outcome.missing);
  }
  Ok(())
}

fn print_character(character: &Character) {
  println!("{}", character.name.as_deref().unwrap_or("Unknown"));
  println!("  Status:   {}", character.status);
  println!("  Species:  {}", character.species.as_deref().unwrap_or("Unknown"));
  if let Some(kind) = character.display_type() {
    println!("  Type:     {}", kind);
  }
  println!("  Gender:   {}", character.gender);
  if let Some(origin) = &character.origin {
    println!("  Origin:   {}", origin.name);
  }
  if let Some(location) = &character.location {
    println!("  Location: {}", location.name);
  }
  println!("  Episodes: {}", character.episode_ids().len());
}

fn print_source(source: CacheSource) {
  if source.is_offline() {
    println!("(offline: showing cached data)");
  }
}
