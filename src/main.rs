mod app;
mod cache;
mod config;
mod db;
mod error;
mod event;
mod net;
mod notes;
mod sync;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::cache::Request;
use crate::notes::Note;

#[derive(Parser, Debug)]
#[command(name = "notesync")]
#[command(about = "Offline-first notes with background sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/notesync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the network as unavailable
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create a note (content is read from stdin when omitted)
  Add {
    #[arg(short, long)]
    title: String,
    #[arg(long)]
    content: Option<String>,
  },
  /// Edit a note's title and/or content
  Edit {
    id: i64,
    #[arg(short, long)]
    title: Option<String>,
    #[arg(long)]
    content: Option<String>,
  },
  /// List notes with their sync state
  List,
  /// Print one note
  Show { id: i64 },
  /// Delete a note locally
  Rm { id: i64 },
  /// Reconcile pending notes with the remote store now
  Sync,
  /// Install and activate the configured cache generation
  Install,
  /// Route a request through the offline cache
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat the request as a document navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long)]
    accept: Option<String>,
  },
  /// Run the background sync worker until interrupted
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config.data_dir()?)?;

  let app = app::App::new(config, args.offline)?;

  match args.command {
    Command::Add { title, content } => {
      let content = match content {
        Some(c) => c,
        None => read_stdin()?,
      };
      let note = app.create_note(&title, &content)?;
      println!("created note {}", note.id);
    }
    Command::Edit { id, title, content } => {
      if title.is_none() && content.is_none() {
        return Err(eyre!("Nothing to change: pass --title and/or --content"));
      }
      let note = app.edit_note(id, title.as_deref(), content.as_deref())?;
      println!("{}", summary_line(&note));
    }
    Command::List => {
      for note in app.all_notes()? {
        println!("{}", summary_line(&note));
      }
    }
    Command::Show { id } => {
      let note = app
        .note(id)?
        .ok_or_else(|| eyre!("Note {} not found", id))?;
      println!("{}\n\n{}", summary_line(&note), note.content);
    }
    Command::Rm { id } => {
      if !app.delete_note(id)? {
        return Err(eyre!("Note {} not found", id));
      }
      println!("deleted note {}", id);
    }
    Command::Sync => {
      println!("{}", app.sync_now().await);
    }
    Command::Install => {
      let (generation, removed) = app.install().await?;
      println!("generation {} active", generation.version);
      for name in removed {
        println!("removed {}", name);
      }
    }
    Command::Fetch {
      url,
      method,
      navigate,
      accept,
    } => {
      let url = url::Url::parse(&url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method: {}", e))?;
      let mut request = if navigate {
        Request::navigation(url)
      } else {
        Request::new(method, url)
      };
      if let Some(accept) = accept {
        request = request.with_accept(accept);
      }

      let result = app.fetch(&request).await?;
      eprintln!("{} ({})", result.data.status, result.source);
      if let Some(content_type) = result.data.header("content-type") {
        eprintln!("content-type: {}", content_type);
      }
      if let Some(cached_at) = result.cached_at {
        eprintln!("cached at {}", cached_at.to_rfc3339());
      }
      println!("{}", String::from_utf8_lossy(&result.data.body));
      if let Some(revalidation) = result.revalidation {
        // Let the refresh land before the process exits
        let _ = revalidation.await;
      }
    }
    Command::Run => app.run().await?,
  }

  Ok(())
}

/// Log to a daily file in the data directory; stdout is for command output.
fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(data_dir, "notesync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("NOTESYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn read_stdin() -> Result<String> {
  let mut content = String::new();
  std::io::stdin()
    .read_to_string(&mut content)
    .map_err(|e| eyre!("Failed to read note content from stdin: {}", e))?;
  Ok(content)
}

fn summary_line(note: &Note) -> String {
  let marker = match note.sync_state {
    notes::SyncState::Pending => "*",
    notes::SyncState::Synced => " ",
  };
  format!(
    "{}{:>5}  {}  {}",
    marker,
    note.id,
    note.updated_at.format("%Y-%m-%d %H:%M"),
    note.title
  )
}
