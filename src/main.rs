use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use archdict::catalog::CatalogClient;
use archdict::config::Config;
use archdict::ingest::IngestEvent;
use archdict::library::Library;
use archdict::query::SearchRequest;
use archdict::storage::{
    Category, Database, Item, StorageError, HIGHLIGHT_CLOSE, HIGHLIGHT_OPEN,
};
use archdict::util::{fit_to_width, single_line, strip_control_chars};

/// Get the config directory path (~/.config/archdict/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("archdict"))
}

/// Write `content` to `dst` via a temp file and rename, so `dst` is never
/// left half-written.
fn atomic_write(dst: &Path, content: &[u8]) -> Result<()> {
    // Unpredictable temp name; create_new refuses to follow a planted symlink.
    use std::time::{SystemTime, UNIX_EPOCH};
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut temp_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions or disk space",
                temp_path.display()
            )
        })?;

    temp_file.write_all(content).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to write to temporary file '{}': disk may be full",
            temp_path.display()
        )
    })?;

    temp_file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to sync temporary file '{}' to disk: disk may be full",
            temp_path.display()
        )
    })?;
    drop(temp_file);

    // Windows rename fails when the destination exists
    #[cfg(windows)]
    if dst.exists() {
        std::fs::remove_file(dst).with_context(|| {
            let _ = std::fs::remove_file(&temp_path);
            format!("Failed to remove existing '{}' before atomic replace", dst.display())
        })?;
    }

    std::fs::rename(&temp_path, dst).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}': check permissions",
            temp_path.display(),
            dst.display()
        )
    })?;

    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "archdict",
    version,
    about = "Offline archaeology dictionary with full-text search, bookmarks and notes"
)]
struct Args {
    /// Config file (default: ~/.config/archdict/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Store location, overriding the config file
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Rebuild the search index (FTS5)
    #[arg(long, global = true)]
    rebuild_search: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search items by name, description or category
    Search {
        /// Free text; prefix-matched per word
        query: Option<String>,
        /// Category code filter
        #[arg(long)]
        category: Option<String>,
        /// Dictionary type filter (site or term)
        #[arg(long = "type", value_name = "TYPE")]
        dictionary_type: Option<String>,
        /// Only bookmarked items
        #[arg(long)]
        bookmarked: bool,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
        /// name, recent or count (ignored for text searches)
        #[arg(long)]
        sort: Option<String>,
        /// asc or desc
        #[arg(long)]
        sort_dir: Option<String>,
    },
    /// Show one item (counts as a view)
    Show { id: String },
    /// Download the catalog into the local store
    Update,
    /// Bookmark an item
    Bookmark {
        id: String,
        /// Remove the bookmark instead
        #[arg(long)]
        remove: bool,
    },
    /// Attach a note to an item, replacing any previous note
    Note { id: String, text: String },
    /// List categories with item counts
    Categories,
    /// List items in one category
    Category { code: String },
    /// List bookmarked items
    Bookmarks,
    /// List recently viewed items
    Recent,
    /// Write every item with its annotations to a JSON file
    Export { file: PathBuf },
    /// Delete all items, annotations and the search index
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // User-only access on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .database
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("store.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(StorageError::Locked) => {
            eprintln!(
                "Error: The dictionary store is locked by another archdict process. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open store at {}: {}", db_path.display(), e));
        }
    };

    if args.rebuild_search {
        tracing::info!("Rebuilding search index...");
        let count = db
            .rebuild_search_index()
            .await
            .context("Failed to rebuild search index")?;
        tracing::info!(items = count, "Search index rebuilt");
        eprintln!("Search index rebuilt: {} items indexed", count);
    } else {
        match db.check_index_consistency().await {
            Ok(report) if report.is_consistent => {
                tracing::debug!("FTS5 index is consistent");
            }
            Ok(report) => {
                tracing::warn!(
                    items = report.items_count,
                    fts = report.index_count,
                    orphaned = report.orphaned_entries,
                    missing = report.missing_entries,
                    "FTS index inconsistent, run with --rebuild-search"
                );
                eprintln!(
                    "Warning: Search index is out of sync (missing: {}, orphaned: {}). Run with --rebuild-search to fix.",
                    report.missing_entries, report.orphaned_entries
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to check FTS5 consistency");
            }
        }
    }

    let Some(command) = args.command else {
        if !args.rebuild_search {
            Args::command().print_help()?;
        }
        db.close().await;
        return Ok(());
    };

    let catalog = CatalogClient::new(config.catalog_settings())
        .context("Failed to create catalog client")?;
    let library = Library::new(db, Arc::new(catalog), config.ingest_mode)
        .with_recent_limit(config.recent_limit);

    let result = run_command(&library, &config, command, args.json).await;
    library.close().await;
    result
}

async fn run_command(
    library: &Library,
    config: &Config,
    command: Command,
    json: bool,
) -> Result<()> {
    match command {
        Command::Search {
            query,
            category,
            dictionary_type,
            bookmarked,
            limit,
            offset,
            sort,
            sort_dir,
        } => {
            let request = SearchRequest {
                query: query.unwrap_or_default(),
                category_id: category,
                dictionary_type,
                bookmarked: Some(bookmarked),
                limit: Some(limit.unwrap_or(config.search_limit)),
                offset,
                sort,
                sort_dir,
            };
            let items = library.search(&request).await.context("Search failed")?;
            print_items(&items, json)
        }
        Command::Show { id } => {
            let item = library
                .get_item_detail(&id)
                .await
                .with_context(|| format!("Failed to load item '{}'", id))?;
            if json {
                print_json(&item)
            } else {
                print_detail(&item);
                Ok(())
            }
        }
        Command::Update => run_update(library, json).await,
        Command::Bookmark { id, remove } => {
            library
                .toggle_bookmark(&id, !remove)
                .await
                .context("Failed to update bookmark")?;
            if !json {
                println!("{} {}", if remove { "Unbookmarked" } else { "Bookmarked" }, id);
            }
            Ok(())
        }
        Command::Note { id, text } => {
            library.save_note(&id, &text).await.context("Failed to save note")?;
            if !json {
                println!("Saved note for {}", id);
            }
            Ok(())
        }
        Command::Categories => {
            let categories = library
                .get_categories()
                .await
                .context("Failed to list categories")?;
            print_categories(&categories, json)
        }
        Command::Category { code } => {
            let items = library
                .get_category_items(&code)
                .await
                .context("Failed to list category")?;
            print_items(&items, json)
        }
        Command::Bookmarks => {
            let items = library
                .get_bookmarked_items()
                .await
                .context("Failed to list bookmarks")?;
            print_items(&items, json)
        }
        Command::Recent => {
            let items = library
                .get_recent_items()
                .await
                .context("Failed to list recent items")?;
            print_items(&items, json)
        }
        Command::Export { file } => {
            let items = library.export_all().await.context("Failed to read store")?;
            let content = serde_json::to_vec_pretty(&items).context("Failed to serialize export")?;
            atomic_write(&file, &content)
                .with_context(|| format!("Failed to write export to {}", file.display()))?;
            tracing::info!(items = items.len(), path = %file.display(), "Exported store");
            if !json {
                println!("Exported {} items to {}", items.len(), file.display());
            }
            Ok(())
        }
        Command::Reset { yes } => {
            if !yes {
                anyhow::bail!(
                    "Refusing to reset without --yes: this deletes all items, bookmarks and notes"
                );
            }
            library.reset_all_data().await.context("Failed to reset store")?;
            if !json {
                println!("All data deleted.");
            }
            Ok(())
        }
    }
}

/// Drive an update to completion, printing one line per event.
/// Ctrl-C cancels the run at its next cancellation point.
async fn run_update(library: &Library, json: bool) -> Result<()> {
    let mut handle = library.update_data().context("Cannot start update")?;

    let token = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling update");
            token.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            match &event {
                IngestEvent::Started {
                    total_count,
                    total_pages,
                } => println!("Catalog has {} records in {} pages", total_count, total_pages),
                IngestEvent::Progress(progress) => {
                    println!("[{:>3}%] {}", progress.percent, progress.message)
                }
                IngestEvent::Completed { count, skipped } => {
                    println!("Update complete: {} items stored", count);
                    if *skipped > 0 {
                        println!("Skipped {} records without an id", skipped);
                    }
                }
                IngestEvent::Failed { message } => eprintln!("Update failed: {}", message),
                IngestEvent::Cancelled => eprintln!("Update cancelled"),
            }
        }
        if event.is_terminal() {
            break;
        }
    }

    handle.wait().await.context("Update did not complete")?;
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Sanitize remote text for one terminal row.
fn cell(s: &str, width: usize) -> String {
    fit_to_width(&single_line(&strip_control_chars(s)), width)
}

fn print_items(items: &[Item], json: bool) -> Result<()> {
    if json {
        return print_json(items);
    }
    if items.is_empty() {
        println!("No items.");
        return Ok(());
    }
    for item in items {
        let mark = if item.annotation.is_bookmarked { '*' } else { ' ' };
        println!(
            "{} {}  {}  {}",
            mark,
            cell(&item.entry.id, 12),
            cell(&item.entry.name, 40),
            cell(item.entry.type_name.as_deref().unwrap_or(""), 20),
        );
        if let Some(excerpt) = &item.content_highlight {
            let marked = excerpt
                .replace(HIGHLIGHT_OPEN, "[")
                .replace(HIGHLIGHT_CLOSE, "]");
            println!("    {}", cell(&marked, 76));
        }
    }
    Ok(())
}

fn print_categories(categories: &[Category], json: bool) -> Result<()> {
    if json {
        return print_json(categories);
    }
    if categories.is_empty() {
        println!("No categories.");
        return Ok(());
    }
    for category in categories {
        let name = match (&category.id, &category.name) {
            (_, Some(name)) => name.as_str(),
            (None, None) => "(uncategorized)",
            (Some(_), None) => "",
        };
        println!(
            "{}  {}  {:>6}",
            cell(category.id.as_deref().unwrap_or("-"), 10),
            cell(name, 30),
            category.count
        );
    }
    Ok(())
}

fn print_detail(item: &Item) {
    let entry = &item.entry;
    let field = |label: &str, value: Option<&str>| {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            println!("{:<10} {}", label, strip_control_chars(v));
        }
    };

    println!("{}", single_line(&strip_control_chars(&entry.name)));
    println!();
    field("Id", Some(&entry.id));
    field("Type", entry.dictionary_type.map(|t| t.as_str()));
    field("Category", entry.type_name.as_deref().or(entry.type_code.as_deref()));
    field("Source", entry.reference.as_deref());
    field("Copyright", entry.copyright.as_deref());
    field("Link", entry.data_link.as_deref());
    println!(
        "{:<10} {}{}",
        "Views",
        item.annotation.view_count,
        if item.annotation.is_bookmarked { "  (bookmarked)" } else { "" }
    );

    if let Some(content) = entry.content.as_deref() {
        println!();
        println!("{}", strip_control_chars(content));
    }
    if let Some(note) = item.annotation.note.as_deref().filter(|n| !n.is_empty()) {
        println!();
        println!("Note: {}", strip_control_chars(note));
    }
}
