use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tagtree::utils::ensure_database_directory;
use tagtree::{Config, Database, NewTag, SqliteTagStore, Tag, TagError, TagId, TagService};
use tracing_subscriber::EnvFilter;

/// tagtree - hierarchical tag manager
#[derive(Parser)]
#[command(name = "tagtree")]
#[command(about = "Manage a hierarchy of tags")]
#[command(version)]
struct Cli {
    /// Database file (overrides TAGTREE_DB)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Print tags as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Print every tag as a tree
    List,
    /// Show a single tag
    Show {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// List a tag and all of its descendants
    Subtree {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Create a tag
    Add {
        /// Tag name, or a path such as lang/rust/async when no parent is given
        #[arg(value_name = "NAME")]
        name: String,

        /// Parent tag id
        #[arg(short, long, value_name = "ID")]
        parent: Option<String>,
    },
    /// Rename a tag, keeping its position
    Rename {
        #[arg(value_name = "ID")]
        id: String,

        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Move a tag (and its subtree) under a new parent
    Move {
        #[arg(value_name = "ID")]
        id: String,

        /// New parent tag id
        #[arg(short, long, value_name = "ID", conflicts_with = "root", required_unless_present = "root")]
        parent: Option<String>,

        /// Make the tag a root
        #[arg(long)]
        root: bool,
    },
    /// Delete a tag, its descendants and their entry associations
    Delete {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Check the stored hierarchy for consistency
    Check,
}

fn main() {
    let cli = Cli::parse();

    let result = run(cli);

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            // Determine exit code based on error type
            let exit_code = if is_user_error(&e) { 1 } else { 2 };
            eprintln!("Error: {e:#}");
            std::process::exit(exit_code);
        }
    }
}

/// Determines if an error is a user error (vs internal error).
///
/// User errors are unknown ids and rejected input. Store failures and I/O
/// errors are internal.
fn is_user_error(error: &anyhow::Error) -> bool {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<TagError>())
        .is_some_and(|err| err.is_not_found() || err.is_validation())
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads configuration, opens the database and runs the command.
fn run(cli: Cli) -> Result<bool> {
    let config = Config::from_env()?.with_database_path(cli.db);
    init_tracing(&config.log_filter);

    ensure_database_directory(&config.database_path)?;
    let db = Database::open(&config.database_path).context("Failed to open database")?;

    execute(&cli.command, &TagService::with_database(db), cli.json)
}

/// Executes a command against a service.
///
/// Returns `Ok(false)` when the command ran but found a problem to report.
/// Separated from `run` to allow testing with in-memory databases.
fn execute(command: &Commands, service: &TagService<SqliteTagStore>, json: bool) -> Result<bool> {
    match command {
        Commands::List if json => {
            let roots: Vec<TagId> = service.get_all_tags()?.iter().map(|t| t.id().clone()).collect();
            print_json(&service.subtrees(&roots)?)?;
        }
        Commands::List => {
            for root in service.get_all_tags()? {
                print_tree(service, &root, 0)?;
            }
        }
        Commands::Show { id } => {
            let id = TagId::new(id.as_str());
            let tag = service.get_tag(&id)?;
            if json {
                print_json(&tag)?;
            } else {
                println!("{}", describe(&tag));
                println!("  path: {}", service.path(&id)?);
                println!("  children: {}", tag.children().len());
            }
        }
        Commands::Subtree { id } => {
            let tags = service.subtree(&TagId::new(id.as_str()))?;
            if json {
                print_json(&tags)?;
            } else {
                for tag in &tags {
                    println!("{}", describe(tag));
                }
            }
        }
        Commands::Add { name, parent } => {
            let new = NewTag {
                id: None,
                name: name.clone(),
                parent_id: parent.as_deref().map(TagId::from),
            };
            let tag = service.add_tag(new).context("Failed to create tag")?;
            println!("Tag created (id: {})", tag.id());
        }
        Commands::Rename { id, name } => {
            let current = service.get_tag(&TagId::new(id.as_str()))?;
            let new = NewTag {
                id: Some(current.id().clone()),
                name: name.clone(),
                parent_id: current.parent_id().cloned(),
            };
            let tag = service.update_tag(new).context("Failed to rename tag")?;
            println!("Tag renamed: {}", describe(&tag));
        }
        Commands::Move { id, parent, .. } => {
            let current = service.get_tag(&TagId::new(id.as_str()))?;
            let new = NewTag {
                id: Some(current.id().clone()),
                name: current.name().to_string(),
                parent_id: parent.as_deref().map(TagId::from),
            };
            let tag = service.update_tag(new).context("Failed to move tag")?;
            println!("Tag moved: {}", service.path(tag.id())?);
        }
        Commands::Delete { id } => {
            if service.delete_tag(&TagId::new(id.as_str()))? {
                println!("Tag deleted");
            } else {
                println!("No tag with id {id}");
                return Ok(false);
            }
        }
        Commands::Check => return check(service),
    }
    Ok(true)
}

/// Verifies the cache built from storage and reports rows it could not place.
fn check(service: &TagService<SqliteTagStore>) -> Result<bool> {
    let cached = service.tag_count()?;
    let stored: i64 = service
        .store()
        .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0)))
        .context("Failed to count stored tags")?;

    println!("{cached} tags in hierarchy, {stored} rows in store");
    let mut clean = true;

    if let Some(violation) = service.verify_cache()? {
        println!("Invariant violated: {violation}");
        clean = false;
    }
    if usize::try_from(stored).map_or(true, |stored| stored != cached) {
        println!("Some stored rows are unreachable from any root (orphaned or cyclic parents)");
        clean = false;
    }

    if clean {
        println!("OK");
    }
    Ok(clean)
}

fn print_tree(service: &TagService<SqliteTagStore>, tag: &Tag, depth: usize) -> Result<()> {
    println!("{}{}", "  ".repeat(depth), describe(tag));
    let ids: Vec<TagId> = tag.children().iter().cloned().collect();
    let mut children = service.get_tags(&ids)?;
    children.sort_by(|a, b| a.name().cmp(b.name()));
    for child in &children {
        print_tree(service, child, depth + 1)?;
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe(tag: &Tag) -> String {
    format!("{} ({})", tag.name(), tag.id())
}
