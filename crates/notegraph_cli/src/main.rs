//! Local inspection CLI over `notegraph_core`.
//!
//! # Responsibility
//! - Open (and migrate) a note graph database from the command line.
//! - Print the branch tree and the change log for quick sanity checks.

use clap::{Parser, Subcommand};
use log::info;
use notegraph_core::{
    init_logging_from_config, open_db, open_db_in_memory, ChangeLog, CoreConfig, GraphSnapshot,
    SequenceId, ROOT_NOTE_ID,
};
use rusqlite::Connection;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

/// Note graph inspection tool.
#[derive(Parser, Debug)]
#[command(name = "notegraph")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file; overrides `db_path` from the config.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Absolute log directory; overrides `log_dir` from the config.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check core linkage.
    Ping,
    /// Create or migrate the database and print instance metadata.
    Init,
    /// Print the branch tree below a note.
    Tree {
        #[arg(long, default_value = ROOT_NOTE_ID)]
        root: String,
    },
    /// Print change-log records as JSON lines.
    Changes {
        #[arg(long, default_value_t = 0)]
        after: SequenceId,
        #[arg(long)]
        limit: Option<u32>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = match cli.config.as_ref() {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    if cli.db.is_some() {
        config.db_path = cli.db;
    }
    if cli.log_dir.is_some() {
        config.log_dir = cli.log_dir;
    }
    config.validate()?;
    init_logging_from_config(&config)?;

    if let Commands::Ping = cli.command {
        println!("notegraph_core ping={}", notegraph_core::ping());
        println!("notegraph_core version={}", notegraph_core::core_version());
        return Ok(());
    }

    let conn = match config.db_path.as_ref() {
        Some(path) => open_db(path)?,
        None => open_db_in_memory()?,
    };
    info!("event=cli_command module=cli status=start command={:?}", cli.command);

    match cli.command {
        Commands::Ping => {}
        Commands::Init => {
            let log = ChangeLog::try_new(&conn)?;
            println!(
                "schema_version={}",
                notegraph_core::db::migrations::schema_version(&conn)?
            );
            println!("source_id={}", log.source_id());
            println!("last_sequence_id={}", log.last_sequence_id()?);
        }
        Commands::Tree { root } => print_tree(&conn, &root)?,
        Commands::Changes { after, limit } => {
            let log = ChangeLog::try_new(&conn)?;
            let records = match limit {
                Some(limit) => log.records_page(after, limit)?,
                None => log.records_since(after)?,
            };
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }
    Ok(())
}

fn print_tree(conn: &Connection, root: &str) -> Result<(), Box<dyn Error>> {
    let snapshot = GraphSnapshot::load(conn)?.subtree(root);
    let Some(note) = snapshot.note(root) else {
        return Err(format!("note not found: {root}").into());
    };
    println!("{}", display_title(note));
    print_children(&snapshot, root, 1);
    Ok(())
}

fn print_children(snapshot: &GraphSnapshot, parent_note_id: &str, depth: usize) {
    for branch in snapshot.children(parent_note_id) {
        let Some(note) = snapshot.note(&branch.note_id) else {
            continue;
        };
        let prefix = branch
            .prefix
            .as_deref()
            .map(|prefix| format!("{prefix} - "))
            .unwrap_or_default();
        println!(
            "{}{}{} [{}]",
            "  ".repeat(depth),
            prefix,
            display_title(note),
            branch.note_position
        );
        print_children(snapshot, &branch.note_id, depth + 1);
    }
}

fn display_title(note: &notegraph_core::Note) -> String {
    if note.is_protected {
        format!("[protected] ({})", note.note_id)
    } else {
        format!("{} ({})", note.title, note.note_id)
    }
}
