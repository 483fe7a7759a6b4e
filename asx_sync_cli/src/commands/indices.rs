//! The `indices` subcommand: seed the market index roster.
//!
//! Index symbols are not published in the company roster, so they are added
//! by hand and synced with `asxsync sync --with-indices`.

use std::path::PathBuf;

use anyhow::{bail, Result};
use asx_sync_lib::types::Entity;
use asx_sync_lib::Db;
use clap::{Args, Subcommand};

use crate::output::{self, OutputFormat};

/// Arguments for the `indices` subcommand.
#[derive(Args)]
pub struct IndicesArgs {
    /// SQLite database path
    #[arg(long, default_value = super::DEFAULT_DB_PATH)]
    pub db: PathBuf,

    #[command(subcommand)]
    pub action: IndicesAction,
}

#[derive(Subcommand)]
pub enum IndicesAction {
    /// Add an index, or rename one already present
    Add {
        /// Index symbol, e.g. ^AORD
        symbol: String,
        /// Display name (defaults to the symbol)
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove an index from the roster (stored prices are kept)
    Remove { symbol: String },
    /// List the index roster
    List,
}

pub fn run(args: &IndicesArgs, format: &OutputFormat) -> Result<()> {
    let mut db = Db::open(&args.db)?;
    db.ensure_schema()?;

    match &args.action {
        IndicesAction::Add { symbol, name } => {
            let symbol = normalize_symbol(symbol)?;
            let name = name.clone().unwrap_or_else(|| symbol.clone());
            db.upsert_index(&Entity::new(name, symbol.clone(), ""))?;
            eprintln!("Index {} saved", symbol);
        }
        IndicesAction::Remove { symbol } => {
            let symbol = normalize_symbol(symbol)?;
            if db.remove_index(&symbol)? {
                eprintln!("Index {} removed", symbol);
            } else {
                eprintln!("Index {} was not in the roster", symbol);
            }
        }
        IndicesAction::List => {
            let indices = db.indices()?;
            match format {
                OutputFormat::Table => output::print_indices_table(&indices),
                OutputFormat::Json => output::print_json(&output::index_rows(&indices)),
                OutputFormat::Csv => output::print_indices_csv(&indices)?,
            }
        }
    }
    Ok(())
}

fn normalize_symbol(raw: &str) -> Result<String> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        bail!("index symbol must not be empty");
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '^' | '.' | '-'))
    {
        bail!("invalid index symbol: {}", raw);
    }
    Ok(symbol)
}
