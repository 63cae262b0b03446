//! Nymph query tool
//!
//! Runs a wire-format query against a SQLite database, or prints the plan
//! the compiler builds for it.
//!
//! Usage:
//!   nymph-cli query --db app.db --class Employee=Employee '[{"class":"Employee"}]'
//!   nymph-cli explain --dialect postgres '[{"class":"Employee"},{"type":"&","tag":"staff"}]'

use anyhow::Result;
use clap::{Parser, Subcommand};
use nymph_cli::{explain, parse_class_mapping, run_query, DialectName};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "nymph-cli")]
#[command(about = "Run and explain Nymph queries")]
struct Args {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a query and print the result as JSON
    Query {
        /// SQLite database file
        #[arg(long)]
        db: String,

        /// Table name prefix
        #[arg(long, default_value = "nymph_")]
        prefix: String,

        /// Class to etype mapping, repeatable
        #[arg(long = "class", value_name = "CLASS=ETYPE", value_parser = parse_class_mapping)]
        classes: Vec<(String, String)>,

        /// Query in wire format: [options, ...selectors]
        query: String,
    },

    /// Print the compiled plan with its parameters
    Explain {
        #[arg(long, value_enum, default_value = "sqlite")]
        dialect: DialectName,

        /// Table name prefix
        #[arg(long, default_value = "nymph_")]
        prefix: String,

        /// Class to etype mapping, repeatable
        #[arg(long = "class", value_name = "CLASS=ETYPE", value_parser = parse_class_mapping)]
        classes: Vec<(String, String)>,

        /// Query in wire format: [options, ...selectors]
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Query {
            db,
            prefix,
            classes,
            query,
        } => {
            info!(db = %db, "running query");
            let result = run_query(&db, &query, &prefix, &classes).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Explain {
            dialect,
            prefix,
            classes,
            query,
        } => {
            let plan = explain(&query, dialect, &prefix, &classes)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }
    Ok(())
}
