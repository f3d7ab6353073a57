//! pgkit - run SQL against a pooled database and print the result as JSON.

use clap::Parser;
use pgkit::Database;
use pgkit::config::{Command, Config, StatementArgs};
use pgkit::error::DbError;
use pgkit::models::{Params, Value};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Build statement parameters from `-p` / `-n` arguments.
fn statement_params(args: &StatementArgs) -> Result<Params, DbError> {
    if !args.named.is_empty() {
        let named = args
            .named
            .iter()
            .map(|arg| {
                arg.split_once('=')
                    .map(|(name, value)| (name.to_string(), Value::parse_literal(value)))
                    .ok_or_else(|| {
                        DbError::invalid_input(format!(
                            "Named parameter '{}' must look like name=value",
                            arg
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Params::Named(named));
    }
    if args.params.is_empty() {
        return Ok(Params::None);
    }
    Ok(Params::Positional(
        args.params.iter().map(|p| Value::parse_literal(p)).collect(),
    ))
}

async fn execute(db: &Database, command: &Command) -> Result<serde_json::Value, DbError> {
    match command {
        Command::Run(args) => {
            let rows_affected = db
                .query(&args.sql)
                .params(statement_params(args)?)
                .run()
                .await?;
            Ok(json!({ "rows_affected": rows_affected }))
        }
        Command::One(args) => {
            let mut query = db.query(&args.sql).params(statement_params(args)?);
            if let Some(back_as) = args.back_as {
                query = query.back_as(back_as);
            }
            Ok(query.one().await?.to_json())
        }
        Command::All(args) => {
            let mut query = db.query(&args.sql).params(statement_params(args)?);
            if let Some(back_as) = args.back_as {
                query = query.back_as(back_as);
            }
            let rows = query.all().await?;
            Ok(serde_json::Value::Array(
                rows.iter().map(|row| row.to_json()).collect(),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let db_config = config.database_config()?;
    info!(
        database = %db_config.connect.masked(),
        "Starting pgkit v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = Database::connect(db_config).await?;
    let result = execute(&db, &config.command).await;
    db.close().await;

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Statement failed");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Hint: {}", suggestion);
            }
            Err(e.into())
        }
    }
}
