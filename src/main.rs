//! db-bridge - command line front end for the connectivity layer.
//!
//! Connects to one server, runs a single command and prints the result as
//! JSON (JSON lines for `export`).

use std::io::{BufWriter, Write};
use std::path::Path;

use clap::Parser;
use db_bridge::Client;
use db_bridge::config::{Command, Config, ObjectKind};
use db_bridge::db::ConnectionManager;
use db_bridge::models::{
    AlterTableRequest, ExecuteOptions, ListFilter, SelectTopRequest, TableChangeBundle,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so stdout stays parseable.
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

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> CliResult<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&text)
        .map_err(|e| format!("Invalid JSON in {}: {}", path.display(), e).into())
}

/// Stream rows as JSON lines until the source is exhausted or Ctrl-C.
async fn export(
    client: &dyn Client,
    table: Option<String>,
    sql: Option<String>,
    schema: Option<String>,
    chunk_size: usize,
) -> CliResult<()> {
    let mut cursor = match (table, sql) {
        (Some(table), _) => {
            let mut request = SelectTopRequest::new(table).unbounded();
            request.schema = schema;
            client.select_top_stream(&request, chunk_size).await?
        }
        (None, Some(sql)) => client.query_stream(&sql, chunk_size).await?,
        (None, None) => return Err("export needs --table or --sql".into()),
    };

    let token = cursor.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling export");
            token.cancel();
        }
    });

    cursor.start();
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut total = 0usize;
    let outcome = loop {
        let rows = match cursor.read().await {
            Ok(rows) => rows,
            Err(e) => break Err(e),
        };
        for row in &rows {
            serde_json::to_writer(&mut out, row)?;
            writeln!(out)?;
        }
        total += rows.len();
        if rows.len() < cursor.chunk_size() {
            break Ok(());
        }
    };
    out.flush()?;
    interrupt.abort();

    info!(rows = total, "Export finished");
    outcome.map_err(Into::into)
}

async fn run(client: &dyn Client, command: Command) -> CliResult<()> {
    match command {
        Command::Tables { schema } => {
            let filter = ListFilter {
                schema,
                ..ListFilter::default()
            };
            let mut tables = client.list_tables(&filter).await?;
            tables.extend(client.list_views(&filter).await?);
            tables.extend(client.list_materialized_views(&filter).await?);
            print_json(&tables)
        }
        Command::Columns { table, schema } => {
            let columns = client
                .list_table_columns(table.as_deref(), schema.as_deref())
                .await?;
            print_json(&columns)
        }
        Command::Indexes { table, schema } => {
            print_json(&client.list_table_indexes(&table, schema.as_deref()).await?)
        }
        Command::Keys { table, schema } => {
            print_json(&client.get_table_keys(&table, schema.as_deref()).await?)
        }
        Command::Query { sql, row_mode } => {
            let options = ExecuteOptions {
                row_mode: row_mode.into(),
                ..ExecuteOptions::default()
            };
            print_json(&client.execute_query(&sql, &options).await?)
        }
        Command::Export {
            table,
            sql,
            schema,
            chunk_size,
        } => export(client, table, sql, schema, chunk_size).await,
        Command::Apply { file } => {
            let bundle: TableChangeBundle = read_json(&file)?;
            print_json(&client.apply_changes(&bundle).await?)
        }
        Command::CreateScript { name, kind, schema } => {
            let schema = schema.as_deref();
            let script = match kind {
                ObjectKind::Table => client.get_table_create_script(&name, schema).await?,
                ObjectKind::View => client.get_view_create_script(&name, schema).await?,
                ObjectKind::Routine => client.get_routine_create_script(&name, schema).await?,
            };
            if script.is_empty() {
                let kind = match kind {
                    ObjectKind::Table => "table",
                    ObjectKind::View => "view",
                    ObjectKind::Routine => "routine",
                };
                return Err(format!("No {kind} named '{name}'").into());
            }
            println!("{}", script.join("\n"));
            Ok(())
        }
        Command::Alter { file, dry_run } => {
            let request: AlterTableRequest = read_json(&file)?;
            let statements = if dry_run {
                client.alter_table_sql(&request).await?
            } else {
                client.alter_table(&request).await?
            };
            for statement in statements {
                println!("{statement};");
            }
            Ok(())
        }
        Command::TruncateAll { schema } => {
            client.truncate_all_tables(schema.as_deref()).await?;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let config = Config::parse();
    init_tracing(&config);

    let server = config.parse_server()?;
    info!(
        server_id = %server.id,
        db_type = %server.db_type,
        "Starting db-bridge v{}",
        env!("CARGO_PKG_VERSION")
    );

    let manager = ConnectionManager::with_query_timeout(config.query_timeout_duration());
    let client = manager
        .connect(server, config.database.as_deref())
        .await
        .inspect_err(|e| error!(error = %e, "Connection failed"))?;

    let result = run(client.as_client(), config.command).await;
    manager.close_all().await;

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}
