//! Exec command: log in, open a connection, run one statement, print the rows

use anyhow::{Context, Result};
use apiary_client::ApiClient;
use apiary_core::RowSet;
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ConfigLoader;

/// Arguments for the exec command
#[derive(Debug, Args)]
pub struct ExecArgs {
    /// SQL statement to run
    pub query: String,

    /// Server URL (defaults to the configured server address)
    #[arg(long)]
    pub url: Option<String>,

    #[arg(short, long, default_value = "admin")]
    pub user: String,

    #[arg(long, default_value = "admin")]
    pub password: String,

    /// Driver to connect with
    #[arg(short = 't', long = "type", default_value = "sqlite")]
    pub connection_type: String,

    /// Database to open (a file path for sqlite)
    #[arg(short, long)]
    pub database: String,

    /// Print the raw JSON result instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Run the exec command
pub async fn run(args: ExecArgs) -> Result<()> {
    let url = match &args.url {
        Some(url) => url.clone(),
        None => ConfigLoader::load()?.base_url(),
    };
    debug!(%url, "Connecting");

    let client = ApiClient::new(&url)?;
    client
        .login(&args.user, &args.password)
        .await
        .context("login failed")?;

    let result = run_statement(&client, &args).await;

    if let Err(e) = client.send("conn/disconnect", Value::Null).await {
        warn!(error = %e, "Disconnect failed");
    }
    let rows = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{}", render(&rows));
    }
    Ok(())
}

async fn run_statement(client: &ApiClient, args: &ExecArgs) -> Result<RowSet> {
    client
        .send(
            "conn/create",
            json!({"config": {"connectionType": args.connection_type, "database": args.database}}),
        )
        .await
        .context("could not open connection")?;

    let data = client
        .send("conn/executeQuery", json!({"query": args.query}))
        .await?;
    Ok(serde_json::from_value(data)?)
}

/// Rows as a table, or a one-line summary for statements that return none
fn render(rows: &RowSet) -> String {
    if rows.columns.is_empty() {
        return format!("{} ({} rows)", rows.command_tag, rows.row_count);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        rows.columns
            .iter()
            .map(|column| Cell::new(&column.name).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );

    for row in &rows.rows {
        table.add_row(
            rows.columns
                .iter()
                .map(|column| Cell::new(format_value(row.get(&column.name))))
                .collect::<Vec<_>>(),
        );
    }

    format!("{table}\n{} rows", rows.row_count)
}

fn format_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
