use clinicsync_core::config::SyncSettings;
use clinicsync_core::Statement;

use crate::commands::common::{format_rows, parse_param, print_json, SyncContext};
use crate::error::CliError;

pub async fn run_query(
    settings: SyncSettings,
    sql: &str,
    params: &[String],
    fresh: bool,
    json: bool,
) -> Result<(), CliError> {
    if sql.trim().is_empty() {
        return Err(CliError::InvalidArgument("SQL must not be empty".to_string()));
    }

    let context = SyncContext::connect(&settings).await?;
    let router = context.router();
    let statement = Statement::with_params(sql, params.iter().map(String::as_str).map(parse_param).collect());

    let outcome = if fresh {
        router.execute_fresh(&statement).await?
    } else {
        router.execute(&statement).await?
    };

    if json {
        return print_json(&outcome);
    }
    match outcome.mutation() {
        Some(result) => {
            println!("{} row(s) affected", result.rows_affected);
            if let Some(id) = result.last_insert_id {
                println!("Last insert id: {id}");
            }
        }
        None => {
            for line in format_rows(outcome.rows()) {
                println!("{line}");
            }
        }
    }
    Ok(())
}
