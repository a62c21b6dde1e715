use clinicsync_core::config::SyncSettings;

use crate::commands::common::{open_cache, print_json};
use crate::error::CliError;

pub async fn run_cursor(settings: SyncSettings) -> Result<(), CliError> {
    let cache = open_cache(&settings).await?;
    let cursor = cache.session().await.load_cursor().await?;
    print_json(&cursor)
}
