use anyhow::{anyhow, Result};
use std::path::Path;
use tokio::fs;

pub async fn ensure_market_data_file(path: &Path) -> Result<()> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(()),
        _ => Err(anyhow!(
            "Market data snapshot not found at {}. Create one with `generate-data` or point --data-file at an existing snapshot.",
            path.display()
        )),
    }
}
