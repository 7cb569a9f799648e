use anyhow::{Context, Result};
use credit_ledger::CompletionService;
use std::path::Path;
use tracing::{info, warn};

use super::VideoIndex;

/// One `url,description` line as printed by yt-dlp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRecord {
    pub url: String,
    pub description: String,
}

/// Parse catalogue lines. Only the first comma separates the fields, so
/// descriptions may contain commas. Blank and malformed lines are skipped.
pub fn parse_catalogue(content: &str) -> Vec<VideoRecord> {
    content
        .lines()
        .enumerate()
        .filter_map(|(n, line)| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match line.split_once(',') {
                Some((url, description)) if !url.trim().is_empty() && !description.trim().is_empty() => {
                    Some(VideoRecord {
                        url: url.trim().to_string(),
                        description: description.trim().to_string(),
                    })
                }
                _ => {
                    warn!("Skipping malformed catalogue line {}: {line}", n + 1);
                    None
                }
            }
        })
        .collect()
}

/// Embed and store every video listed in `csv_path`. Returns the number stored.
pub async fn import_csv(
    csv_path: &Path,
    index: &dyn VideoIndex,
    service: &dyn CompletionService,
    embedding_model: &str,
) -> Result<usize> {
    let content = tokio::fs::read_to_string(csv_path)
        .await
        .with_context(|| format!("Failed to read {}", csv_path.display()))?;

    let records = parse_catalogue(&content);
    info!("Importing {} videos from {}", records.len(), csv_path.display());

    for (n, record) in records.iter().enumerate() {
        let embedding = service
            .embed(&record.description, embedding_model)
            .await
            .with_context(|| format!("Failed to embed \"{}\"", record.description))?;
        index
            .insert(&record.url, &record.description, &embedding)
            .await
            .with_context(|| format!("Failed to store {}", record.url))?;

        if (n + 1) % 50 == 0 {
            info!("Imported {}/{}", n + 1, records.len());
        }
    }

    Ok(records.len())
}
