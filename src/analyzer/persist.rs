//! # Batch Persistence
//!
//! Writes a finished batch through the asset store's bulk upsert and absorbs
//! per-item failures. Storage rejections caused by a single malformed field
//! (a mapping conflict, an unparseable value) are recoverable: the offending
//! field is stripped and the rejected subset is retried once. Everything else
//! is a hard per-item error. The retry is a single round, so a document that
//! fails on a second field after the first strip is reported as an error
//! rather than chased indefinitely.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::asset::AssetBuilder;
use crate::storage::{AssetStore, BulkItemOutcome, StorageError};

use super::AnalyzeResult;

/// Failure-message shapes the storage tier produces when exactly one field is
/// at fault; the first capture group names the field
fn recoverable_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"^MapperParsingException\[failed to parse \[(.*?)\]\];").unwrap(),
            Regex::new(r#"term in field="(.*?)""#).unwrap(),
            Regex::new(r"mapper \[(.*?)\] of different type").unwrap(),
        ]
    })
}

/// The attribute path named by a recoverable failure message, if any pattern
/// matches
pub fn broken_field(message: &str) -> Option<String> {
    for pattern in recoverable_patterns() {
        if let Some(captures) = pattern.captures(message) {
            if let Some(field) = captures.get(1) {
                return Some(field.as_str().to_string());
            }
        }
    }
    None
}

/// Bulk-upsert the batch, folding outcomes into the result. Items rejected
/// for a recoverable field error are stripped of that field and retried in
/// one additional round.
pub async fn persist_batch(
    store: &dyn AssetStore,
    assets: &mut [AssetBuilder],
    result: &mut AnalyzeResult,
) -> Result<(), StorageError> {
    if assets.is_empty() {
        return Ok(());
    }

    let indices: Vec<usize> = (0..assets.len()).collect();
    let retry_indices = upsert_round(store, assets, &indices, result, true).await?;

    if !retry_indices.is_empty() {
        result.retries += 1;
        debug!(
            count = retry_indices.len(),
            "Retrying bulk upsert after stripping broken fields"
        );
        upsert_round(store, assets, &retry_indices, result, false).await?;
    }

    Ok(())
}

/// One bulk round over the given asset indices. Returns the indices worth
/// retrying; when `allow_retry` is false every failure is terminal.
async fn upsert_round(
    store: &dyn AssetStore,
    assets: &mut [AssetBuilder],
    indices: &[usize],
    result: &mut AnalyzeResult,
    allow_retry: bool,
) -> Result<Vec<usize>, StorageError> {
    let batch: Vec<AssetBuilder> = indices.iter().map(|&i| assets[i].clone()).collect();
    let outcomes = store.bulk_upsert(&batch).await?;

    let mut retry = Vec::new();
    for (&index, outcome) in indices.iter().zip(outcomes) {
        match outcome {
            BulkItemOutcome::Created => result.created += 1,
            BulkItemOutcome::Updated => result.updated += 1,
            BulkItemOutcome::Failed(message) => {
                let asset = &mut assets[index];
                let recoverable = allow_retry
                    && broken_field(&message)
                        .map(|field| asset.remove_attr(&field))
                        .unwrap_or(false);
                if recoverable {
                    warn!(asset = asset.id(), "Stripped broken field after rejected upsert: {message}");
                    result.warnings += 1;
                    retry.push(index);
                } else {
                    warn!(asset = asset.id(), "Bulk upsert rejected asset: {message}");
                    result.errors += 1;
                    result
                        .logs
                        .push(format!("{message},{}", asset.path().display()));
                }
            }
        }
    }

    Ok(retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_broken_field_extraction() {
        assert_eq!(
            broken_field("^nope").as_deref(),
            None
        );
        assert_eq!(
            broken_field("MapperParsingException[failed to parse [exif.fnumber]]; nested: x")
                .as_deref(),
            Some("exif.fnumber")
        );
        assert_eq!(
            broken_field(r#"IllegalArgumentException[term in field="media.pages" is broken]"#)
                .as_deref(),
            Some("media.pages")
        );
        assert_eq!(
            broken_field("mapper [keywords.all] of different type, current_type [string]")
                .as_deref(),
            Some("keywords.all")
        );
    }

    /// Fails any asset still carrying one of the configured poison fields
    struct PoisonFieldStore {
        poison: Vec<(String, String)>,
        rounds: Mutex<usize>,
    }

    #[async_trait]
    impl AssetStore for PoisonFieldStore {
        async fn get_by_path(&self, _path: &str) -> Result<Option<crate::asset::Asset>, StorageError> {
            Ok(None)
        }

        async fn bulk_upsert(
            &self,
            assets: &[AssetBuilder],
        ) -> Result<Vec<BulkItemOutcome>, StorageError> {
            *self.rounds.lock() += 1;
            Ok(assets
                .iter()
                .map(|asset| {
                    for (field, message) in &self.poison {
                        if asset.get_attr(field).is_some() {
                            return BulkItemOutcome::Failed(message.clone());
                        }
                    }
                    BulkItemOutcome::Created
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_recoverable_failure_is_stripped_and_retried_once() {
        let store = PoisonFieldStore {
            poison: vec![(
                "exif.fnumber".to_string(),
                "MapperParsingException[failed to parse [exif.fnumber]]; nested: NumberFormatException".to_string(),
            )],
            rounds: Mutex::new(0),
        };

        let mut good = AssetBuilder::new("/data/good.jpg");
        good.set_attr("image.width", json!(640));
        let mut bad = AssetBuilder::new("/data/bad.jpg");
        bad.set_attr("exif.fnumber", json!("f/2.8"));

        let mut assets = vec![good, bad];
        let mut result = AnalyzeResult::default();
        persist_batch(&store, &mut assets, &mut result).await.unwrap();

        assert_eq!(result.created, 2);
        assert_eq!(result.warnings, 1);
        assert_eq!(result.errors, 0);
        assert_eq!(result.retries, 1);
        assert_eq!(*store.rounds.lock(), 2);
        assert!(assets[1].get_attr("exif.fnumber").is_none());
    }

    #[tokio::test]
    async fn test_second_broken_field_is_terminal() {
        // Two independent poison fields on one asset: the retry round is not
        // allowed to strip again, so the item lands as an error
        let store = PoisonFieldStore {
            poison: vec![
                (
                    "exif.fnumber".to_string(),
                    "MapperParsingException[failed to parse [exif.fnumber]];".to_string(),
                ),
                (
                    "exif.shutter".to_string(),
                    "MapperParsingException[failed to parse [exif.shutter]];".to_string(),
                ),
            ],
            rounds: Mutex::new(0),
        };

        let mut bad = AssetBuilder::new("/data/bad.jpg");
        bad.set_attr("exif.fnumber", json!("f/2.8"));
        bad.set_attr("exif.shutter", json!("1/250"));

        let mut assets = vec![bad];
        let mut result = AnalyzeResult::default();
        persist_batch(&store, &mut assets, &mut result).await.unwrap();

        assert_eq!(result.created, 0);
        assert_eq!(result.warnings, 1);
        assert_eq!(result.errors, 1);
        assert_eq!(result.retries, 1);
        assert_eq!(*store.rounds.lock(), 2);
        assert_eq!(result.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_failure_is_an_error_without_retry() {
        let store = PoisonFieldStore {
            poison: vec![(
                "source.path".to_string(),
                "ClusterBlockException[blocked by: [SERVICE_UNAVAILABLE]]".to_string(),
            )],
            rounds: Mutex::new(0),
        };

        let mut assets = vec![AssetBuilder::new("/data/a.jpg")];
        let mut result = AnalyzeResult::default();
        persist_batch(&store, &mut assets, &mut result).await.unwrap();

        assert_eq!(result.errors, 1);
        assert_eq!(result.retries, 0);
        assert_eq!(*store.rounds.lock(), 1);
    }
}
