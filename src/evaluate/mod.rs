//! Top-K label accuracy.
//!
//! Every image is labelled with its parent directory name. For each distinct
//! label a query is built from the template and the label counts as a hit when
//! any of the top-K results carries that label.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::clip::TextEncoder;
use crate::index::Retriever;
use crate::scanner::label_for;

#[derive(Debug, Clone, Serialize)]
pub struct LabelResult {
    pub label: String,
    pub query: String,
    pub hit: bool,
    /// File names of the top-K results, best first.
    pub top_k: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub k: usize,
    /// Percentage of labels with a hit.
    pub accuracy: f32,
    pub hits: usize,
    pub labels: usize,
    pub results: Vec<LabelResult>,
}

/// Substitute a label into the query template, underscores read as spaces.
pub fn query_for_label(template: &str, label: &str) -> String {
    template.replace("{label}", &label.replace('_', " "))
}

pub fn evaluate<T: TextEncoder + ?Sized>(
    retriever: &Retriever<'_, T>,
    k: usize,
    query_template: &str,
) -> Result<EvaluationReport> {
    let ground_truth: HashMap<PathBuf, String> = retriever
        .index()
        .paths()
        .iter()
        .filter_map(|path| label_for(path).map(|label| (path.clone(), label)))
        .collect();

    let unique_labels: BTreeSet<&String> = ground_truth.values().collect();
    info!(labels = unique_labels.len(), k, "Evaluating labels");

    let mut results = Vec::with_capacity(unique_labels.len());
    for (i, label) in unique_labels.iter().enumerate() {
        let query = query_for_label(query_template, label);
        let hits = retriever.search(&query, k)?;

        let hit = hits
            .iter()
            .any(|h| ground_truth.get(&h.path) == Some(*label));

        debug!(label = %label, hit, progress = i + 1, "Evaluated label");

        results.push(LabelResult {
            label: label.to_string(),
            query,
            hit,
            top_k: hits
                .iter()
                .map(|h| {
                    h.path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default()
                })
                .collect(),
        });
    }

    let hits = results.iter().filter(|r| r.hit).count();
    let labels = results.len();
    let accuracy = if labels == 0 {
        0.0
    } else {
        hits as f32 / labels as f32 * 100.0
    };

    Ok(EvaluationReport {
        k,
        accuracy,
        hits,
        labels,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ImageIndex;
    use crate::testutil::{write_png, HashEncoder};
    use tempfile::tempdir;

    #[test]
    fn test_query_for_label() {
        assert_eq!(
            query_for_label("a photo of a {label}", "pickup_truck"),
            "a photo of a pickup truck"
        );
    }

    #[test]
    fn test_evaluate_colors() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("red/1.png"), [230, 10, 10]);
        write_png(&dir.path().join("red/2.png"), [200, 30, 30]);
        write_png(&dir.path().join("green/1.png"), [10, 230, 10]);
        write_png(&dir.path().join("blue/1.png"), [10, 10, 230]);
        // Label with no color word: the query cannot single it out
        write_png(&dir.path().join("silver_suv/1.png"), [128, 128, 128]);

        let encoder = HashEncoder::new(6);
        let exts = vec!["png".to_string()];
        let (index, _) = ImageIndex::from_directory(dir.path(), &exts, &encoder, None, 8).unwrap();
        let retriever = Retriever::new(&encoder, index, None, 100.0).unwrap();

        let report = evaluate(&retriever, 1, "a photo of a {label}").unwrap();
        assert_eq!(report.labels, 4);
        let by_label: HashMap<_, _> = report.results.iter().map(|r| (r.label.as_str(), r)).collect();
        assert!(by_label["red"].hit);
        assert!(by_label["green"].hit);
        assert!(by_label["blue"].hit);
        assert_eq!(by_label["silver_suv"].query, "a photo of a silver suv");
        assert_eq!(by_label["red"].top_k.len(), 1);

        // Every label is found once k covers the corpus
        let report = evaluate(&retriever, 5, "a photo of a {label}").unwrap();
        assert_eq!(report.hits, 4);
        assert!((report.accuracy - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_results_are_sorted_by_label() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("b/1.png"), [10, 10, 230]);
        write_png(&dir.path().join("a/1.png"), [230, 10, 10]);

        let encoder = HashEncoder::new(6);
        let exts = vec!["png".to_string()];
        let (index, _) = ImageIndex::from_directory(dir.path(), &exts, &encoder, None, 8).unwrap();
        let retriever = Retriever::new(&encoder, index, None, 100.0).unwrap();

        let report = evaluate(&retriever, 1, "{label}").unwrap();
        let labels: Vec<_> = report.results.iter().map(|r| r.label.clone()).collect();
        assert_eq!(labels, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_index_scores_zero() {
        let encoder = HashEncoder::new(6);
        let index = ImageIndex::new(Vec::new(), Vec::new()).unwrap();
        let retriever = Retriever::new(&encoder, index, None, 100.0).unwrap();

        let report = evaluate(&retriever, 5, "a photo of a {label}").unwrap();
        assert_eq!(report.labels, 0);
        assert_eq!(report.hits, 0);
        assert_eq!(report.accuracy, 0.0);
        assert!(report.results.is_empty());
    }
}
