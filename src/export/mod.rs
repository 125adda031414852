use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::evaluate::EvaluationReport;
use crate::index::SearchHit;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Html,
}

impl ExportFormat {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "html" | "htm" => Ok(ExportFormat::Html),
            other => Err(anyhow!("Unknown export format: {}", other)),
        }
    }

    /// Pick the format from an output file's extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("Cannot infer format of {}", path.display()))?;
        Self::parse(&ext)
    }
}

/// Search result row for export
#[derive(Debug, Serialize)]
pub struct ExportedHit {
    pub rank: usize,
    pub path: String,
    pub similarity: f32,
    pub probability: f32,
}

pub fn export_search(
    query: &str,
    hits: &[SearchHit],
    output_path: &Path,
    format: ExportFormat,
) -> Result<usize> {
    let rows: Vec<ExportedHit> = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| ExportedHit {
            rank: i + 1,
            path: hit.path.to_string_lossy().to_string(),
            similarity: hit.similarity,
            probability: hit.probability,
        })
        .collect();

    match format {
        ExportFormat::Json => {
            #[derive(Serialize)]
            struct SearchExport<'a> {
                query: &'a str,
                results: &'a [ExportedHit],
            }
            let file = File::create(output_path)?;
            serde_json::to_writer_pretty(file, &SearchExport { query, results: &rows })?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(output_path)?;
            for row in &rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        ExportFormat::Html => export_search_html(query, &rows, output_path)?,
    }

    Ok(rows.len())
}

/// Flattened evaluation row for CSV
#[derive(Debug, Serialize)]
struct EvaluationRow<'a> {
    label: &'a str,
    query: &'a str,
    hit: bool,
    top_k: String,
}

pub fn export_evaluation(
    report: &EvaluationReport,
    output_path: &Path,
    format: ExportFormat,
) -> Result<usize> {
    match format {
        ExportFormat::Json => {
            let file = File::create(output_path)?;
            serde_json::to_writer_pretty(file, report)?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(output_path)?;
            for result in &report.results {
                writer.serialize(EvaluationRow {
                    label: &result.label,
                    query: &result.query,
                    hit: result.hit,
                    top_k: result.top_k.join(";"),
                })?;
            }
            writer.flush()?;
        }
        ExportFormat::Html => export_evaluation_html(report, output_path)?,
    }

    Ok(report.results.len())
}

const HTML_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, sans-serif; margin: 20px; background: #f5f5f5; }
        h1 { color: #333; }
        .grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(260px, 1fr)); gap: 16px; }
        .card { background: white; border-radius: 8px; padding: 12px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }
        .card img { width: 100%; height: 180px; object-fit: cover; border-radius: 4px; }
        .score { color: #666; font-size: 0.9em; }
        table { border-collapse: collapse; background: white; }
        td, th { padding: 6px 10px; border-bottom: 1px solid #eee; text-align: left; }
        .hit { color: #2a7a2a; }
        .miss { color: #b03030; }
    </style>
"#;

fn export_search_html(query: &str, rows: &[ExportedHit], output_path: &Path) -> Result<()> {
    let mut html = String::from(HTML_HEAD);
    html.push_str(&format!(
        "    <title>Results for '{}'</title>\n</head>\n<body>\n    <h1>Results for '{}'</h1>\n    <div class=\"grid\">\n",
        html_escape(query),
        html_escape(query)
    ));

    for row in rows {
        html.push_str(&format!(
            r#"        <div class="card">
            <img src="file://{}" alt="{}">
            <div class="score">#{} &middot; match {:.2}% &middot; cosine {:.3}</div>
        </div>
"#,
            html_escape(&row.path),
            html_escape(&row.path),
            row.rank,
            row.probability * 100.0,
            row.similarity
        ));
    }

    html.push_str("    </div>\n</body>\n</html>\n");

    let mut file = File::create(output_path)?;
    file.write_all(html.as_bytes())?;
    Ok(())
}

fn export_evaluation_html(report: &EvaluationReport, output_path: &Path) -> Result<()> {
    let mut html = String::from(HTML_HEAD);
    html.push_str(&format!(
        "    <title>Top-{k} accuracy</title>\n</head>\n<body>\n    <h1>Top-{k} accuracy: {:.2}%</h1>\n    <p>{} of {} labels found.</p>\n",
        report.accuracy,
        report.hits,
        report.labels,
        k = report.k
    ));

    html.push_str("    <table>\n        <tr><th>Label</th><th>Query</th><th>Hit</th><th>Top results</th></tr>\n");
    for result in &report.results {
        let (class, mark) = if result.hit { ("hit", "yes") } else { ("miss", "no") };
        html.push_str(&format!(
            "        <tr><td>{}</td><td>{}</td><td class=\"{}\">{}</td><td>{}</td></tr>\n",
            html_escape(&result.label),
            html_escape(&result.query),
            class,
            mark,
            html_escape(&result.top_k.join(", "))
        ));
    }
    html.push_str("    </table>\n</body>\n</html>\n");

    let mut file = File::create(output_path)?;
    file.write_all(html.as_bytes())?;
    Ok(())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::LabelResult;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn report() -> EvaluationReport {
        EvaluationReport {
            k: 2,
            accuracy: 50.0,
            hits: 1,
            labels: 2,
            results: vec![
                LabelResult {
                    label: "suv".into(),
                    query: "a photo of a suv".into(),
                    hit: true,
                    top_k: vec!["1.jpg".into(), "2.jpg".into()],
                },
                LabelResult {
                    label: "sedan".into(),
                    query: "a photo of a sedan".into(),
                    hit: false,
                    top_k: vec!["3.jpg".into()],
                },
            ],
        }
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ExportFormat::from_path(Path::new("r.CSV")).unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::from_path(Path::new("r.htm")).unwrap(), ExportFormat::Html);
        assert!(ExportFormat::from_path(Path::new("report")).is_err());
        assert!(ExportFormat::parse("xml").is_err());
    }

    #[test]
    fn test_evaluation_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eval.csv");
        assert_eq!(export_evaluation(&report(), &path, ExportFormat::Csv).unwrap(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("label,query,hit,top_k"));
        assert_eq!(lines.next(), Some("suv,a photo of a suv,true,1.jpg;2.jpg"));
    }

    #[test]
    fn test_evaluation_json_and_html() {
        let dir = tempdir().unwrap();
        let json = dir.path().join("eval.json");
        export_evaluation(&report(), &json, ExportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(value["hits"], 1);
        assert_eq!(value["results"][1]["label"], "sedan");

        let html = dir.path().join("eval.html");
        export_evaluation(&report(), &html, ExportFormat::Html).unwrap();
        let content = std::fs::read_to_string(&html).unwrap();
        assert!(content.contains("Top-2 accuracy: 50.00%"));
    }

    #[test]
    fn test_search_export_escapes_html() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("search.html");
        let hits = vec![SearchHit {
            path: PathBuf::from("/img/<odd>.jpg"),
            similarity: 0.31,
            probability: 0.9,
        }];

        assert_eq!(export_search("white & black", &hits, &path, ExportFormat::Html).unwrap(), 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("white &amp; black"));
        assert!(content.contains("&lt;odd&gt;"));
        assert!(content.contains("match 90.00%"));
    }
}
