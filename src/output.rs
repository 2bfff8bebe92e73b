use crate::metrics::Report;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print the final report in the specified format
pub fn print_report(report: &Report, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_plain(report)),
        OutputFormat::Json => print_json(report),
    }
}

fn render_plain(report: &Report) -> String {
    let rows = [
        ("Precision", report.precision),
        ("Recall", report.recall),
        ("Action precision", report.action_precision),
        ("Bad action rate", report.bad_action_rate),
        ("Success rate", report.success_rate),
    ];

    let mut text = String::from("📊 RESULTS\n-----------\n");
    text.push_str(&format!("{:<18} {}\n", "Conversations", report.num_conversations));
    for (label, value) in rows {
        text.push_str(&format!("{:<18} {}\n", label, format_ratio(value)));
    }
    text
}

/// Undefined ratios print as `n/a`
fn format_ratio(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{:.3}", value),
        None => "n/a".to_string(),
    }
}

/// Print the report in JSON format; undefined ratios are `null`
fn print_json(report: &Report) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing report to JSON: {}", e),
    }
}
