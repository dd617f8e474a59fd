//! Output formatters for runs, monitor reports and invocations
//!
//! Provides JSON, Table, CSV and summary output formats.

use serde::Serialize;

use crate::models::{RunStatus, RunStatusView, UnitOutcome};
use crate::monitor::MonitorReport;
use crate::router::InvocationResult;
use crate::state::export_results_csv;

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if self.colorize {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn json<T: Serialize>(&self, value: &T) -> String {
        match self.format {
            OutputFormat::JsonPretty => serde_json::to_string_pretty(value).unwrap_or_default(),
            _ => serde_json::to_string(value).unwrap_or_default(),
        }
    }

    /// Format a run status view
    pub fn format_run(&self, view: &RunStatusView) -> String {
        match self.format {
            OutputFormat::Table => self.format_run_table(view),
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(view),
            OutputFormat::Csv => self.format_run_csv(view),
            OutputFormat::Summary => format!(
                "{} {} {} ({}/{} passed, {:.1}%)",
                view.status.symbol(),
                view.run_id,
                view.status,
                view.counts.passed,
                view.counts.total,
                view.pass_rate()
            ),
        }
    }

    fn format_run_table(&self, view: &RunStatusView) -> String {
        let status_color = match view.status {
            RunStatus::Completed => "32",
            RunStatus::PartiallyFailed => "33",
            RunStatus::Failed => "31",
            RunStatus::Pending | RunStatus::InProgress => "36",
        };
        let mut output = String::new();
        output.push_str(&format!(
            "Run {} - {}\n",
            view.run_id,
            self.paint(&format!("{} {}", view.status.symbol(), view.status), status_color)
        ));
        output.push_str(&"━".repeat(60));
        output.push('\n');

        for result in &view.results {
            let mark = match &result.outcome {
                UnitOutcome::Success { .. } => self.paint("✓ PASS", "32"),
                UnitOutcome::Failure { .. } => self.paint("✗ FAIL", "31"),
            };
            let detail = match &result.outcome {
                UnitOutcome::Success { .. } => String::new(),
                UnitOutcome::Failure { error, kind } => format!(" [{kind}] {error}"),
            };
            output.push_str(&format!(
                "  {mark}  {:<24} {:>6}ms  x{}{detail}\n",
                result.test_id, result.duration_ms, result.attempts
            ));
        }

        output.push_str(&"━".repeat(60));
        output.push('\n');
        let failed = if view.counts.failed > 0 {
            self.paint(&view.counts.failed.to_string(), "31")
        } else {
            view.counts.failed.to_string()
        };
        output.push_str(&format!(
            "Total: {} | Pass: {} | Fail: {}\n",
            view.counts.total,
            self.paint(&view.counts.passed.to_string(), "32"),
            failed
        ));
        if let Some(duration) = view.duration_ms() {
            output.push_str(&format!("Duration: {duration}ms\n"));
        }
        if let Some(error) = &view.error {
            output.push_str(&format!("Error: {error}\n"));
        }
        output.push_str(&format!("Pass Rate: {:.1}%", view.pass_rate()));
        output
    }

    fn format_run_csv(&self, view: &RunStatusView) -> String {
        let mut buf = Vec::new();
        match export_results_csv(&view.run_id, &view.results, &mut buf) {
            Ok(()) => String::from_utf8_lossy(&buf).trim_end().to_string(),
            Err(err) => format!("csv export failed: {err}"),
        }
    }

    /// Format any monitor report
    pub fn format_report<R: MonitorReport>(&self, report: &R) -> String {
        match self.format {
            OutputFormat::Table => report.to_string(),
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(report),
            OutputFormat::Csv => rows_to_csv(&report.csv_header(), &report.csv_rows()),
            OutputFormat::Summary => report.summary(),
        }
    }

    /// Format an invocation outcome
    pub fn format_invocation(&self, result: &InvocationResult) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(result),
            OutputFormat::Csv => {
                let status = if result.is_success() { "success" } else { "error" };
                let output = result
                    .output
                    .as_ref()
                    .map(|o| o.to_string())
                    .unwrap_or_default();
                let (code, message) = result
                    .error
                    .as_ref()
                    .map(|e| (e.code.clone(), e.message.clone()))
                    .unwrap_or_default();
                rows_to_csv(
                    &["status", "duration_ms", "output", "error_code", "error_message"],
                    &[vec![
                        status.to_string(),
                        result.duration_ms.to_string(),
                        output,
                        code,
                        message,
                    ]],
                )
            }
            OutputFormat::Table | OutputFormat::Summary => {
                let color = if result.is_success() { "32" } else { "31" };
                self.paint(&result.to_string(), color)
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn rows_to_csv(header: &[&str], rows: &[Vec<String>]) -> String {
    fn write(header: &[&str], rows: &[Vec<String>]) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(row)?;
        }
        writer.into_inner().map_err(|e| anyhow::anyhow!("{e}"))
    }

    match write(header, rows) {
        Ok(buf) => String::from_utf8_lossy(&buf).trim_end().to_string(),
        Err(err) => format!("csv export failed: {err}"),
    }
}
