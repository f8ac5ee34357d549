use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Guest stdout streams through; the result is printed as a line.
    #[default]
    Text,
    /// Guest stdout is captured and embedded in a single JSON object.
    Json,
}

impl OutputFormat {
    pub fn captures_stdout(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Returned,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub export: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
}

impl Report {
    pub fn returned(export: &str, value: Option<i64>, stdout: Option<String>) -> Self {
        Self {
            export: export.to_string(),
            status: Status::Returned,
            value,
            stdout,
        }
    }

    pub fn interrupted(export: &str, stdout: Option<String>) -> Self {
        Self {
            export: export.to_string(),
            status: Status::Interrupted,
            value: None,
            stdout,
        }
    }

    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => serde_json::to_string(self).context("encoding report"),
            OutputFormat::Text => Ok(match (&self.status, self.value) {
                (Status::Returned, Some(value)) => format!("{} returned {value}", self.export),
                (Status::Returned, None) => format!("{} returned", self.export),
                (Status::Interrupted, _) => format!("{} interrupted", self.export),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_report_shows_value() {
        let report = Report::returned("add", Some(5), None);
        assert_eq!(report.render(OutputFormat::Text).unwrap(), "add returned 5");
    }

    #[test]
    fn text_report_for_interrupt() {
        let report = Report::interrupted("_start", None);
        assert_eq!(
            report.render(OutputFormat::Text).unwrap(),
            "_start interrupted"
        );
    }

    #[test]
    fn json_report_embeds_stdout() {
        let report = Report::returned("add", Some(5), Some("Computing Addition\n".into()));
        let json: serde_json::Value =
            serde_json::from_str(&report.render(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["export"], "add");
        assert_eq!(json["status"], "returned");
        assert_eq!(json["value"], 5);
        assert_eq!(json["stdout"], "Computing Addition\n");
    }

    #[test]
    fn json_report_omits_missing_value() {
        let report = Report::interrupted("_start", Some("Idling...\n".into()));
        let json: serde_json::Value =
            serde_json::from_str(&report.render(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["status"], "interrupted");
        assert!(json.get("value").is_none());
    }

    #[test]
    fn only_json_captures_stdout() {
        assert!(OutputFormat::Json.captures_stdout());
        assert!(!OutputFormat::Text.captures_stdout());
    }
}
