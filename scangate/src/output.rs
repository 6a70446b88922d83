use std::io::{self, Write};

use crate::summary::RunSummary;

pub trait OutputFormatter {
    fn write_summary(&self, summary: &RunSummary, writer: &mut dyn Write) -> io::Result<()>;
}

pub struct TextOutput;

impl OutputFormatter for TextOutput {
    fn write_summary(&self, summary: &RunSummary, writer: &mut dyn Write) -> io::Result<()> {
        writeln!(writer, "{} ({})", summary.project, summary.vendor)?;
        writeln!(writer, "  verdict: {}", summary.verdict)?;
        writeln!(writer, "  state: {}", summary.state)?;

        if let Some(scan_id) = &summary.scan_id {
            writeln!(writer, "  scan: {scan_id}")?;
        }
        if let Some(status) = summary.last_status {
            writeln!(writer, "  status: {status}")?;
        }
        if let (Some(high), Some(medium)) = (summary.high, summary.medium) {
            if summary.high_threshold >= 0 {
                writeln!(writer, "  high: {high} (threshold {})", summary.high_threshold)?;
            } else {
                writeln!(writer, "  high: {high}")?;
            }
            writeln!(writer, "  medium: {medium}")?;
        }
        if let Some(url) = &summary.result_url {
            writeln!(writer, "  results: {url}")?;
        }
        if !summary.recipients.is_empty() {
            writeln!(writer, "  recipients: {}", summary.recipients.join(", "))?;
        }
        if let Some(error) = &summary.error {
            writeln!(writer, "  error: {error}")?;
        }
        Ok(())
    }
}

pub struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn write_summary(&self, summary: &RunSummary, writer: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *writer, summary)?;
        writeln!(writer)?;
        Ok(())
    }
}

pub fn formatter(json: bool) -> Box<dyn OutputFormatter> {
    if json {
        Box::new(JsonOutput)
    } else {
        Box::new(TextOutput)
    }
}
