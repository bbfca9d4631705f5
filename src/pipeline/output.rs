//! Job results and their text/JSON/XML renderings

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::vision::{OrderIssue, OrderedTextBlock};

/// Representation requested for a finished job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Txt,
    Json,
    Xml,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "txt" | "text" => Ok(Self::Txt),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            other => Err(format!("unknown output format '{}' (expected txt, json or xml)", other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Json => "json",
            OutputFormat::Xml => "xml",
        };
        f.write_str(name)
    }
}

/// Result of one OCR job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    /// Recognized blocks in reading order
    pub text_blocks: Vec<OrderedTextBlock>,
    /// Detections that survived post-processing
    pub total_regions: usize,
    /// Regions that decoded to non-empty text
    pub successful_recognitions: usize,
    /// Wall-clock time from job start until output rendering; rendering is
    /// excluded because the JSON output embeds this value
    #[serde(rename = "processingTime")]
    pub processing_time_ms: u64,
    /// Advisory reading-order diagnostics
    #[serde(default)]
    pub issues: Vec<OrderIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml: Option<String>,
}

/// The part of a result that goes into the JSON rendering
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonDocument<'a> {
    text_blocks: &'a [OrderedTextBlock],
    total_regions: usize,
    successful_recognitions: usize,
    processing_time: u64,
}

impl OcrResult {
    pub fn new(
        text_blocks: Vec<OrderedTextBlock>,
        total_regions: usize,
        successful_recognitions: usize,
        processing_time_ms: u64,
        issues: Vec<OrderIssue>,
    ) -> Self {
        Self {
            text_blocks,
            total_regions,
            successful_recognitions,
            processing_time_ms,
            issues,
            txt: None,
            json: None,
            xml: None,
        }
    }

    /// Fill in each requested representation
    pub fn render(&mut self, formats: &[OutputFormat]) -> Result<()> {
        for format in formats {
            match format {
                OutputFormat::Txt => self.txt = Some(render_txt(&self.text_blocks)),
                OutputFormat::Json => self.json = Some(self.render_json()?),
                OutputFormat::Xml => self.xml = Some(render_xml(&self.text_blocks)),
            }
        }
        Ok(())
    }

    /// Rendered output for a format, if it was requested
    pub fn output(&self, format: OutputFormat) -> Option<&str> {
        match format {
            OutputFormat::Txt => self.txt.as_deref(),
            OutputFormat::Json => self.json.as_deref(),
            OutputFormat::Xml => self.xml.as_deref(),
        }
    }

    fn render_json(&self) -> Result<String> {
        let doc = JsonDocument {
            text_blocks: &self.text_blocks,
            total_regions: self.total_regions,
            successful_recognitions: self.successful_recognitions,
            processing_time: self.processing_time_ms,
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }
}

/// Block texts in reading order, one per line
pub fn render_txt(blocks: &[OrderedTextBlock]) -> String {
    blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_xml(blocks: &[OrderedTextBlock]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ocr>\n");
    for b in blocks {
        xml.push_str(&format!(
            "  <textblock order=\"{}\" x=\"{}\" y=\"{}\" width=\"{}\" height=\"{}\" confidence=\"{:.3}\">{}</textblock>\n",
            b.reading_order,
            b.x.round() as i64,
            b.y.round() as i64,
            b.width.round() as i64,
            b.height.round() as i64,
            b.confidence,
            escape_xml(&b.text)
        ));
    }
    xml.push_str("</ocr>\n");
    xml
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
