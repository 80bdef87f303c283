//! CLI output formatting.
//!
//! Output is **file-centric**: every input gets one line naming what it
//! became, with failure detail as indented context. Tool availability and
//! progress are shown as short tables.
//!
//! # Output Format
//!
//! ## Convert
//!
//! ```text
//! Converting 3 files to webp (job 7f3a)
//! 001 a.png → a.webp (12.4 KB, image)
//! 002 photo.CR2 → photo.webp (placeholder, 48.1 KB)
//!     Error: all decoders failed for photo.CR2: dcraw: ...
//! 003 c.svg → c.webp (3.1 KB, resvg)
//! Archive: /tmp/job/converted_images.zip (3 entries, 61.2 KB)
//! ```
//!
//! ## Probe
//!
//! ```text
//! Tools
//!     dcraw         dcraw
//!     libraw        missing
//!     magick        convert
//! ```
//!
//! # Architecture
//!
//! Each view has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::batch::{BatchEvent, JobOutcome};
use crate::progress::ProgressRecord;
use crate::tools::{Tool, ToolAvailability};

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Human-readable byte count.
fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    let b = bytes as f64;
    if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Truncate text to `max` characters, appending `...` if truncated.
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let short: String = text.chars().take(max).collect();
        format!("{}...", short)
    }
}

// ============================================================================
// Convert
// ============================================================================

/// Format a single batch event as display lines.
pub fn format_batch_event(event: &BatchEvent) -> Vec<String> {
    match event {
        BatchEvent::Started {
            job_id,
            total,
            target,
        } => {
            let noun = if *total == 1 { "file" } else { "files" };
            vec![format!("Converting {} {} to {} (job {})", total, noun, target, job_id)]
        }
        BatchEvent::FileFinished {
            index,
            original_name,
            result,
            ..
        } => {
            let head = format!(
                "{} {} \u{2192} {}",
                format_index(index + 1),
                original_name,
                result.output_name
            );
            match &result.error {
                None => {
                    let engine = result.engine.as_deref().unwrap_or("unknown");
                    vec![format!("{} ({}, {})", head, format_size(result.size), engine)]
                }
                Some(error) => vec![
                    format!("{} (placeholder, {})", head, format_size(result.size)),
                    format!("{}Error: {}", indent(1), truncate(error, 200)),
                ],
            }
        }
        BatchEvent::Archived {
            path,
            entries,
            size,
        } => vec![format!(
            "Archive: {} ({} entries, {})",
            path.display(),
            entries,
            format_size(*size)
        )],
    }
}

/// Format the terminal outcome. Failures lead with `Failed:`.
pub fn format_outcome(outcome: &JobOutcome) -> Vec<String> {
    if outcome.success {
        let files = outcome.converted_files.len();
        vec![format!("==> Done: {} files archived", files)]
    } else {
        vec![format!(
            "==> Failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        )]
    }
}

pub fn print_outcome(outcome: &JobOutcome) {
    for line in format_outcome(outcome) {
        println!("{}", line);
    }
}

// ============================================================================
// Probe
// ============================================================================

/// Format the tool availability table.
pub fn format_probe(availability: &ToolAvailability) -> Vec<String> {
    let mut lines = vec!["Tools".to_string()];
    for tool in Tool::ALL {
        let status = availability.program(tool).unwrap_or("missing");
        lines.push(format!("{}{:<14}{}", indent(1), tool.label(), status));
    }
    lines.push(format!(
        "{} of {} tools available",
        availability.available_count(),
        Tool::ALL.len()
    ));
    lines
}

pub fn print_probe(availability: &ToolAvailability) {
    for line in format_probe(availability) {
        println!("{}", line);
    }
}

// ============================================================================
// Progress
// ============================================================================

/// `done/total (percent%) status`, then the job id and timestamp.
pub fn format_progress(record: &ProgressRecord) -> Vec<String> {
    vec![
        format!(
            "{}/{} ({}%) {}",
            record.done,
            record.total,
            record.percent(),
            record.status
        ),
        format!(
            "{}Job: {}, updated {}",
            indent(1),
            record.job_id,
            record.updated_at.to_rfc3339()
        ),
    ]
}

pub fn print_progress(record: &ProgressRecord) {
    for line in format_progress(record) {
        println!("{}", line);
    }
}

// ============================================================================
// Tests
// ============================================================================
