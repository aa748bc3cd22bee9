//! Deliverable extraction.
//!
//! Deterministic parser that turns an executor's free-form output into
//! reviewable artifact files under
//! `<output_root>/for_review/<YYYYMMDD>/<task_id>_<inferred_type>/`.
//!
//! Multi-file code output is recognised by three filename-section
//! markers, tried in order:
//!
//! ```text
//! --- filename.ext ---
//! // ===== filename.ext =====
//! /* === filename.ext === */
//! ```
//!
//! Each detected section is written verbatim (code-fence markers
//! stripped) together with a `README.md` listing the files. Output with
//! no recognisable sections is saved as a single file named after the
//! inferred type. Every extraction also produces a human-facing
//! `summary.md`, a `metadata.json` with `review_status = "pending"`, and
//! a notification file advertising the new deliverable.
//!
//! All writes go through a temp-file-and-rename bracket so an error path
//! never leaves a partial artifact behind.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use atelier_store::TaskOutcome;

use crate::error::WorkerResult;

// ---------------------------------------------------------------------------
// Keyword sets for type inference
// ---------------------------------------------------------------------------

static CODE_KEYWORDS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build([
            "def ", "class ", "function", "```", "<html", "<div", "import ", "fn ",
            "write code", "implement",
        ])
        .expect("static pattern set")
});

static ANALYSIS_KEYWORDS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(["analysis", "analyze", "report", "statistics", "## ", "### "])
        .expect("static pattern set")
});

static TRANSLATION_KEYWORDS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(["translate", "translation"])
        .expect("static pattern set")
});

static ERROR_KEYWORDS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(["error", "exception", "failed", "traceback"])
        .expect("static pattern set")
});

// ---------------------------------------------------------------------------
// Section markers
// ---------------------------------------------------------------------------

static DASH_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"---\s*([^\s-]+\.\w+)\s*---").expect("static regex"));

static SLASH_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//\s*=+\s*([^\s=]+\.\w+)\s*=+").expect("static regex"));

static BLOCK_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\*\s*=+\s*([^\s=]+\.\w+)\s*=+\s*\*/").expect("static regex"));

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```\w*\n?").expect("static regex"));

static FENCE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n?```$").expect("static regex"));

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// What one extraction produced.
#[derive(Debug, Clone)]
pub struct DeliverableReport {
    /// Directory the artifacts were written into.
    pub task_dir: PathBuf,
    /// Artifact file names (excluding summary/metadata side outputs).
    pub files: Vec<String>,
    /// Inferred deliverable type.
    pub inferred_type: &'static str,
    /// Heuristic quality score in `[0, 100]`. Review aid only; never
    /// influences scheduling.
    pub quality_score: u32,
}

/// Parses executor output into on-disk artifacts for review.
#[derive(Debug, Clone)]
pub struct DeliverableExtractor {
    output_root: PathBuf,
}

impl DeliverableExtractor {
    /// Create an extractor writing under `output_root`.
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    /// Extract artifacts for a finished task.
    ///
    /// Returns `None` when the outcome has no output to persist.
    pub fn extract(
        &self,
        task_id: &str,
        prompt: &str,
        outcome: &TaskOutcome,
        priority: i64,
    ) -> WorkerResult<Option<DeliverableReport>> {
        if outcome.output.is_empty() {
            debug!(task_id, "no output content, skipping deliverable save");
            return Ok(None);
        }

        let now = Utc::now();
        let timestamp = now.format("%Y%m%d_%H%M%S").to_string();
        let inferred_type = infer_type(prompt, &outcome.output);

        let review_dir = self.output_root.join("for_review");
        let task_dir = review_dir
            .join(now.format("%Y%m%d").to_string())
            .join(format!("{task_id}_{inferred_type}"));
        std::fs::create_dir_all(&task_dir)?;

        // Main artifacts: split sections, or one file named by type.
        let sections = split_multi_file(&outcome.output);
        let mut files = Vec::new();
        if sections.is_empty() {
            let name = single_file_name(task_id, inferred_type);
            write_atomic(&task_dir.join(&name), &outcome.output)?;
            files.push(name);
        } else {
            for (name, content) in &sections {
                write_atomic(&task_dir.join(name), content)?;
                files.push(name.clone());
            }
            let readme = readme_for(task_id, &timestamp, outcome.success, &files);
            write_atomic(&task_dir.join("README.md"), &readme)?;
            files.push("README.md".to_string());
        }

        let quality_score = assess_quality(&outcome.output, inferred_type);

        // Review sheet.
        let summary = review_summary(
            task_id,
            prompt,
            outcome,
            priority,
            &timestamp,
            inferred_type,
            quality_score,
        );
        write_atomic(&task_dir.join(format!("{task_id}_summary.md")), &summary)?;

        // Machine-readable metadata.
        let metadata = json!({
            "task_id": task_id,
            "timestamp": timestamp,
            "task_type": inferred_type,
            "priority": priority,
            "success": outcome.success,
            "error": outcome.error,
            "content_summary": truncate(prompt, 200),
            "result_length": outcome.output.len(),
            "files_generated": files,
            "quality_score": quality_score,
            "review_status": "pending",
            "created_at": now.to_rfc3339(),
        });
        write_atomic(
            &task_dir.join(format!("{task_id}_metadata.json")),
            &serde_json::to_string_pretty(&metadata)?,
        )?;

        // Advertise the new deliverable next to the review queue.
        let notification = format!(
            "New deliverable ready for review\n\n\
             Task ID:  {task_id}\n\
             Type:     {inferred_type}\n\
             Priority: {priority}\n\
             Status:   {}\n\
             Location: {}\n",
            if outcome.success { "success" } else { "failed" },
            task_dir.display(),
        );
        write_atomic(
            &review_dir.join(format!("new_deliverable_{timestamp}.txt")),
            &notification,
        )?;

        info!(
            task_id,
            inferred_type,
            file_count = files.len(),
            quality_score,
            "deliverable saved"
        );

        Ok(Some(DeliverableReport {
            task_dir,
            files,
            inferred_type,
            quality_score,
        }))
    }
}

// ---------------------------------------------------------------------------
// Type inference
// ---------------------------------------------------------------------------

/// Infer the deliverable type from prompt and output. First match wins.
fn infer_type(prompt: &str, output: &str) -> &'static str {
    if CODE_KEYWORDS.is_match(prompt) || CODE_KEYWORDS.is_match(output) {
        return "code_generation";
    }
    if ANALYSIS_KEYWORDS.is_match(prompt) || ANALYSIS_KEYWORDS.is_match(output) {
        return "data_analysis";
    }
    if TRANSLATION_KEYWORDS.is_match(prompt) || TRANSLATION_KEYWORDS.is_match(output) {
        return "translation";
    }
    if ERROR_KEYWORDS.is_match(prompt) || ERROR_KEYWORDS.is_match(output) {
        return "error_handling";
    }
    "text_generation"
}

fn single_file_name(task_id: &str, inferred_type: &str) -> String {
    match inferred_type {
        "code_generation" => format!("{task_id}_result.py"),
        "data_analysis" => format!("{task_id}_analysis.md"),
        "translation" => format!("{task_id}_translation.txt"),
        "error_handling" => format!("{task_id}_error_log.txt"),
        _ => format!("{task_id}_deliverable.txt"),
    }
}

// ---------------------------------------------------------------------------
// Multi-file splitting
// ---------------------------------------------------------------------------

/// Try the three section patterns in order; the first that yields any
/// sections wins.
fn split_multi_file(output: &str) -> Vec<(String, String)> {
    for pattern in [&*DASH_SECTION, &*SLASH_SECTION, &*BLOCK_SECTION] {
        let sections = split_sections(pattern, output);
        if !sections.is_empty() {
            return sections;
        }
    }
    Vec::new()
}

/// Split `text` on a filename-marker regex: each capture names a file
/// whose content runs to the next marker (or the end of the text).
fn split_sections(pattern: &Regex, text: &str) -> Vec<(String, String)> {
    let markers: Vec<(usize, usize, String)> = pattern
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?.as_str();
            // Keep only the basename so a malicious marker cannot write
            // outside the task directory.
            let safe = Path::new(name).file_name()?.to_string_lossy().to_string();
            if safe != name {
                warn!(marker = name, "section filename carried a path, using basename");
            }
            Some((whole.start(), whole.end(), safe))
        })
        .collect();

    let mut sections = Vec::with_capacity(markers.len());
    for (i, (_, content_start, name)) in markers.iter().enumerate() {
        let content_end = markers
            .get(i + 1)
            .map(|next| next.0)
            .unwrap_or(text.len());
        let content = strip_fences(text[*content_start..content_end].trim());
        sections.push((name.clone(), content));
    }
    sections
}

/// Remove a leading and trailing code-fence marker, if present.
fn strip_fences(content: &str) -> String {
    let without_open = FENCE_OPEN.replace(content, "");
    FENCE_CLOSE.replace(&without_open, "").to_string()
}

// ---------------------------------------------------------------------------
// Review side outputs
// ---------------------------------------------------------------------------

fn readme_for(task_id: &str, timestamp: &str, success: bool, files: &[String]) -> String {
    let listing: String = files.iter().map(|f| format!("- {f}\n")).collect();
    format!(
        "# Generated files\n\n\
         Task ID: {task_id}\n\
         Generated: {timestamp}\n\
         Status: {}\n\n\
         ## Files\n{listing}\n\
         ## Usage\n\
         Keep all files in the same directory; open the HTML entry point \
         in a browser if one is present.\n",
        if success { "success" } else { "failed" },
    )
}

fn review_summary(
    task_id: &str,
    prompt: &str,
    outcome: &TaskOutcome,
    priority: i64,
    timestamp: &str,
    inferred_type: &str,
    quality_score: u32,
) -> String {
    format!(
        "# Deliverable review sheet\n\n\
         ## Task\n\
         - **ID**: `{task_id}`\n\
         - **Type**: {inferred_type}\n\
         - **Priority**: {priority}/10\n\
         - **Finished**: {timestamp}\n\
         - **Result**: {}\n\n\
         ## Request\n```\n{}\n```\n\n\
         ## Output overview\n\
         - **Length**: {} characters\n\
         - **Quality score**: {quality_score}/100\n\n\
         ## Reviewer checklist\n\
         - [ ] Matches the request\n\
         - [ ] Meets quality expectations\n\
         - [ ] Safe to hand over\n\n\
         ## Error detail\n{}\n",
        if outcome.success { "success" } else { "failed" },
        truncate(prompt, 300),
        outcome.output.len(),
        outcome.error.as_deref().unwrap_or("none"),
    )
}

/// Score the output between 0 and 100. Length and light structure checks
/// only — this feeds the review sheet, nothing else.
fn assess_quality(output: &str, inferred_type: &str) -> u32 {
    let mut score: u32 = 70;

    if output.len() > 50 {
        score += 10;
    }
    if output.len() > 200 {
        score += 5;
    }

    match inferred_type {
        "code_generation" => {
            if output.contains("def ") || output.contains("fn ") || output.contains("class ") {
                score += 10;
            }
            if output.contains("\"\"\"") || output.contains("///") {
                score += 5;
            }
        }
        "data_analysis" => {
            if output.contains("##") {
                score += 10;
            }
            if output.contains("conclusion") || output.contains("recommend") {
                score += 5;
            }
        }
        _ => {}
    }

    score.min(100)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Write through a temp file in the same directory, renaming into place.
/// The temp file is cleaned up on every exit path (drop deletes it if
/// the persist never happened).
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
