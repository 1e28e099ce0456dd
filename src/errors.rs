//! Diagnostic formatting infrastructure
//!
//! This module provides:
//! - ANSI color support
//! - Levenshtein distance for "did you mean?" suggestions
//! - Source snippet formatting with carets
//! - Batched diagnostics attached to source spans

use crate::ast::{SourceMap, Span};

/// ANSI color codes for terminal output
#[derive(Debug, Clone)]
pub struct Colors {
    pub enabled: bool,
}

impl Colors {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn red(&self) -> &'static str {
        if self.enabled { "\x1b[31m" } else { "" }
    }

    pub fn cyan(&self) -> &'static str {
        if self.enabled { "\x1b[36m" } else { "" }
    }

    pub fn bold(&self) -> &'static str {
        if self.enabled { "\x1b[1m" } else { "" }
    }

    pub fn reset(&self) -> &'static str {
        if self.enabled { "\x1b[0m" } else { "" }
    }
}

impl Default for Colors {
    fn default() -> Self {
        Self::new(false)
    }
}

// ============================================================================
// Batched diagnostics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Lookup,
    Declaration,
    Type,
    Preprocess,
}

impl DiagnosticKind {
    pub fn header(&self) -> &'static str {
        match self {
            DiagnosticKind::Lookup => "LOOKUP ERROR",
            DiagnosticKind::Declaration => "DECLARATION ERROR",
            DiagnosticKind::Type => "TYPE ERROR",
            DiagnosticKind::Preprocess => "PREPROCESS ERROR",
        }
    }
}

/// A typed diagnostic attached to the originating node's span
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Span,
    /// Extra context, e.g. the polymorphic instantiation note
    pub notes: Vec<String>,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            notes: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Render the diagnostic with location, snippet, and suggestions
    pub fn render(&self, source_map: &SourceMap, filename: &str, colors: &Colors) -> String {
        let (line, column) = source_map.position(self.span.start);
        let mut out = format!(
            "{}{}:{}:{}:{} {}error:{} {}\n",
            colors.bold(),
            filename,
            line,
            column,
            colors.reset(),
            colors.red(),
            colors.reset(),
            self.message
        );
        out.push_str(&format_snippet(source_map, &self.span, colors));
        out.push('\n');
        for note in &self.notes {
            out.push_str(&format!("note: {}\n", note));
        }
        out.push_str(&format_suggestions(&self.suggestions, colors));
        out
    }
}

// ============================================================================
// Levenshtein distance for "did you mean?" suggestions
// ============================================================================

/// Compute the Levenshtein edit distance between two strings.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];

    for (i, row) in dp.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        dp[0][j] = j;
    }

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            dp[i][j] = (dp[i - 1][j] + 1)
                .min(dp[i][j - 1] + 1)
                .min(dp[i - 1][j - 1] + cost);
        }
    }

    dp[a.len()][b.len()]
}

/// Find similar names from a list of candidates.
///
/// Returns up to 3 suggestions within the given max edit distance,
/// sorted by distance (closest first).
pub fn find_similar<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    max_distance: usize,
) -> Vec<String> {
    let mut suggestions: Vec<(String, usize)> = candidates
        .into_iter()
        .filter_map(|c| {
            let dist = levenshtein_distance(name, c);
            if dist > 0 && dist <= max_distance {
                Some((c.to_string(), dist))
            } else {
                None
            }
        })
        .collect();

    suggestions.sort_by(|(a, da), (b, db)| da.cmp(db).then_with(|| a.cmp(b)));
    suggestions.into_iter().map(|(s, _)| s).take(3).collect()
}

// ============================================================================
// Source snippet formatting
// ============================================================================

/// Format a source code snippet with line number and caret underline.
pub fn format_snippet(source_map: &SourceMap, span: &Span, colors: &Colors) -> String {
    let (line, column) = source_map.position(span.start);
    let (end_line, end_column) = source_map.position(span.end);
    let line_text = source_map.line(line).unwrap_or("");

    let gutter = format!("{}", line);
    let mut out = format!(
        "{}{} |{} {}\n",
        colors.cyan(),
        gutter,
        colors.reset(),
        line_text
    );

    let padding = " ".repeat(gutter.len() + 3 + column - 1);
    let underline = if line == end_line && end_column > column {
        "^".repeat(end_column - column)
    } else {
        "^".to_string()
    };
    out.push_str(&format!(
        "{}{}{}{}",
        padding,
        colors.red(),
        underline,
        colors.reset()
    ));
    out
}

/// Format the "did you mean?" hint.
pub fn format_suggestions(suggestions: &[String], colors: &Colors) -> String {
    if suggestions.is_empty() {
        return String::new();
    }

    if suggestions.len() == 1 {
        format!(
            "did you mean {}{}{}?\n",
            colors.bold(),
            suggestions[0],
            colors.reset()
        )
    } else {
        let formatted: Vec<String> = suggestions
            .iter()
            .map(|s| format!("{}{}{}", colors.bold(), s, colors.reset()))
            .collect();
        format!("did you mean one of: {}?\n", formatted.join(", "))
    }
}
