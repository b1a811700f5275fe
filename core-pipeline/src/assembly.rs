//! Markdown assembly for recognized pages.
//!
//! Pure functions only: a flushed session's recognized pages become a single
//! Markdown document and a dated path inside the notes directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

const DEFAULT_TITLE: &str = "Handwritten notes";
const MAX_SLUG_LEN: usize = 60;

/// Recognition output for one uploaded page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub name: String,
    pub image_url: String,
    pub text: String,
    pub confidence: Option<f32>,
    /// True when the text is a placeholder for a failed recognition
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoteDocument {
    pub title: String,
    pub originator_id: String,
    pub created_at: DateTime<Utc>,
    pub pages: Vec<PageText>,
    /// Keeps paths distinct when title, originator and second coincide
    pub discriminator: Option<String>,
}

impl NoteDocument {
    /// Builds a document titled after the first page's file name.
    pub fn new(
        originator_id: impl Into<String>,
        created_at: DateTime<Utc>,
        pages: Vec<PageText>,
    ) -> Self {
        let title = pages
            .first()
            .map(|page| title_from_name(&page.name))
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        Self {
            title,
            originator_id: originator_id.into(),
            created_at,
            pages,
            discriminator: None,
        }
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let page_word = if self.pages.len() == 1 { "page" } else { "pages" };

        let _ = writeln!(out, "# {}", self.title);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "_Captured {} from {}, {} {}_",
            self.created_at.format("%Y-%m-%d %H:%M UTC"),
            self.originator_id,
            self.pages.len(),
            page_word
        );

        for (index, page) in self.pages.iter().enumerate() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Page {}: {}", index + 1, page.name);
            let _ = writeln!(out);
            let _ = writeln!(out, "![{}]({})", page.name, page.image_url);
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", page.text.trim_end());
            if let Some(confidence) = page.confidence {
                let _ = writeln!(out);
                let _ = writeln!(out, "_Recognition confidence: {:.0}%_", confidence * 100.0);
            }
        }

        out
    }

    /// `<notes_dir>/<YYYY-MM-DD>/<HHMMSS>-<originator>-<title>[-<discriminator>].md`
    pub fn path(&self, notes_dir: &str) -> String {
        let day = self.created_at.format("%Y-%m-%d").to_string();
        let mut stem = format!(
            "{}-{}-{}",
            self.created_at.format("%H%M%S"),
            slugify(&self.originator_id),
            slugify(&self.title)
        );
        if let Some(discriminator) = self.discriminator.as_deref().map(slugify) {
            stem.push('-');
            stem.push_str(&discriminator);
        }
        let file = format!("{}.md", stem);
        join_remote(&[notes_dir, day.as_str(), file.as_str()])
    }

    pub fn commit_message(&self) -> String {
        format!(
            "Add note \"{}\" ({} {})",
            self.title,
            self.pages.len(),
            if self.pages.len() == 1 { "page" } else { "pages" }
        )
    }
}

/// Placeholder used when a page could not be recognized.
pub fn recognition_placeholder(name: &str) -> String {
    format!("[Recognition unavailable for {}]", name)
}

fn title_from_name(name: &str) -> String {
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    stem.replace(['_', '-'], " ").trim().to_string()
}

/// Lowercase ASCII slug with single dashes between words.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }

    if slug.is_empty() {
        "note".to_string()
    } else {
        slug
    }
}

/// Joins remote path segments with `/`, skipping empty ones.
pub fn join_remote(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
