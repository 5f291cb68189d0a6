//! HTML parser for author publication lists
//!
//! Each source has its own selector set: a container selector matching one
//! publication entry, and a title selector applied inside it. The year is
//! the first 1900-2099 four-digit number in the entry's text.

use crate::storage::{Publication, Source};
use crate::FetchError;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use tracing::debug;

/// CSS selectors locating publications on one source's author page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorSet {
    pub container: &'static str,
    pub title: &'static str,
}

pub const GOOGLE_SCHOLAR_SELECTORS: SelectorSet = SelectorSet {
    container: ".gs_r.gs_or.gs_scl",
    title: ".gs_rt a",
};

pub const DBLP_SELECTORS: SelectorSet = SelectorSet {
    container: ".entry.article",
    title: ".title",
};

const YEAR_PATTERN: &str = r"\b(19|20)\d{2}\b";

static YEAR_REGEX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Returns the selector set for a source
pub fn selectors_for(source: Source) -> SelectorSet {
    match source {
        Source::Google => GOOGLE_SCHOLAR_SELECTORS,
        Source::Dblp => DBLP_SELECTORS,
    }
}

/// Extracts the publications listed on an author page
///
/// Entries without a title or a year are skipped. An empty body, or a
/// selector that does not compile, is a `FetchError::Parse`.
///
/// # Example
///
/// ```
/// use pubcrawl::crawler::parse_publications;
/// use pubcrawl::storage::Source;
///
/// let html = r#"<li class="entry article"><span class="title">Paper.</span> 2021</li>"#;
/// let publications = parse_publications(html, Source::Dblp).unwrap();
/// assert_eq!(publications[0].year, Some(2021));
/// ```
pub fn parse_publications(html: &str, source: Source) -> Result<Vec<Publication>, FetchError> {
    parse_with(html, source, selectors_for(source))
}

/// Extracts publications using an explicit selector set
pub fn parse_with(
    html: &str,
    source: Source,
    selectors: SelectorSet,
) -> Result<Vec<Publication>, FetchError> {
    if html.trim().is_empty() {
        return Err(FetchError::Parse("empty page body".to_string()));
    }

    let container = compile(selectors.container)?;
    let title = compile(selectors.title)?;
    let year_regex = year_regex()?;

    let document = Html::parse_document(html);
    let mut publications = Vec::new();

    for entry in document.select(&container) {
        let Some(entry_title) = extract_title(&entry, &title) else {
            debug!(%source, "Skipping entry without a title");
            continue;
        };

        let Some(year) = extract_year(&entry, year_regex) else {
            debug!(%source, title = %entry_title, "Skipping entry without a year");
            continue;
        };

        publications.push(Publication {
            title: entry_title,
            year: Some(year),
            source,
        });
    }

    Ok(publications)
}

fn compile(selector: &str) -> Result<Selector, FetchError> {
    Selector::parse(selector)
        .map_err(|e| FetchError::Parse(format!("invalid selector '{selector}': {e}")))
}

fn year_regex() -> Result<&'static Regex, FetchError> {
    YEAR_REGEX
        .get_or_init(|| Regex::new(YEAR_PATTERN))
        .as_ref()
        .map_err(|e| FetchError::Parse(e.to_string()))
}

/// Collapses the text of the first title match into a single line
fn extract_title(entry: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    entry
        .select(selector)
        .next()
        .map(|element| normalize_whitespace(&element.text().collect::<String>()))
        .filter(|title| !title.is_empty())
}

fn extract_year(entry: &ElementRef<'_>, regex: &Regex) -> Option<i32> {
    let text = entry.text().collect::<Vec<_>>().join(" ");
    regex
        .find(&text)
        .and_then(|year| year.as_str().parse().ok())
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
