//! URL templates parameterised by year and month.
//!
//! Supported placeholders: `{year}`, `{month}` (no padding) and
//! `{month:02d}` / `{month:02}` (zero-padded to two digits). Templates are
//! parsed once, so a typo surfaces as a configuration error before any
//! request is made.

use std::{fmt, str::FromStr};

use snafu::prelude::*;

use crate::period::Period;

/// Errors raised while parsing a URL template.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder name was not recognised.
    #[snafu(display("unknown placeholder '{{{name}}}' in URL template '{template}'"))]
    UnknownPlaceholder {
        /// The placeholder body.
        name: String,
        /// The full template.
        template: String,
    },

    /// An opening brace had no matching closing brace, or a stray closing
    /// brace appeared.
    #[snafu(display("unbalanced braces in URL template '{template}'"))]
    Unbalanced {
        /// The full template.
        template: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Year,
    Month,
    MonthPadded,
}

/// A parsed URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    /// Parse a template string.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    ensure!(closed, UnbalancedSnafu { template });

                    let segment = match name.trim() {
                        "year" => Segment::Year,
                        "month" => Segment::Month,
                        "month:02d" | "month:02" => Segment::MonthPadded,
                        _ => return UnknownPlaceholderSnafu { name, template }.fail(),
                    };

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' => return UnbalancedSnafu { template }.fail(),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    /// Substitute `period` into the template.
    pub fn render(&self, period: Period) -> String {
        let mut out = String::with_capacity(self.raw.len() + 4);
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Year => out.push_str(&period.year().to_string()),
                Segment::Month => out.push_str(&period.month().to_string()),
                Segment::MonthPadded => out.push_str(&format!("{:02}", period.month())),
            }
        }
        out
    }

    /// The original template text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for UrlTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UrlTemplate::parse(s)
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
