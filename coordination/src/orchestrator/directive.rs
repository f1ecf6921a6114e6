//! Tool directives embedded in model output.
//!
//! The expected form is a line `TOOL: <name> <args>`. As a fallback, a line
//! whose first token is a registered tool name is also taken as a directive.
//! The fallback can misfire on prose that happens to start with a tool name
//! (for example "transfer is not possible"); argument validation rejects
//! those before any side effect.

use std::sync::LazyLock;

use regex::Regex;

use crate::tools::ToolKind;

static PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[\s>*`]*TOOL:\s*`?([A-Za-z_]+)`?[ \t]*(.*?)`?\s*$").unwrap());

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDirective {
    /// Name exactly as written. May not be a registered tool.
    pub name: String,
    pub args: String,
    /// Model output with the directive line removed.
    pub remainder: String,
}

impl ToolDirective {
    pub fn kind(&self) -> Option<ToolKind> {
        ToolKind::from_name(&self.name)
    }
}

/// Find the first tool directive in `text`.
pub fn parse_directive(text: &str) -> Option<ToolDirective> {
    if let Some(caps) = PREFIX_RE.captures(text) {
        let whole = caps.get(0)?;
        return Some(ToolDirective {
            name: caps[1].to_string(),
            args: caps[2].trim().to_string(),
            remainder: remove_span(text, whole.start(), whole.end()),
        });
    }

    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        if let Some(first) = parts.next() {
            if ToolKind::from_name(first).is_some() {
                return Some(ToolDirective {
                    name: first.to_string(),
                    args: parts.next().unwrap_or("").trim().to_string(),
                    remainder: remove_span(text, offset, offset + line.len()),
                });
            }
        }
        offset += line.len();
    }
    None
}

fn remove_span(text: &str, start: usize, end: usize) -> String {
    format!("{}{}", &text[..start], &text[end..]).trim().to_string()
}
