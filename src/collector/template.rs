//! URL templates
//!
//! Placeholders look like `{{ .Params.name }}`, `{{ .Input.number }}` or
//! `{{ .Pager.Page }}`, optionally piped through `urlencode`:
//!
//! ```text
//! repos/{{ .Params.name }}/pulls/{{ .Input.number }}/commits
//! search?jql={{ .Params.jql | urlencode }}&startAt={{ .Pager.Skip }}
//! ```

use super::params::RequestData;
use crate::{CollectError, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Root {
    Params,
    Input,
    Pager,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field {
        root: Root,
        path: Vec<String>,
        urlencode: bool,
    },
}

/// Parsed URL template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| {
                CollectError::Template(format!("unclosed placeholder in '{}'", source))
            })?;
            segments.push(parse_placeholder(after[..close].trim(), source)?);
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the template references the input row
    pub fn uses_input(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Field { root: Root::Input, .. }))
    }

    pub fn render(&self, data: &RequestData) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field {
                    root,
                    path,
                    urlencode,
                } => {
                    let value = self.lookup(root, path, data)?;
                    if *urlencode {
                        out.push_str(&urlencoding::encode(&value));
                    } else {
                        out.push_str(&value);
                    }
                }
            }
        }
        Ok(out)
    }

    fn lookup(&self, root: &Root, path: &[String], data: &RequestData) -> Result<String> {
        let base = match root {
            Root::Pager => {
                let n = match path.first().map(String::as_str) {
                    Some("Page") => data.pager.page,
                    Some("Skip") => data.pager.skip,
                    _ => data.pager.size,
                };
                return Ok(n.to_string());
            }
            Root::Params => &data.params,
            Root::Input => data.input.as_ref().ok_or_else(|| {
                CollectError::Template(format!("'{}' needs an input row", self.source))
            })?,
        };

        let mut current = base;
        for key in path {
            current = match current {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| {
                CollectError::Template(format!("missing field '{}' for '{}'", key, self.source))
            })?;
        }

        match current {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(CollectError::Template(format!(
                "cannot render {} into '{}'",
                other, self.source
            ))),
        }
    }
}

fn parse_placeholder(expr: &str, source: &str) -> Result<Segment> {
    let mut parts = expr.split('|').map(str::trim);
    let field = parts.next().unwrap_or_default();

    let mut urlencode = false;
    for filter in parts {
        match filter {
            "urlencode" => urlencode = true,
            other => {
                return Err(CollectError::Template(format!(
                    "unknown filter '{}' in '{}'",
                    other, source
                )))
            }
        }
    }

    let field = field.strip_prefix('.').ok_or_else(|| {
        CollectError::Template(format!("placeholder '{}' must start with '.'", expr))
    })?;
    let mut path = field.split('.');
    let root = match path.next() {
        Some("Params") => Root::Params,
        Some("Input") => Root::Input,
        Some("Pager") => Root::Pager,
        _ => {
            return Err(CollectError::Template(format!(
                "unknown root in '{}' (expected .Params, .Input or .Pager)",
                expr
            )))
        }
    };
    let path: Vec<String> = path.map(str::to_string).collect();

    if root == Root::Pager && !matches!(path.as_slice(), [p] if p == "Page" || p == "Skip" || p == "Size")
    {
        return Err(CollectError::Template(format!(
            "'{}' must be .Pager.Page, .Pager.Skip or .Pager.Size",
            expr
        )));
    }

    Ok(Segment::Field {
        root,
        path,
        urlencode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::params::Pager;
    use serde_json::json;

    fn data(input: Option<Value>) -> RequestData {
        RequestData {
            pager: Pager::new(3, 50),
            cursor: None,
            params: json!({ "name": "acme/widgets", "jql": "project = X AND type = Bug" }),
            input,
            since: None,
        }
    }

    #[test]
    fn test_render_params_and_input() {
        let template =
            UrlTemplate::parse("repos/{{ .Params.name }}/pulls/{{ .Input.number }}/commits")
                .unwrap();
        assert!(template.uses_input());
        let url = template.render(&data(Some(json!({ "number": 17 })))).unwrap();
        assert_eq!(url, "repos/acme/widgets/pulls/17/commits");
    }

    #[test]
    fn test_render_pager_and_filter() {
        let template = UrlTemplate::parse(
            "search?jql={{.Params.jql|urlencode}}&startAt={{ .Pager.Skip }}&page={{ .Pager.Page }}",
        )
        .unwrap();
        assert!(!template.uses_input());
        assert_eq!(
            template.render(&data(None)).unwrap(),
            "search?jql=project%20%3D%20X%20AND%20type%20%3D%20Bug&startAt=100&page=3"
        );
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let template = UrlTemplate::parse("x/{{ .Input.id }}").unwrap();
        assert!(matches!(
            template.render(&data(None)),
            Err(CollectError::Template(_))
        ));
        assert!(template.render(&data(Some(json!({ "other": 1 })))).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(UrlTemplate::parse("x/{{ .Params.name").is_err());
        assert!(UrlTemplate::parse("x/{{ Params.name }}").is_err());
        assert!(UrlTemplate::parse("x/{{ .Nope.name }}").is_err());
        assert!(UrlTemplate::parse("x/{{ .Pager.Cursor }}").is_err());
        assert!(UrlTemplate::parse("x/{{ .Params.name | shout }}").is_err());
    }

    #[test]
    fn test_plain_url() {
        let template = UrlTemplate::parse("rest/api/2/field").unwrap();
        assert_eq!(template.render(&data(None)).unwrap(), "rest/api/2/field");
    }
}
