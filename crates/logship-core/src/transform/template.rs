//! `{field}` substitution templates for topics and partition keys.

use crate::error::TransformError;
use crate::model::ParsedRecord;

use super::expr::resolve_field;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
}

/// A compiled topic or partition-key template, e.g. `logs-{hostname}`.
///
/// Field references use the same dotted paths as the expression language.
/// An unresolvable field renders as the empty string and is reported in the
/// returned warnings, so a broken reference surfaces per message instead of
/// failing the whole template.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse and compile a template. `what` names the template in diagnostics.
    pub fn compile(src: &str, what: &'static str) -> Result<Self, TransformError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = src.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            match c {
                '{' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(TransformError::Parse {
                            what,
                            offset,
                            message: "unterminated '{' in template".to_string(),
                        });
                    }
                    let name = name.trim();
                    if name.is_empty()
                        || !name
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
                    {
                        return Err(TransformError::Parse {
                            what,
                            offset,
                            message: format!("invalid field reference '{{{}}}'", name),
                        });
                    }
                    let path = name.split('.').map(|s| s.to_string()).collect();
                    segments.push(Segment::Field(path));
                }
                '}' => {
                    return Err(TransformError::Parse {
                        what,
                        offset,
                        message: "unmatched '}' in template".to_string(),
                    });
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Render against a record, collecting warnings for unresolvable fields.
    pub fn render(&self, record: &ParsedRecord) -> (String, Vec<String>) {
        let mut out = String::new();
        let mut warnings = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(path) => match resolve_field(path, record) {
                    Ok(value) => match value.into_topic_string() {
                        Ok(s) => out.push_str(&s),
                        Err(e) => warnings.push(e.to_string()),
                    },
                    Err(e) => warnings.push(e.to_string()),
                },
            }
        }
        (out, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testutil::record;

    #[test]
    fn test_render_with_fields() {
        let tmpl = Template::compile("logs-{hostname}-{severity}", "topic").unwrap();
        let (out, warnings) = tmpl.render(&record("web-01", 4));
        assert_eq!(out, "logs-web-01-4");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_literal_only() {
        let tmpl = Template::compile("syslog", "topic").unwrap();
        let (out, warnings) = tmpl.render(&record("web-01", 4));
        assert_eq!(out, "syslog");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_unknown_field_warns_and_renders_empty() {
        let tmpl = Template::compile("x-{nosuchfield}", "topic").unwrap();
        let (out, warnings) = tmpl.render(&record("web-01", 4));
        assert_eq!(out, "x-");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_malformed_templates_fail_compile() {
        assert!(Template::compile("open-{brace", "topic").is_err());
        assert!(Template::compile("stray-}brace", "topic").is_err());
        assert!(Template::compile("{bad field}", "topic").is_err());
        assert!(Template::compile("{}", "topic").is_err());
    }
}
