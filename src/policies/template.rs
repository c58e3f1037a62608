//! `${field.path}` string templates used by the `log` and `headers` policies

use serde_json::Value;

use crate::conditions::expression::FieldPath;
use crate::config_error;
use crate::core::context::RequestContext;
use crate::core::error::GatewayResult;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Field(FieldPath),
}

/// Parsed template; field paths are validated when the template is parsed
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> GatewayResult<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| config_error!("Unclosed '${{' in template '{}'", source))?;
            segments.push(Segment::Field(FieldPath::parse(after[..end].trim())?));
            rest = &after[end + 1..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Render against a request; `null` fields render as empty strings
    pub fn render(&self, ctx: &RequestContext) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(path) => match path.resolve(ctx) {
                    Value::Null => {}
                    Value::String(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                },
            }
        }
        out
    }
}
