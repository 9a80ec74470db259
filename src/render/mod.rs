//! Template rendering - fills `${FIELD}` placeholders from a flat field map.
//!
//! Templates are stored in the editable source format of the converter
//! (Typst source by default). Placeholders not present in the field map
//! render as empty strings. Malformed placeholders are reported with their
//! line and column.

pub mod common;
pub mod fields;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::models::FieldMap;

lazy_static! {
    static ref FIELD_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template is not valid UTF-8: {0}")]
    Encoding(#[source] std::str::Utf8Error),
    #[error("template parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },
}

/// How substituted values are escaped before insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Escaping {
    #[default]
    TypstString,
    Xml,
    None,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    escaping: Escaping,
}

impl TemplateRenderer {
    pub fn new(escaping: Escaping) -> Self {
        Self { escaping }
    }

    pub fn render(&self, template: &[u8], fields: &FieldMap) -> Result<Vec<u8>, RenderError> {
        let source = std::str::from_utf8(template).map_err(RenderError::Encoding)?;
        let mut out = String::with_capacity(source.len());
        let mut rest = source;
        let mut consumed = 0;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find('}') else {
                return Err(parse_error(
                    source,
                    consumed + start,
                    "unterminated placeholder".to_string(),
                ));
            };

            let name = after_open[..end].trim();
            if !FIELD_NAME.is_match(name) {
                return Err(parse_error(
                    source,
                    consumed + start,
                    format!("invalid placeholder name '{}'", name),
                ));
            }

            let value = fields.get(name).map(String::as_str).unwrap_or("");
            out.push_str(&self.escape(value));

            let advance = start + 2 + end + 1;
            consumed += advance;
            rest = &rest[advance..];
        }
        out.push_str(rest);

        Ok(out.into_bytes())
    }

    fn escape(&self, value: &str) -> String {
        match self.escaping {
            Escaping::TypstString => common::escape_typst_string(value),
            Escaping::Xml => common::escape_xml(value),
            Escaping::None => value.to_string(),
        }
    }
}

fn parse_error(source: &str, offset: usize, message: String) -> RenderError {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rsplit('\n')
        .next()
        .map(|l| l.chars().count() + 1)
        .unwrap_or(1);
    RenderError::Parse {
        line,
        column,
        message,
    }
}
