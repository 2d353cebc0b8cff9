/*
 * Copyright (C) 2024 The OpenAPP Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Minimal manifest template language.
//!
//! Actions are written `{{ .path.to.field }}`. `{{ . }}` renders the whole
//! values document, `{{/* ... */}}` is a comment, and a `-` directly inside
//! the braces followed (or preceded) by whitespace trims the adjacent text.
//! Rendering is all-or-nothing: any unresolved field aborts the render.

use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const ACTION_OPEN: &str = "{{";
const ACTION_CLOSE: &str = "}}";

#[derive(Debug)]
pub enum RenderError {
    Io { path: PathBuf, source: io::Error },
    Syntax { line: usize, message: String },
    MissingField { line: usize, field: String },
    InvalidInputs(String),
}

impl Display for RenderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::Io { path, source } => {
                write!(f, "failed to read manifest {}: {}", path.display(), source)
            }
            RenderError::Syntax { line, message } => {
                write!(f, "template syntax error at line {}: {}", line, message)
            }
            RenderError::MissingField { line, field } => {
                write!(f, "line {}: field '{}' is not defined", line, field)
            }
            RenderError::InvalidInputs(msg) => write!(f, "invalid inputs: {}", msg),
        }
    }
}

impl Error for RenderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RenderError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Parses an instance's `inputs` document (YAML, JSON being a subset). Blank
/// or null input is an empty mapping; anything but a mapping is rejected.
pub fn parse_inputs(raw: &str) -> Result<Value, RenderError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let parsed: Value =
        serde_yaml::from_str(raw).map_err(|err| RenderError::InvalidInputs(err.to_string()))?;
    match parsed {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(parsed),
        other => Err(RenderError::InvalidInputs(format!(
            "expected a mapping, found {}",
            value_type(&other)
        ))),
    }
}

/// Values document handed to application templates.
pub fn app_instance_values(
    instance_name: &str,
    service_class: &str,
    inputs: &str,
) -> Result<Value, RenderError> {
    Ok(json!({
        "openapp": {
            "instance_name": instance_name,
            "service_class": service_class,
        },
        "inputs": parse_inputs(inputs)?,
    }))
}

/// Values document handed to public-service templates.
pub fn public_service_values(instance_name: &str, inputs: &str) -> Result<Value, RenderError> {
    Ok(json!({
        "openapp": {
            "instance_name": instance_name,
        },
        "inputs": parse_inputs(inputs)?,
    }))
}

pub fn render_manifest(path: &Path, values: &Value) -> Result<String, RenderError> {
    let source = fs::read_to_string(path).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    render(&source, values)
}

pub fn render(source: &str, values: &Value) -> Result<String, RenderError> {
    let mut output = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find(ACTION_OPEN) {
        let line = line_at(source, source.len() - rest.len() + start);
        let (text, action) = rest.split_at(start);
        let action = &action[ACTION_OPEN.len()..];
        let end = action.find(ACTION_CLOSE).ok_or_else(|| RenderError::Syntax {
            line,
            message: "unclosed action".to_string(),
        })?;
        let mut body = &action[..end];
        rest = &action[end + ACTION_CLOSE.len()..];

        let trim_left = trims(body.strip_prefix('-'), |rest, ws| rest.starts_with(ws));
        if trim_left {
            body = &body[1..];
        }
        let trim_right = trims(body.strip_suffix('-'), |rest, ws| rest.ends_with(ws));
        if trim_right {
            body = &body[..body.len() - 1];
        }

        output.push_str(if trim_left { text.trim_end() } else { text });
        evaluate(body.trim(), values, line, &mut output)?;
        if trim_right {
            rest = rest.trim_start();
        }
    }

    if let Some(offset) = rest.find(ACTION_CLOSE) {
        return Err(RenderError::Syntax {
            line: line_at(source, source.len() - rest.len() + offset),
            message: "unexpected \"}}\"".to_string(),
        });
    }
    output.push_str(rest);
    Ok(output)
}

fn trims(remainder: Option<&str>, whitespace_side: fn(&str, char) -> bool) -> bool {
    remainder.is_some_and(|rest| {
        [' ', '\t', '\n', '\r']
            .iter()
            .any(|ws| whitespace_side(rest, *ws))
    })
}

fn evaluate(
    expression: &str,
    values: &Value,
    line: usize,
    output: &mut String,
) -> Result<(), RenderError> {
    if expression.starts_with("/*") && expression.ends_with("*/") {
        return Ok(());
    }
    if expression == "." {
        write_value(values, output);
        return Ok(());
    }
    let Some(path) = expression.strip_prefix('.') else {
        return Err(RenderError::Syntax {
            line,
            message: format!("unsupported action \"{}\"", expression),
        });
    };

    let mut current = values;
    for segment in path.split('.') {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(RenderError::Syntax {
                line,
                message: format!("invalid field reference \"{}\"", expression),
            });
        }
        current = current
            .as_object()
            .and_then(|map| map.get(segment))
            .ok_or_else(|| RenderError::MissingField {
                line,
                field: path.to_string(),
            })?;
    }
    write_value(current, output);
    Ok(())
}

fn write_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => {}
        Value::String(text) => output.push_str(text),
        Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => {
            output.push_str(&value.to_string())
        }
    }
}

fn line_at(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())].matches('\n').count() + 1
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_instance_name_and_inputs() {
        let values = app_instance_values("demo", "", "port: 8080\n").expect("values");
        let rendered = render(
            "name: {{ .openapp.instance_name }}\nport: {{.inputs.port}}\n",
            &values,
        )
        .expect("render");
        assert_eq!(rendered, "name: demo\nport: 8080\n");
    }

    #[test]
    fn missing_field_fails_without_partial_output() {
        let values = public_service_values("gw", "").expect("values");
        let err = render("a: {{ .openapp.instance_name }}\nb: {{ .inputs.absent }}\n", &values)
            .expect_err("missing field");
        match err {
            RenderError::MissingField { line, field } => {
                assert_eq!(line, 2);
                assert_eq!(field, "inputs.absent");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn public_service_values_have_no_service_class() {
        let values = public_service_values("gw", "").expect("values");
        assert!(render("{{ .openapp.service_class }}", &values).is_err());
        let app = app_instance_values("web", "gw", "").expect("values");
        assert_eq!(render("{{ .openapp.service_class }}", &app).unwrap(), "gw");
    }

    #[test]
    fn trim_markers_and_comments() {
        let values = json!({"inputs": {"name": "x"}});
        let rendered = render("a:   {{- .inputs.name -}}   \n{{/* note */}}b", &values).unwrap();
        assert_eq!(rendered, "a:xb");
    }

    #[test]
    fn structured_values_render_as_json() {
        let values = json!({"inputs": {"list": [1, 2], "flag": true, "map": {"k": "v"}, "none": null}});
        let rendered = render(
            "{{.inputs.list}} {{.inputs.flag}} {{.inputs.map}} [{{.inputs.none}}]",
            &values,
        )
        .unwrap();
        assert_eq!(rendered, "[1,2] true {\"k\":\"v\"} []");
    }

    #[test]
    fn syntax_errors_report_line() {
        let values = json!({});
        match render("ok\n{{ .a ", &values) {
            Err(RenderError::Syntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            render("{{ include \"x\" }}", &values),
            Err(RenderError::Syntax { .. })
        ));
    }

    #[test]
    fn inputs_must_be_a_mapping() {
        assert!(parse_inputs("").unwrap().as_object().unwrap().is_empty());
        assert!(parse_inputs("~").unwrap().as_object().unwrap().is_empty());
        assert_eq!(parse_inputs("{\"port\": 80}").unwrap()["port"], 80);
        assert!(matches!(
            parse_inputs("- a\n- b"),
            Err(RenderError::InvalidInputs(_))
        ));
        assert!(matches!(
            parse_inputs("key: [unterminated"),
            Err(RenderError::InvalidInputs(_))
        ));
    }
}
