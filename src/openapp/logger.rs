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

//! Structured line logger used by every controller. A line carries the
//! emitting component, the active trace identifiers and caller supplied
//! key/value pairs, rendered as logfmt-style text or as one JSON object.

use crate::openapp::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

const SERVICE_NAME: &str = "openapp-controller";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug)]
pub struct UnknownLogFormat(String);

impl fmt::Display for UnknownLogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown log format '{}' (expected text or json)", self.0)
    }
}

impl std::error::Error for UnknownLogFormat {}

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "text" | "logfmt" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(UnknownLogFormat(normalized)),
        }
    }
}

static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);

pub fn set_log_format(format: LogFormat) {
    JSON_OUTPUT.store(format == LogFormat::Json, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    if JSON_OUTPUT.load(Ordering::Relaxed) {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One log line with its fields in output order.
struct Record<'a> {
    level: LogLevel,
    fields: Vec<(&'a str, String)>,
}

impl<'a> Record<'a> {
    fn new(
        level: LogLevel,
        timestamp: String,
        component: &str,
        message: &str,
        metadata: &[(&'a str, &str)],
    ) -> Self {
        let mut fields = vec![
            ("ts", timestamp),
            ("level", level.label().to_string()),
            ("service", SERVICE_NAME.to_string()),
            ("component", component.to_string()),
            ("pid", std::process::id().to_string()),
            ("msg", message.to_string()),
        ];
        if let Some(ctx) = tracing::current_context() {
            fields.push(("trace_id", ctx.trace_id()));
            fields.push(("span_id", ctx.span_id()));
        }
        fields.extend(
            metadata
                .iter()
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (*key, (*value).to_string())),
        );
        Self { level, fields }
    }

    fn to_text(&self) -> String {
        let mut line = String::new();
        for (key, value) in &self.fields {
            if !line.is_empty() {
                line.push(' ');
            }
            let _ = write!(line, "{}={}", key, logfmt_value(value));
        }
        line
    }

    fn to_json(&self) -> String {
        let object: Map<String, Value> = self
            .fields
            .iter()
            .map(|(key, value)| ((*key).to_string(), Value::String(value.clone())))
            .collect();
        Value::Object(object).to_string()
    }
}

/// Bare values stay bare; anything with spaces or logfmt syntax is quoted
/// with Rust-style escapes.
fn logfmt_value(value: &str) -> String {
    let bare = !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ','));
    if bare {
        value.to_string()
    } else {
        format!("{:?}", value)
    }
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let record = Record::new(level, timestamp, component, message, metadata);
    let line = match current_log_format() {
        LogFormat::Text => record.to_text(),
        LogFormat::Json => record.to_json(),
    };
    sink::emit(record.level, line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
mod sink {
    use super::LogLevel;
    use std::io::{self, Write};

    /// Warnings and errors go to stderr, everything else to stdout.
    pub(super) fn emit(level: LogLevel, line: String) {
        let result = match level {
            LogLevel::Warn | LogLevel::Error => writeln!(io::stderr().lock(), "{}", line),
            LogLevel::Debug | LogLevel::Info => writeln!(io::stdout().lock(), "{}", line),
        };
        if let Err(err) = result {
            let _ = writeln!(
                io::stderr().lock(),
                "openapp: failed to write log line: {} (original: {})",
                err,
                line
            );
        }
    }
}


/// Drains log lines captured while running unit tests.
#[cfg(test)]
pub(crate) fn take_test_logs() -> Vec<(LogLevel, String)> {
    sink::drain()
}
