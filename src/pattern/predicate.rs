use chrono::{DateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cell::OnceCell;
use std::fmt;

use crate::domain::ToolRequest;
use crate::error::GateError;

use super::PatternEngine;

/// Which part of a request a leaf predicate inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    ToolName,
    /// A single named parameter
    Parameter(String),
    Cwd,
    /// The whole parameters document
    Parameters,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::ToolName => write!(f, "tool_name"),
            Target::Parameter(name) => write!(f, "parameters.{}", name),
            Target::Cwd => write!(f, "cwd"),
            Target::Parameters => write!(f, "parameters"),
        }
    }
}

/// Numeric comparison applied to the first numeric JSONPath match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
}

impl Comparator {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gt" | ">" => Some(Comparator::Gt),
            "lt" | "<" => Some(Comparator::Lt),
            "gte" | ">=" => Some(Comparator::Gte),
            "lte" | "<=" => Some(Comparator::Lte),
            "eq" | "==" => Some(Comparator::Eq),
            _ => None,
        }
    }

    #[inline]
    pub fn compare(self, actual: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => actual > threshold,
            Comparator::Lt => actual < threshold,
            Comparator::Gte => actual >= threshold,
            Comparator::Lte => actual <= threshold,
            Comparator::Eq => (actual - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub comparator: Comparator,
    pub value: f64,
}

/// Daily time window in a given zone. Wraps past midnight when `end < start`;
/// equal bounds cover the whole day.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub tz: Tz,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime, tz: Tz) -> Self {
        TimeWindow { start, end, tz }
    }

    /// Parse `{start: "09:00", end: "17:00", timezone: "Europe/Berlin"}`.
    pub fn parse(value: &Value) -> Result<Self, GateError> {
        let obj = value
            .as_object()
            .ok_or_else(|| GateError::config("time_range must be an object"))?;

        let start = parse_clock(obj, "start")?;
        let end = parse_clock(obj, "end")?;
        let tz = match obj.get("timezone").or_else(|| obj.get("tz")) {
            None => Tz::UTC,
            Some(Value::String(name)) => name
                .parse::<Tz>()
                .map_err(|_| GateError::config(format!("unknown time zone '{}'", name)))?,
            Some(_) => return Err(GateError::config("time_range timezone must be a string")),
        };

        Ok(TimeWindow { start, end, tz })
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz).time();
        // Drop sub-second precision so bounds behave like wall-clock minutes
        let local = local.with_nanosecond(0).unwrap_or(local);

        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= local && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

fn parse_clock(obj: &Map<String, Value>, key: &str) -> Result<NaiveTime, GateError> {
    let raw = obj
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| GateError::config(format!("time_range.{} must be a string", key)))?;

    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| GateError::config(format!("time_range.{} '{}' is not HH:MM", key, raw)))
}

/// Compiled rule condition.
///
/// Built once when a rule file is loaded; evaluation never re-inspects the
/// original document shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    StringEquals {
        target: Target,
        value: String,
    },
    RegexMatch {
        target: Target,
        pattern: String,
    },
    GlobMatch {
        target: Target,
        pattern: String,
    },
    JsonPathQuery {
        target: Target,
        query: String,
        threshold: Option<Threshold>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    TimeWindow(TimeWindow),
}

impl Predicate {
    /// Matches every request.
    pub fn always() -> Self {
        Predicate::And(Vec::new())
    }

    /// Parse a rule's `conditions` object.
    ///
    /// Recognised keys: `tool_name`, `parameters`, `document`, `cwd`,
    /// `cwd_pattern`, `time_range`, `and`/`all`, `or`/`any`, `not`.
    /// Several keys in one object are combined with AND.
    pub fn from_conditions(conditions: &Value) -> Result<Self, GateError> {
        let obj = conditions
            .as_object()
            .ok_or_else(|| GateError::config("conditions must be an object"))?;

        let mut parts = Vec::with_capacity(obj.len());

        for (key, value) in obj {
            let part = match key.as_str() {
                "tool_name" => Predicate::from_pattern(value, Target::ToolName)?,
                "parameters" => {
                    let params = value.as_object().ok_or_else(|| {
                        GateError::config("conditions.parameters must be an object")
                    })?;
                    let checks = params
                        .iter()
                        .map(|(name, cfg)| {
                            Predicate::from_pattern(cfg, Target::Parameter(name.clone()))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Predicate::And(checks)
                }
                "document" => Predicate::from_pattern(value, Target::Parameters)?,
                "cwd" => Predicate::from_pattern(value, Target::Cwd)?,
                "cwd_pattern" => match value {
                    Value::String(pattern) => Predicate::GlobMatch {
                        target: Target::Cwd,
                        pattern: pattern.clone(),
                    },
                    other => Predicate::from_pattern(other, Target::Cwd)?,
                },
                "time_range" => Predicate::TimeWindow(TimeWindow::parse(value)?),
                "and" | "AND" | "all" => Predicate::And(parse_condition_list(key, value)?),
                "or" | "OR" | "any" => Predicate::Or(parse_condition_list(key, value)?),
                "not" | "NOT" => Predicate::Not(Box::new(Predicate::from_conditions(value)?)),
                other => {
                    return Err(GateError::config(format!(
                        "unknown condition key '{}'",
                        other
                    )))
                }
            };
            parts.push(part);
        }

        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(Predicate::And(parts))
        }
    }

    /// Parse a single pattern config applied to `target`.
    ///
    /// A bare string is an exact match, a list is any-of, and an object
    /// selects a dialect through its `type` field.
    pub fn from_pattern(config: &Value, target: Target) -> Result<Self, GateError> {
        match config {
            Value::String(s) => Ok(Predicate::StringEquals {
                target,
                value: s.clone(),
            }),
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(GateError::config(format!(
                        "empty pattern list for {}",
                        target
                    )));
                }
                let alternatives = items
                    .iter()
                    .map(|item| Predicate::from_pattern(item, target.clone()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Predicate::Or(alternatives))
            }
            Value::Object(obj) => parse_typed_pattern(obj, target),
            other => Err(GateError::config(format!(
                "unsupported pattern {} for {}",
                other, target
            ))),
        }
    }

    /// Evaluate against a request.
    ///
    /// A missing field never matches. Errors mean the predicate itself could
    /// not be evaluated.
    pub fn evaluate(&self, engine: &PatternEngine, ctx: &MatchContext<'_>) -> Result<bool, GateError> {
        self.eval(engine, ctx, None)
    }

    /// Evaluate every leaf against `bound` instead of resolving its target.
    pub(crate) fn evaluate_bound(
        &self,
        engine: &PatternEngine,
        ctx: &MatchContext<'_>,
        bound: &Value,
    ) -> Result<bool, GateError> {
        self.eval(engine, ctx, Some(Subject::Json(bound)))
    }

    fn eval<'s>(
        &self,
        engine: &PatternEngine,
        ctx: &'s MatchContext<'_>,
        bound: Option<Subject<'s>>,
    ) -> Result<bool, GateError> {
        match self {
            Predicate::And(children) => {
                for child in children {
                    if !child.eval(engine, ctx, bound)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(children) => {
                for child in children {
                    if child.eval(engine, ctx, bound)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!inner.eval(engine, ctx, bound)?),
            Predicate::TimeWindow(window) => Ok(window.contains(ctx.now())),
            Predicate::StringEquals { target, value } => {
                Ok(text_of(bound, ctx, target).is_some_and(|text| engine.match_string(value, &text)))
            }
            Predicate::RegexMatch { target, pattern } => match text_of(bound, ctx, target) {
                Some(text) => engine.try_regex(pattern, &text),
                None => Ok(false),
            },
            Predicate::GlobMatch { target, pattern } => {
                Ok(text_of(bound, ctx, target).is_some_and(|text| engine.match_glob(pattern, &text)))
            }
            Predicate::JsonPathQuery {
                target,
                query,
                threshold,
            } => match bound.or_else(|| ctx.resolve(target)) {
                Some(Subject::Json(doc)) => engine.try_jsonpath(query, doc, threshold.as_ref()),
                Some(Subject::Text(text)) => {
                    engine.try_jsonpath(query, &Value::String(text.to_string()), threshold.as_ref())
                }
                None => Ok(false),
            },
        }
    }

    /// Visit every node depth-first.
    pub fn walk<'p>(&'p self, visit: &mut dyn FnMut(&'p Predicate)) {
        visit(self);
        match self {
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.walk(visit);
                }
            }
            Predicate::Not(inner) => inner.walk(visit),
            _ => {}
        }
    }
}

fn parse_condition_list(key: &str, value: &Value) -> Result<Vec<Predicate>, GateError> {
    value
        .as_array()
        .ok_or_else(|| GateError::config(format!("conditions.{} must be a list", key)))?
        .iter()
        .map(Predicate::from_conditions)
        .collect()
}

fn parse_typed_pattern(obj: &Map<String, Value>, target: Target) -> Result<Predicate, GateError> {
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GateError::config(format!("pattern for {} is missing 'type'", target)))?;

    let text = |keys: &[&str]| -> Result<String, GateError> {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| {
                GateError::config(format!("{} pattern for {} needs '{}'", kind, target, keys[0]))
            })
    };

    match kind {
        "exact" | "string" | "equals" => Ok(Predicate::StringEquals {
            value: text(&["value", "pattern"])?,
            target,
        }),
        "regex" => Ok(Predicate::RegexMatch {
            pattern: text(&["pattern"])?,
            target,
        }),
        "glob" => Ok(Predicate::GlobMatch {
            pattern: text(&["pattern"])?,
            target,
        }),
        "jsonpath" => {
            let query = text(&["query", "pattern"])?;
            let threshold = match obj.get("threshold") {
                None | Some(Value::Null) => None,
                Some(raw) => {
                    let value = raw.as_f64().ok_or_else(|| {
                        GateError::config(format!("jsonpath threshold for {} must be a number", target))
                    })?;
                    let comparator = obj
                        .get("comparator")
                        .and_then(Value::as_str)
                        .and_then(Comparator::parse)
                        .ok_or_else(|| {
                            GateError::config(format!(
                                "jsonpath threshold for {} needs comparator gt|lt|gte|lte|eq",
                                target
                            ))
                        })?;
                    Some(Threshold { comparator, value })
                }
            };
            Ok(Predicate::JsonPathQuery {
                target,
                query,
                threshold,
            })
        }
        "time_window" | "time_range" => Ok(Predicate::TimeWindow(TimeWindow::parse(&Value::Object(
            obj.clone(),
        ))?)),
        "and" | "or" => {
            let patterns = obj
                .get("patterns")
                .and_then(Value::as_array)
                .ok_or_else(|| GateError::config(format!("{} pattern needs a 'patterns' list", kind)))?;
            let children = patterns
                .iter()
                .map(|p| Predicate::from_pattern(p, target.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if kind == "and" {
                Predicate::And(children)
            } else {
                Predicate::Or(children)
            })
        }
        other => Err(GateError::config(format!(
            "unknown pattern type '{}' for {}",
            other, target
        ))),
    }
}

/// A resolved request field.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Subject<'a> {
    Text(&'a str),
    Json(&'a Value),
}

impl<'a> Subject<'a> {
    /// String view used by the string-based dialects. Null has no text.
    fn as_text(self) -> Option<Cow<'a, str>> {
        match self {
            Subject::Text(s) => Some(Cow::Borrowed(s)),
            Subject::Json(Value::String(s)) => Some(Cow::Borrowed(s.as_str())),
            Subject::Json(Value::Null) => None,
            Subject::Json(Value::Bool(b)) => Some(Cow::Owned(b.to_string())),
            Subject::Json(Value::Number(n)) => Some(Cow::Owned(n.to_string())),
            Subject::Json(other) => Some(Cow::Owned(other.to_string())),
        }
    }
}

fn text_of<'s>(
    bound: Option<Subject<'s>>,
    ctx: &'s MatchContext<'_>,
    target: &Target,
) -> Option<Cow<'s, str>> {
    bound.or_else(|| ctx.resolve(target)).and_then(Subject::as_text)
}

/// Per-call view of a request for predicate evaluation.
pub struct MatchContext<'a> {
    request: &'a ToolRequest,
    now: DateTime<Utc>,
    document: OnceCell<Value>,
}

impl<'a> MatchContext<'a> {
    pub fn new(request: &'a ToolRequest) -> Self {
        MatchContext::at(request, Utc::now())
    }

    /// Evaluate as if the current time were `now`.
    pub fn at(request: &'a ToolRequest, now: DateTime<Utc>) -> Self {
        MatchContext {
            request,
            now,
            document: OnceCell::new(),
        }
    }

    pub fn request(&self) -> &ToolRequest {
        self.request
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn resolve(&self, target: &Target) -> Option<Subject<'_>> {
        match target {
            Target::ToolName => Some(Subject::Text(&self.request.tool_name)),
            Target::Parameter(name) => self.request.parameters.get(name).map(Subject::Json),
            Target::Cwd => self.request.cwd.as_deref().map(Subject::Text),
            Target::Parameters => Some(Subject::Json(
                self.document
                    .get_or_init(|| Value::Object(self.request.parameters.clone())),
            )),
        }
    }
}
