#![forbid(unsafe_code)]

use crate::ApiError;
use crate::date_parser::{
    DATE_TIME_FORMAT, TimeUnit, format_date_time, parse_date_range, parse_timezone,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type Granularity = TimeUnit;

pub const MAX_LIMIT: u64 = 50_000;
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const EMPTY_QUERY_MESSAGE: &str = "Query should contain either measures, dimensions or timeDimensions with granularities in order to be valid";

/// Query as submitted by a client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Query {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub time_dimensions: Vec<TimeDimension>,
    #[serde(default)]
    pub segments: Vec<String>,
    /// `{"member": "asc"}` or `[["member", "desc"]]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_query: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ungrouped: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeDimension {
    pub dimension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateRange {
    Relative(String),
    Absolute(Vec<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Set,
    NotSet,
    InDateRange,
    NotInDateRange,
    BeforeDate,
    AfterDate,
}

impl FilterOperator {
    const ALL: [Self; 16] = [
        Self::Equals,
        Self::NotEquals,
        Self::Contains,
        Self::NotContains,
        Self::In,
        Self::NotIn,
        Self::Gt,
        Self::Gte,
        Self::Lt,
        Self::Lte,
        Self::Set,
        Self::NotSet,
        Self::InDateRange,
        Self::NotInDateRange,
        Self::BeforeDate,
        Self::AfterDate,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == raw)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "notEquals",
            Self::Contains => "contains",
            Self::NotContains => "notContains",
            Self::In => "in",
            Self::NotIn => "notIn",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Set => "set",
            Self::NotSet => "notSet",
            Self::InDateRange => "inDateRange",
            Self::NotInDateRange => "notInDateRange",
            Self::BeforeDate => "beforeDate",
            Self::AfterDate => "afterDate",
        }
    }

    pub fn needs_values(self) -> bool {
        !matches!(self, Self::Set | Self::NotSet)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NormalizedFilter {
    pub member: String,
    pub operator: FilterOperator,
    pub values: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTimeDimension {
    pub dimension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<[String; 2]>,
}

impl NormalizedTimeDimension {
    /// `cube.member.granularity`, the name its values are reported under.
    pub fn member_name(&self) -> Option<String> {
        self.granularity
            .map(|granularity| format!("{}.{}", self.dimension, granularity.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderMember {
    pub id: String,
    pub desc: bool,
}

/// Validated query with defaults applied and shorthand expanded.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedQuery {
    pub measures: Vec<String>,
    pub dimensions: Vec<String>,
    pub filters: Vec<NormalizedFilter>,
    pub time_dimensions: Vec<NormalizedTimeDimension>,
    pub segments: Vec<String>,
    pub order: Vec<OrderMember>,
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub renew_query: bool,
    pub ungrouped: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Decodes a `query` request parameter: a JSON string or an already parsed object.
pub fn parse_query_param(raw: Value) -> Result<Query, ApiError> {
    let value = match raw {
        Value::Null => return Err(ApiError::user("query param is required")),
        Value::String(text) if text.is_empty() || text == "undefined" => {
            return Err(ApiError::user("query param is required"));
        }
        Value::String(text) => serde_json::from_str::<Value>(&text)?,
        other => other,
    };
    if value.is_array() {
        return Err(ApiError::user("Data blending queries are not supported"));
    }
    serde_json::from_value(value)
        .map_err(|err| ApiError::user(format!("Invalid query format: {err}")))
}

fn is_member_name(name: &str, max_parts: usize) -> bool {
    let parts = name.split('.').collect::<Vec<_>>();
    (2..=max_parts).contains(&parts.len())
        && parts.iter().all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn describe(filter: &Filter) -> String {
    serde_json::to_string(filter).unwrap_or_default()
}

/// Structural checks only; members are not resolved against a schema here.
pub fn validate_query(query: &Query) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (index, name) in query.measures.iter().enumerate() {
        if !is_member_name(name, 2) {
            violations.push(Violation::new(
                format!("measures[{index}]"),
                format!("Invalid member name: '{name}'"),
            ));
        }
    }
    for (index, name) in query.dimensions.iter().enumerate() {
        if !is_member_name(name, 3) {
            violations.push(Violation::new(
                format!("dimensions[{index}]"),
                format!("Invalid member name: '{name}'"),
            ));
            continue;
        }
        if let Some((_, granularity)) = split_granularity(name) {
            if Granularity::from_granularity(granularity).is_none() {
                violations.push(Violation::new(
                    format!("dimensions[{index}]"),
                    format!("Invalid granularity '{granularity}' in '{name}'"),
                ));
            }
        }
    }
    for (index, name) in query.segments.iter().enumerate() {
        if !is_member_name(name, 2) {
            violations.push(Violation::new(
                format!("segments[{index}]"),
                format!("Invalid member name: '{name}'"),
            ));
        }
    }

    for (index, filter) in query.filters.iter().enumerate() {
        let path = format!("filters[{index}]");
        if filter.dimension.as_ref().or(filter.member.as_ref()).is_none() {
            violations.push(Violation::new(
                &path,
                format!("Dimension or member required for filter: {}", describe(filter)),
            ));
        }
        match filter.operator.as_deref() {
            None => violations.push(Violation::new(
                &path,
                format!("Operator required for filter: {}", describe(filter)),
            )),
            Some(raw) => match FilterOperator::parse(raw) {
                None => violations.push(Violation::new(
                    &path,
                    format!("Invalid operator '{raw}' for filter: {}", describe(filter)),
                )),
                Some(op) if op.needs_values() && filter.values.is_none() => {
                    violations.push(Violation::new(
                        &path,
                        format!("Values required for filter: {}", describe(filter)),
                    ));
                }
                Some(_) => {}
            },
        }
    }

    for (index, td) in query.time_dimensions.iter().enumerate() {
        let path = format!("timeDimensions[{index}]");
        if !is_member_name(&td.dimension, 2) {
            violations.push(Violation::new(
                &path,
                format!("Invalid member name: '{}'", td.dimension),
            ));
        }
        if let Some(granularity) = td.granularity.as_deref() {
            if Granularity::from_granularity(granularity).is_none() {
                violations.push(Violation::new(
                    &path,
                    format!("Invalid granularity: '{granularity}'"),
                ));
            }
        }
        if let Some(DateRange::Absolute(dates)) = &td.date_range {
            if dates.is_empty() || dates.len() > 2 {
                violations.push(Violation::new(
                    &path,
                    "dateRange must contain one or two dates",
                ));
            }
        }
    }

    if let Some(limit) = query.limit {
        if !(1..=MAX_LIMIT).contains(&limit) {
            violations.push(Violation::new(
                "limit",
                format!("limit must be between 1 and {MAX_LIMIT}"),
            ));
        }
    }

    let has_granular_time = query
        .time_dimensions
        .iter()
        .any(|td| td.granularity.is_some());
    if query.measures.is_empty() && query.dimensions.is_empty() && !has_granular_time {
        violations.push(Violation::new("", EMPTY_QUERY_MESSAGE));
    }
    violations
}

fn split_granularity(name: &str) -> Option<(&str, &str)> {
    let (member, granularity) = name.rsplit_once('.')?;
    member.contains('.').then_some((member, granularity))
}

/// Validates `query` and produces its normalized form.
pub fn normalize_query(query: Query) -> Result<NormalizedQuery, ApiError> {
    let violations = validate_query(&query);
    if !violations.is_empty() {
        let message = violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ApiError::User(message));
    }

    let timezone = query
        .timezone
        .clone()
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
    parse_timezone(&timezone)?;

    let mut dimensions = Vec::new();
    let mut expanded = Vec::new();
    for name in query.dimensions {
        match split_granularity(&name) {
            Some((member, granularity)) => expanded.push(NormalizedTimeDimension {
                dimension: member.to_string(),
                granularity: Granularity::from_granularity(granularity),
                date_range: None,
            }),
            None => dimensions.push(name),
        }
    }

    let mut time_dimensions = Vec::with_capacity(query.time_dimensions.len() + expanded.len());
    for td in query.time_dimensions {
        let date_range = match td.date_range {
            None => None,
            Some(DateRange::Relative(expr)) => Some(parse_date_range(&expr, &timezone)?),
            Some(DateRange::Absolute(dates)) => Some(absolute_range(&dates)?),
        };
        time_dimensions.push(NormalizedTimeDimension {
            dimension: td.dimension,
            granularity: td.granularity.as_deref().and_then(Granularity::from_granularity),
            date_range,
        });
    }
    time_dimensions.extend(expanded);

    let filters = query
        .filters
        .into_iter()
        .filter_map(|filter| {
            let member = filter.dimension.or(filter.member)?;
            let operator = FilterOperator::parse(filter.operator.as_deref()?)?;
            Some(NormalizedFilter {
                member,
                operator,
                values: filter.values.unwrap_or_default(),
            })
        })
        .collect();

    Ok(NormalizedQuery {
        measures: query.measures,
        dimensions,
        filters,
        time_dimensions,
        segments: query.segments,
        order: normalize_order(query.order.as_ref())?,
        timezone,
        row_limit: query.limit,
        offset: query.offset,
        renew_query: query.renew_query.unwrap_or(false),
        ungrouped: query.ungrouped.unwrap_or(false),
    })
}

/// A one-element range covers that single day; bare dates expand to whole-day bounds.
fn absolute_range(dates: &[String]) -> Result<[String; 2], ApiError> {
    let (start, end) = match dates {
        [single] => (single, single),
        [start, end] => (start, end),
        _ => return Err(ApiError::user("dateRange must contain one or two dates")),
    };
    Ok([
        bound(start, NaiveTime::MIN)?,
        bound(end, NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN))?,
    ])
}

fn bound(raw: &str, day_time: NaiveTime) -> Result<String, ApiError> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(format_date_time(date.and_time(day_time)));
    }
    let trimmed = raw.trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", DATE_TIME_FORMAT]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(format_date_time)
        .ok_or_else(|| ApiError::user(format!("Can't parse date: '{raw}'")))
}

fn normalize_order(order: Option<&Value>) -> Result<Vec<OrderMember>, ApiError> {
    let direction = |member: &str, raw: &Value| match raw.as_str() {
        Some("asc") => Ok(false),
        Some("desc") => Ok(true),
        _ => Err(ApiError::user(format!(
            "Order direction for '{member}' must be 'asc' or 'desc'"
        ))),
    };
    match order {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(entries)) => entries
            .iter()
            .map(|(id, dir)| {
                Ok(OrderMember {
                    id: id.clone(),
                    desc: direction(id, dir)?,
                })
            })
            .collect(),
        Some(Value::Array(pairs)) => pairs
            .iter()
            .map(|pair| match pair.as_array().map(Vec::as_slice) {
                Some([Value::String(id), dir]) => Ok(OrderMember {
                    id: id.clone(),
                    desc: direction(id, dir)?,
                }),
                _ => Err(ApiError::user("Order entries must be [member, direction] pairs")),
            })
            .collect(),
        Some(_) => Err(ApiError::user("order must be an object or an array")),
    }
}
