#![forbid(unsafe_code)]

use crate::ApiError;
use crate::compiler::{CubeMeta, MemberMeta};
use crate::date_parser::format_date_time;
use crate::query::NormalizedQuery;
use chrono::{DateTime, NaiveDateTime};
use quarry_orchestrator::Row;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberAnnotation {
    pub title: String,
    pub short_title: String,
    #[serde(rename = "type")]
    pub member_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl From<&MemberMeta> for MemberAnnotation {
    fn from(meta: &MemberMeta) -> Self {
        Self {
            title: meta.title.clone(),
            short_title: meta.short_title.clone(),
            member_type: meta.member_type.clone(),
            format: meta.format.clone(),
        }
    }
}

/// Titles and types of the members a query touches, limited to what the caller can see.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub measures: BTreeMap<String, MemberAnnotation>,
    pub dimensions: BTreeMap<String, MemberAnnotation>,
    pub segments: BTreeMap<String, MemberAnnotation>,
    pub time_dimensions: BTreeMap<String, MemberAnnotation>,
}

impl Annotation {
    fn get(&self, member: &str) -> Option<&MemberAnnotation> {
        self.measures
            .get(member)
            .or_else(|| self.dimensions.get(member))
            .or_else(|| self.time_dimensions.get(member))
    }
}

fn find<'a>(
    meta: &'a [CubeMeta],
    member: &str,
    pick: fn(&CubeMeta) -> &[MemberMeta],
) -> Option<&'a MemberMeta> {
    let mut parts = member.split('.');
    let cube_name = parts.next()?;
    let field = parts.next()?;
    let base = format!("{cube_name}.{field}");
    meta.iter()
        .find(|cube| cube.name == cube_name)
        .and_then(|cube| pick(cube).iter().find(|m| m.name == base))
}

fn measures(cube: &CubeMeta) -> &[MemberMeta] {
    &cube.measures
}

fn dimensions(cube: &CubeMeta) -> &[MemberMeta] {
    &cube.dimensions
}

fn segments(cube: &CubeMeta) -> &[MemberMeta] {
    &cube.segments
}

pub fn prepare_annotation(meta: &[CubeMeta], query: &NormalizedQuery) -> Annotation {
    let collect = |members: &[String], pick: fn(&CubeMeta) -> &[MemberMeta]| {
        members
            .iter()
            .filter_map(|member| {
                find(meta, member, pick).map(|found| (member.clone(), MemberAnnotation::from(found)))
            })
            .collect::<BTreeMap<_, _>>()
    };
    let mut time_dimensions = BTreeMap::new();
    for td in &query.time_dimensions {
        let Some(member) = td.member_name() else {
            continue;
        };
        if let Some(found) = find(meta, &member, dimensions) {
            time_dimensions.insert(member, MemberAnnotation::from(found));
            if !query.dimensions.contains(&td.dimension) {
                time_dimensions.insert(td.dimension.clone(), MemberAnnotation::from(found));
            }
        }
    }

    Annotation {
        measures: collect(&query.measures, measures),
        dimensions: collect(&query.dimensions, dimensions),
        segments: collect(&query.segments, segments),
        time_dimensions,
    }
}

/// Renders a warehouse timestamp as local `YYYY-MM-DDTHH:MM:SS.mmm`.
fn transform_value(value: Value, member_type: &str) -> Value {
    if member_type != "time" {
        return value;
    }
    let parsed = match &value {
        Value::String(raw) => parse_timestamp(raw),
        _ => None,
    };
    match parsed {
        Some(at) => Value::String(format_date_time(at)),
        None => value,
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

/// Maps SQL aliases back to member names. Any column outside the annotation set is an error,
/// so members hidden from the caller never leak.
pub fn transform_data(
    alias_to_member: &BTreeMap<String, String>,
    annotation: &Annotation,
    rows: Vec<Row>,
    query: &NormalizedQuery,
) -> Result<Vec<Map<String, Value>>, ApiError> {
    rows.into_iter()
        .map(|row| {
            let mut out = Map::new();
            for (alias, value) in row {
                let member = alias_to_member.get(&alias);
                let Some((member, member_annotation)) =
                    member.and_then(|member| annotation.get(member).map(|a| (member, a)))
                else {
                    return Err(ApiError::user(format!(
                        "You requested hidden member: '{alias}'. Please make it visible using `shown: true`."
                    )));
                };
                let value = transform_value(value, &member_annotation.member_type);

                let mut path = member.splitn(3, '.');
                if let (Some(cube), Some(field), Some(_granularity)) =
                    (path.next(), path.next(), path.next())
                {
                    let base = format!("{cube}.{field}");
                    if !query.dimensions.contains(&base) {
                        out.insert(base, value.clone());
                    }
                }
                out.insert(member.clone(), value);
            }
            Ok(out)
        })
        .collect()
}
