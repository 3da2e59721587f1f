#![forbid(unsafe_code)]

use crate::ApiError;
use crate::date_parser::TimeUnit;
use crate::gateway::RequestContext;
use crate::query::{FilterOperator, NormalizedFilter, NormalizedQuery, OrderMember};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const DEFAULT_ROW_LIMIT: u64 = 10_000;

/// Output of the semantic-to-SQL step.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    /// SQL column alias to member name.
    pub alias_to_member: BTreeMap<String, String>,
    pub order: Vec<OrderMember>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberMeta {
    pub name: String,
    pub title: String,
    pub short_title: String,
    #[serde(rename = "type")]
    pub member_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CubeMeta {
    pub name: String,
    pub title: String,
    pub measures: Vec<MemberMeta>,
    pub dimensions: Vec<MemberMeta>,
    pub segments: Vec<MemberMeta>,
}

#[async_trait]
pub trait QueryCompiler: Send + Sync {
    async fn compile(
        &self,
        query: &NormalizedQuery,
        ctx: &RequestContext,
    ) -> Result<CompiledQuery, ApiError>;
}

/// Visible members per cube, as the caller is allowed to see them.
#[async_trait]
pub trait MetaSource: Send + Sync {
    async fn meta(&self, ctx: &RequestContext) -> Result<Vec<CubeMeta>, ApiError>;
}

#[derive(Clone, Debug, Deserialize)]
struct SchemaFile {
    cubes: Vec<CubeDef>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CubeDef {
    name: String,
    #[serde(default)]
    title: Option<String>,
    /// Table name or a parenthesizable SELECT.
    sql: String,
    #[serde(default)]
    measures: Vec<MemberDef>,
    #[serde(default)]
    dimensions: Vec<MemberDef>,
    #[serde(default)]
    segments: Vec<MemberDef>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberDef {
    name: String,
    #[serde(default)]
    sql: Option<String>,
    #[serde(rename = "type", default)]
    member_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    short_title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    shown: Option<bool>,
    #[serde(default)]
    primary_key: bool,
}

impl MemberDef {
    fn visible(&self) -> bool {
        self.shown.unwrap_or(!self.primary_key)
    }

    fn column(&self) -> &str {
        self.sql.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MemberKind {
    Measure,
    Dimension,
    Segment,
}

/// Single-cube compiler over a JSON schema file, emitting SQLite SQL.
#[derive(Clone, Debug)]
pub struct SchemaCompiler {
    cubes: BTreeMap<String, CubeDef>,
}

impl SchemaCompiler {
    pub fn from_value(schema: Value) -> Result<Self, ApiError> {
        let file: SchemaFile = serde_json::from_value(schema)
            .map_err(|err| ApiError::Internal(format!("invalid schema: {err}")))?;
        let cubes = file
            .cubes
            .into_iter()
            .map(|cube| (cube.name.clone(), cube))
            .collect();
        Ok(Self { cubes })
    }

    pub fn from_file(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ApiError::Internal(format!("failed to read schema {}: {err}", path.display()))
        })?;
        let schema = serde_json::from_str(&raw)
            .map_err(|err| ApiError::Internal(format!("invalid schema: {err}")))?;
        Self::from_value(schema)
    }

    fn lookup(&self, member: &str) -> Result<(&CubeDef, &MemberDef, MemberKind), ApiError> {
        let not_found = || ApiError::user(format!("'{member}' not found for path '{member}'"));
        let (cube_name, field) = member.split_once('.').ok_or_else(not_found)?;
        let cube = self.cubes.get(cube_name).ok_or_else(not_found)?;
        let (def, kind) = find_member(&cube.measures, field, MemberKind::Measure)
            .or_else(|| find_member(&cube.dimensions, field, MemberKind::Dimension))
            .or_else(|| find_member(&cube.segments, field, MemberKind::Segment))
            .ok_or_else(not_found)?;
        Ok((cube, def, kind))
    }

    fn measure_sql(def: &MemberDef, ungrouped: bool) -> Result<String, ApiError> {
        let kind = def.member_type.as_deref().unwrap_or("count");
        let column = def.sql.as_deref();
        if ungrouped {
            return Ok(column.unwrap_or("1").to_string());
        }
        let missing_sql = || ApiError::user(format!("Measure '{}' of type '{kind}' needs sql", def.name));
        Ok(match kind {
            "count" => match column {
                Some(sql) => format!("count({sql})"),
                None => "count(*)".to_string(),
            },
            "countDistinct" => format!("count(distinct {})", column.ok_or_else(missing_sql)?),
            "sum" | "avg" | "min" | "max" => format!("{kind}({})", column.ok_or_else(missing_sql)?),
            "number" => column.ok_or_else(missing_sql)?.to_string(),
            other => {
                return Err(ApiError::user(format!(
                    "Unsupported measure type '{other}' for '{}'",
                    def.name
                )));
            }
        })
    }

    fn cube_of(&self, query: &NormalizedQuery) -> Result<&CubeDef, ApiError> {
        let mut names = BTreeSet::new();
        let members = query
            .measures
            .iter()
            .chain(&query.dimensions)
            .chain(&query.segments)
            .chain(query.time_dimensions.iter().map(|td| &td.dimension))
            .chain(query.filters.iter().map(|filter| &filter.member));
        for member in members {
            names.insert(member.split('.').next().unwrap_or_default().to_string());
        }
        let mut names = names.into_iter();
        match (names.next(), names.next()) {
            (Some(name), None) => self
                .cubes
                .get(&name)
                .ok_or_else(|| ApiError::user(format!("Cube '{name}' not found"))),
            (Some(first), Some(second)) => Err(ApiError::user(format!(
                "Queries spanning several cubes are not supported: {first}, {second}"
            ))),
            (None, _) => Err(ApiError::user("Query references no members")),
        }
    }
}

fn find_member<'a>(
    members: &'a [MemberDef],
    field: &str,
    kind: MemberKind,
) -> Option<(&'a MemberDef, MemberKind)> {
    members
        .iter()
        .find(|def| def.name == field)
        .map(|def| (def, kind))
}

#[async_trait]
impl MetaSource for SchemaCompiler {
    async fn meta(&self, _ctx: &RequestContext) -> Result<Vec<CubeMeta>, ApiError> {
        Ok(self.cubes.values().map(cube_meta).collect())
    }
}

fn cube_meta(cube: &CubeDef) -> CubeMeta {
    let cube_title = cube.title.clone().unwrap_or_else(|| humanize(&cube.name));
    let members = |defs: &[MemberDef], default_type: &str| {
        defs.iter()
            .filter(|def| def.visible())
            .map(|def| {
                let short_title = def
                    .short_title
                    .clone()
                    .or_else(|| def.title.clone())
                    .unwrap_or_else(|| humanize(&def.name));
                MemberMeta {
                    name: format!("{}.{}", cube.name, def.name),
                    title: def
                        .title
                        .clone()
                        .unwrap_or_else(|| format!("{cube_title} {short_title}")),
                    short_title,
                    member_type: def
                        .member_type
                        .clone()
                        .unwrap_or_else(|| default_type.to_string()),
                    description: def.description.clone(),
                    format: def.format.clone(),
                }
            })
            .collect::<Vec<_>>()
    };
    CubeMeta {
        name: cube.name.clone(),
        title: cube_title.clone(),
        measures: members(&cube.measures, "count"),
        dimensions: members(&cube.dimensions, "string"),
        segments: members(&cube.segments, "segment"),
    }
}

/// `createdAt` / `line_items` to `Created At` / `Line Items`.
fn humanize(name: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in name.chars() {
        if c == '_' || (c.is_ascii_uppercase() && !current.is_empty()) {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            if c == '_' {
                continue;
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
        .iter()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn alias_for(member: &str) -> String {
    member
        .split('.')
        .map(snake_case)
        .collect::<Vec<_>>()
        .join("__")
}

/// Truncates a timestamp column to the start of `granularity`, rendered as local text.
fn truncate_time(column: &str, granularity: TimeUnit) -> String {
    match granularity {
        TimeUnit::Second => format!("strftime('%Y-%m-%dT%H:%M:%S.000', {column})"),
        TimeUnit::Minute => format!("strftime('%Y-%m-%dT%H:%M:00.000', {column})"),
        TimeUnit::Hour => format!("strftime('%Y-%m-%dT%H:00:00.000', {column})"),
        TimeUnit::Day => format!("strftime('%Y-%m-%dT00:00:00.000', {column})"),
        TimeUnit::Week => {
            format!("strftime('%Y-%m-%dT00:00:00.000', {column}, '-6 days', 'weekday 1')")
        }
        TimeUnit::Month => format!("strftime('%Y-%m-01T00:00:00.000', {column})"),
        TimeUnit::Quarter => format!(
            "printf('%s-%02d-01T00:00:00.000', strftime('%Y', {column}), \
             ((cast(strftime('%m', {column}) as integer) - 1) / 3) * 3 + 1)"
        ),
        TimeUnit::Year => format!("strftime('%Y-01-01T00:00:00.000', {column})"),
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn filter_sql(
    expr: &str,
    filter: &NormalizedFilter,
    params: &mut Vec<Value>,
) -> Result<String, ApiError> {
    let first = |params: &mut Vec<Value>| -> Result<(), ApiError> {
        let value = filter.values.first().cloned().ok_or_else(|| {
            ApiError::user(format!("Values required for filter: {}", filter.member))
        })?;
        params.push(value);
        Ok(())
    };
    let values = filter.values.len();
    Ok(match filter.operator {
        FilterOperator::Equals | FilterOperator::In => {
            params.extend(filter.values.iter().cloned());
            format!("{expr} IN ({})", placeholders(values.max(1)))
        }
        FilterOperator::NotEquals | FilterOperator::NotIn => {
            params.extend(filter.values.iter().cloned());
            format!("({expr} NOT IN ({}) OR {expr} IS NULL)", placeholders(values.max(1)))
        }
        FilterOperator::Contains | FilterOperator::NotContains => {
            let negate = filter.operator == FilterOperator::NotContains;
            let clause = if negate { "NOT LIKE" } else { "LIKE" };
            let joiner = if negate { " AND " } else { " OR " };
            params.extend(filter.values.iter().cloned());
            let parts = (0..values.max(1))
                .map(|_| format!("{expr} {clause} '%' || ? || '%'"))
                .collect::<Vec<_>>()
                .join(joiner);
            format!("({parts})")
        }
        FilterOperator::Gt | FilterOperator::AfterDate => {
            first(params)?;
            format!("{expr} > ?")
        }
        FilterOperator::Gte => {
            first(params)?;
            format!("{expr} >= ?")
        }
        FilterOperator::Lt | FilterOperator::BeforeDate => {
            first(params)?;
            format!("{expr} < ?")
        }
        FilterOperator::Lte => {
            first(params)?;
            format!("{expr} <= ?")
        }
        FilterOperator::Set => format!("{expr} IS NOT NULL"),
        FilterOperator::NotSet => format!("{expr} IS NULL"),
        FilterOperator::InDateRange | FilterOperator::NotInDateRange => {
            let [start, end] = match filter.values.as_slice() {
                [start, end, ..] => [start.clone(), end.clone()],
                _ => {
                    return Err(ApiError::user(format!(
                        "Date range filter on '{}' needs two values",
                        filter.member
                    )));
                }
            };
            params.push(start);
            params.push(end);
            if filter.operator == FilterOperator::InDateRange {
                format!("{expr} >= ? AND {expr} <= ?")
            } else {
                format!("({expr} < ? OR {expr} > ?)")
            }
        }
    })
}

#[async_trait]
impl QueryCompiler for SchemaCompiler {
    async fn compile(
        &self,
        query: &NormalizedQuery,
        _ctx: &RequestContext,
    ) -> Result<CompiledQuery, ApiError> {
        let cube = self.cube_of(query)?;
        let mut select = Vec::new();
        let mut group_by = Vec::new();
        let mut alias_to_member = BTreeMap::new();
        let mut member_alias = BTreeMap::new();
        let mut params = Vec::new();
        let mut wheres = Vec::new();
        let mut havings = Vec::new();

        let mut add_column = |expr: String, member: String, grouped: bool| {
            let alias = alias_for(&member);
            select.push(format!("{expr} AS {alias}"));
            if grouped {
                group_by.push(select.len().to_string());
            }
            alias_to_member.insert(alias.clone(), member.clone());
            member_alias.insert(member, alias);
        };

        for dimension in &query.dimensions {
            let (_, def, _) = self.lookup(dimension)?;
            add_column(def.column().to_string(), dimension.clone(), true);
        }
        for td in &query.time_dimensions {
            let (_, def, _) = self.lookup(&td.dimension)?;
            if let (Some(granularity), Some(member)) = (td.granularity, td.member_name()) {
                add_column(truncate_time(def.column(), granularity), member, true);
            }
        }
        for measure in &query.measures {
            let (_, def, kind) = self.lookup(measure)?;
            if kind != MemberKind::Measure {
                return Err(ApiError::user(format!("'{measure}' is not a measure")));
            }
            add_column(Self::measure_sql(def, query.ungrouped)?, measure.clone(), false);
        }

        for td in &query.time_dimensions {
            if let Some([start, end]) = &td.date_range {
                let (_, def, _) = self.lookup(&td.dimension)?;
                params.push(Value::String(start.clone()));
                params.push(Value::String(end.clone()));
                wheres.push(format!("{col} >= ? AND {col} <= ?", col = def.column()));
            }
        }
        for filter in &query.filters {
            let (_, def, kind) = self.lookup(&filter.member)?;
            match kind {
                MemberKind::Measure => {
                    let expr = Self::measure_sql(def, query.ungrouped)?;
                    havings.push((expr, filter));
                }
                _ => wheres.push(filter_sql(def.column(), filter, &mut params)?),
            }
        }
        for segment in &query.segments {
            let (_, def, kind) = self.lookup(segment)?;
            if kind != MemberKind::Segment {
                return Err(ApiError::user(format!("'{segment}' is not a segment")));
            }
            wheres.push(format!("({})", def.column()));
        }

        let order = if query.order.is_empty() {
            default_order(query)
        } else {
            query.order.clone()
        };
        let mut order_by = Vec::new();
        for item in &order {
            let alias = member_alias.get(&item.id).ok_or_else(|| {
                ApiError::user(format!("Order member '{}' is not part of the query", item.id))
            })?;
            order_by.push(format!("{alias} {}", if item.desc { "DESC" } else { "ASC" }));
        }

        let source = if cube.sql.trim_start().to_ascii_lowercase().starts_with("select") {
            format!("({})", cube.sql)
        } else {
            cube.sql.clone()
        };
        let mut sql = format!("SELECT {} FROM {source} AS {}", select.join(", "), cube.name);
        if !wheres.is_empty() {
            sql.push_str(&format!(" WHERE {}", wheres.join(" AND ")));
        }
        if !query.ungrouped && !query.measures.is_empty() && !group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
        }
        if !havings.is_empty() {
            let mut clauses = Vec::new();
            for (expr, filter) in havings {
                clauses.push(filter_sql(&expr, filter, &mut params)?);
            }
            sql.push_str(&format!(" HAVING {}", clauses.join(" AND ")));
        }
        if !order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order_by.join(", ")));
        }
        sql.push_str(&format!(
            " LIMIT {}",
            query.row_limit.unwrap_or(DEFAULT_ROW_LIMIT)
        ));
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        Ok(CompiledQuery {
            sql,
            params,
            alias_to_member,
            order,
        })
    }
}

/// First granular time dimension ascending, else first measure descending, else first
/// dimension ascending.
fn default_order(query: &NormalizedQuery) -> Vec<OrderMember> {
    if let Some(member) = query.time_dimensions.iter().find_map(|td| td.member_name()) {
        return vec![OrderMember {
            id: member,
            desc: false,
        }];
    }
    if let Some(measure) = query.measures.first() {
        return vec![OrderMember {
            id: measure.clone(),
            desc: true,
        }];
    }
    query
        .dimensions
        .first()
        .map(|dimension| OrderMember {
            id: dimension.clone(),
            desc: false,
        })
        .into_iter()
        .collect()
}
