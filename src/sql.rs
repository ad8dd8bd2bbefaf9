use chrono::{DateTime, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{NewAppointment, QueryDuration};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProvider {
        id: Ulid,
        name: Option<String>,
    },
    DeleteProvider {
        id: Ulid,
    },
    InsertSchedule {
        provider_id: Ulid,
        schedule: Schedule,
    },
    InsertService {
        id: Ulid,
        provider_id: Ulid,
        name: String,
        duration_minutes: u32,
        price: i64,
    },
    DeleteService {
        id: Ulid,
    },
    InsertAppointment(NewAppointment),
    UpdateAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    RescheduleAppointment {
        id: Ulid,
        start: Ms,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectFreeSlots {
        provider_id: Ulid,
        date: NaiveDate,
        duration: QueryDuration,
    },
    SelectDisabledHours {
        provider_id: Ulid,
        date: NaiveDate,
        duration: QueryDuration,
    },
    SelectIntervalFree {
        provider_id: Ulid,
        start: Ms,
        duration_minutes: u32,
    },
    SelectProviders,
    SelectServices {
        provider_id: Ulid,
    },
    SelectSchedule {
        provider_id: Ulid,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectAppointments {
        provider_id: Ulid,
        date: Option<NaiveDate>,
    },
    SelectSummary {
        provider_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN ") {
        return Ok(Command::Listen {
            channel: channel_name(rest),
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN ") {
        let channel = channel_name(rest);
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword).then(|| &sql[keyword.len()..])
}

fn channel_name(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "providers" => {
            let row = insert_row(insert, "providers", &["id", "name"])?;
            Ok(Command::InsertProvider {
                id: parse_ulid(row.required("id")?)?,
                name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "schedules" => {
            let row = insert_row(insert, "schedules", &["provider_id", "schedule"])?;
            let json = parse_string(row.required("schedule")?)?;
            Ok(Command::InsertSchedule {
                provider_id: parse_ulid(row.required("provider_id")?)?,
                schedule: schedule_from_json(&json)?,
            })
        }
        "services" => {
            let row = insert_row(
                insert,
                "services",
                &["id", "provider_id", "name", "duration", "price"],
            )?;
            Ok(Command::InsertService {
                id: parse_ulid(row.required("id")?)?,
                provider_id: parse_ulid(row.required("provider_id")?)?,
                name: parse_string(row.required("name")?)?,
                duration_minutes: parse_u32(row.required("duration")?)?,
                price: row.get("price").map(parse_i64).transpose()?.unwrap_or(0),
            })
        }
        "appointments" => {
            let row = insert_row(
                insert,
                "appointments",
                &[
                    "id",
                    "provider_id",
                    "service_id",
                    "start",
                    "customer_name",
                    "customer_phone",
                    "idempotency_key",
                ],
            )?;
            let optional = |col: &str| -> Result<Option<String>, SqlError> {
                Ok(row.get(col).map(parse_string_or_null).transpose()?.flatten())
            };
            Ok(Command::InsertAppointment(NewAppointment {
                id: parse_ulid(row.required("id")?)?,
                provider_id: parse_ulid(row.required("provider_id")?)?,
                service_id: parse_ulid(row.required("service_id")?)?,
                start: parse_instant(row.required("start")?)?,
                customer_name: optional("customer_name")?,
                customer_phone: optional("customer_phone")?,
                idempotency_key: optional("idempotency_key")?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "providers" => Ok(Command::DeleteProvider { id }),
        "services" => Ok(Command::DeleteService { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let [assignment] = assignments else {
        return Err(SqlError::Unsupported(
            "UPDATE appointments sets exactly one of status or start".into(),
        ));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    };
    match column.as_deref() {
        Some("status") => {
            let raw = parse_string(&assignment.value)?;
            let status = raw
                .parse()
                .map_err(|_| SqlError::InvalidValue(format!("unknown status: {raw}")))?;
            Ok(Command::UpdateAppointmentStatus { id, status })
        }
        Some("start") => Ok(Command::RescheduleAppointment {
            id,
            start: parse_instant(&assignment.value)?,
        }),
        _ => Err(SqlError::Unsupported(format!(
            "cannot update column {}",
            column.unwrap_or_default()
        ))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "free_slots" => Ok(Command::SelectFreeSlots {
            provider_id: filters.ulid("provider_id")?,
            date: filters.date("date")?,
            duration: match filters.duration()? {
                QueryDuration::Default => return Err(SqlError::MissingFilter("service_id")),
                d => d,
            },
        }),
        "disabled_hours" => Ok(Command::SelectDisabledHours {
            provider_id: filters.ulid("provider_id")?,
            date: filters.date("date")?,
            duration: filters.duration()?,
        }),
        "interval_free" => Ok(Command::SelectIntervalFree {
            provider_id: filters.ulid("provider_id")?,
            start: parse_instant(filters.required("start")?)?,
            duration_minutes: parse_u32(filters.required("duration")?)?,
        }),
        "providers" => Ok(Command::SelectProviders),
        "services" => Ok(Command::SelectServices {
            provider_id: filters.ulid("provider_id")?,
        }),
        "schedules" => Ok(Command::SelectSchedule {
            provider_id: filters.ulid("provider_id")?,
        }),
        "appointments" => {
            if let Some(id) = filters.get("id") {
                return Ok(Command::SelectAppointment { id: parse_ulid(id)? });
            }
            Ok(Command::SelectAppointments {
                provider_id: filters.ulid("provider_id")?,
                date: filters.get("date").map(parse_date).transpose()?,
            })
        }
        "summary" => Ok(Command::SelectSummary {
            provider_id: filters.ulid("provider_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` pairs of a WHERE clause joined by AND.
#[derive(Default)]
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.required(col)?)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.required(col)?)
    }

    fn duration(&self) -> Result<QueryDuration, SqlError> {
        match (self.get("service_id"), self.get("duration")) {
            (Some(_), Some(_)) => Err(SqlError::Unsupported(
                "filter on service_id or duration, not both".into(),
            )),
            (Some(id), None) => Ok(QueryDuration::Service(parse_ulid(id)?)),
            (None, Some(minutes)) => Ok(QueryDuration::Minutes(parse_u32(minutes)?)),
            (None, None) => Ok(QueryDuration::Default),
        }
    }
}

fn extract_eq_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_eq_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, filters)?;
                extract_eq_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                filters.0.push((col, right.as_ref().clone()));
            }
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

// ── Schedule JSON ─────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleJson {
    working_days: Vec<DayJson>,
    #[serde(default = "default_slot_duration")]
    slot_duration: u32,
    #[serde(default)]
    utc_offset_minutes: i32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DayJson {
    day: String,
    #[serde(default)]
    is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<String>,
    #[serde(default)]
    break_times: Vec<BreakJson>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakJson {
    start_time: String,
    end_time: String,
}

fn default_slot_duration() -> u32 {
    30
}

/// Decode the client schedule document. Structural checks (ordering, overlaps
/// with the window) are left to the engine.
pub fn schedule_from_json(json: &str) -> Result<Schedule, SqlError> {
    let doc: ScheduleJson = serde_json::from_str(json)
        .map_err(|e| SqlError::InvalidValue(format!("schedule json: {e}")))?;

    let hhmm = |s: &str| {
        parse_hhmm(s).ok_or_else(|| SqlError::InvalidValue(format!("bad time of day: {s}")))
    };
    let mut days = Vec::with_capacity(doc.working_days.len());
    for d in doc.working_days {
        let weekday: Weekday = d
            .day
            .parse()
            .map_err(|_| SqlError::InvalidValue(format!("unknown day: {}", d.day)))?;
        let mut breaks = Vec::with_capacity(d.break_times.len());
        for b in &d.break_times {
            breaks.push(BreakTime {
                start: hhmm(&b.start_time)?,
                end: hhmm(&b.end_time)?,
            });
        }
        days.push(DayHours {
            weekday,
            active: d.is_active,
            start: d.start_time.as_deref().map(hhmm).transpose()?,
            end: d.end_time.as_deref().map(hhmm).transpose()?,
            breaks,
        });
    }
    Ok(Schedule {
        days,
        slot_granularity: doc.slot_duration,
        utc_offset_minutes: doc.utc_offset_minutes,
    })
}

/// Inverse of [`schedule_from_json`], used to answer `SELECT ... FROM schedules`.
pub fn schedule_to_json(schedule: &Schedule) -> String {
    let doc = ScheduleJson {
        working_days: schedule
            .days
            .iter()
            .map(|d| DayJson {
                day: weekday_name(d.weekday).into(),
                is_active: d.active,
                start_time: d.start.map(format_hhmm),
                end_time: d.end.map(format_hhmm),
                break_times: d
                    .breaks
                    .iter()
                    .map(|b| BreakJson {
                        start_time: format_hhmm(b.start),
                        end_time: format_hhmm(b.end),
                    })
                    .collect(),
            })
            .collect(),
        slot_duration: schedule.slot_granularity,
        utc_offset_minutes: schedule.utc_offset_minutes,
    };
    // Plain strings and integers only; serialization cannot fail.
    serde_json::to_string(&doc).unwrap_or_default()
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the table's
/// declared order applies.
struct Row(Vec<(String, Expr)>);

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    declared: &[&str],
) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        declared.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    // Without a column list trailing optional columns may be left out.
    let arity_ok = if insert.columns.is_empty() {
        values.len() <= columns.len()
    } else {
        values.len() == columns.len()
    };
    if !arity_ok {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
        return Err(SqlError::Unsupported(format!("{table} has no column {unknown}")));
    }
    Ok(Row(columns.into_iter().zip(values).collect()))
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Unix ms as a number, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if let Ok(ms) = s.parse::<Ms>() {
            return Ok(ms);
        }
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}")));
    }
    parse_i64(expr)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
