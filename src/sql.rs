use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Default number of rows for `SELECT * FROM upcoming_bookings`.
pub const DEFAULT_UPCOMING_COUNT: usize = 5;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertClient {
        id: Ulid,
        name: String,
        email: Option<String>,
    },
    DeleteClient {
        id: Ulid,
    },
    SelectClients,
    InsertBooking {
        id: Ulid,
        draft: BookingDraft,
        start: Ms,
        end: Ms,
    },
    BatchInsertBookings {
        bookings: Vec<(Ulid, BookingDraft, Ms, Ms)>,
    },
    UpdateBooking {
        id: Ulid,
        draft: BookingDraft,
        start: Ms,
        end: Ms,
        status: Option<BookingStatus>,
    },
    RescheduleBooking {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectOverlaps {
        filter: BookingFilter,
    },
    SelectUpcoming {
        count: usize,
    },
    SelectAvailability {
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
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
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen { channel: channel_name(&trimmed[7..])? });
    }
    if upper.starts_with("UNLISTEN ") {
        let rest = trimmed[9..].trim();
        if rest == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel: channel_name(rest)? });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
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

fn channel_name(raw: &str) -> Result<String, SqlError> {
    let channel = raw.trim().trim_matches('"').to_lowercase();
    if channel.is_empty() {
        return Err(SqlError::Parse("empty channel name".into()));
    }
    Ok(channel)
}

/// Column order assumed when an INSERT names no columns.
const CLIENT_COLUMNS: &[&str] = &["id", "name", "email"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "client_id",
    "title",
    "start",
    "end",
    "description",
    "location",
    "meeting_url",
    "notes",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "clients" => {
            let row = NamedRow::new("clients", CLIENT_COLUMNS, &columns, &rows[0])?;
            Ok(Command::InsertClient {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_text(row.required("name")?)?,
                email: row.optional("email", parse_text_or_null)?,
            })
        }
        "bookings" => {
            let mut bookings = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let booking = NamedRow::new("bookings", BOOKING_COLUMNS, &columns, values)
                    .and_then(|row| parse_booking_row(&row))
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                bookings.push(booking);
            }
            if bookings.len() == 1 {
                let (id, draft, start, end) = bookings.remove(0);
                Ok(Command::InsertBooking { id, draft, start, end })
            } else {
                Ok(Command::BatchInsertBookings { bookings })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row keyed by column name.
struct NamedRow<'a> {
    values: HashMap<&'a str, &'a Expr>,
}

impl<'a> NamedRow<'a> {
    /// Pair `values` with the INSERT's column list, or with `known` in order
    /// when the list is empty.
    fn new(
        table: &'static str,
        known: &'static [&'static str],
        columns: &'a [String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<&'a str> = if columns.is_empty() {
            if values.len() > known.len() {
                return Err(SqlError::Parse(format!(
                    "{table}: at most {} values, got {}",
                    known.len(),
                    values.len()
                )));
            }
            known[..values.len()].to_vec()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns.iter().map(String::as_str).collect()
        };

        let mut map = HashMap::with_capacity(names.len());
        for (name, value) in names.into_iter().zip(values) {
            if !known.iter().any(|k| *k == name) {
                return Err(SqlError::UnknownColumn(name.to_string()));
            }
            if map.insert(name, value).is_some() {
                return Err(SqlError::Parse(format!("column {name} given twice")));
            }
        }
        Ok(Self { values: map })
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingColumn(column))
    }

    fn optional<T>(
        &self,
        column: &str,
        parse: fn(&Expr) -> Result<Option<T>, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.values.get(column) {
            Some(expr) => parse(expr),
            None => Ok(None),
        }
    }
}

/// `id`, `title`, `start` and `end` are required; `client_id`, `description`,
/// `location`, `meeting_url` and `notes` default to NULL.
fn parse_booking_row(row: &NamedRow<'_>) -> Result<(Ulid, BookingDraft, Ms, Ms), SqlError> {
    let draft = BookingDraft {
        client_id: row.optional("client_id", parse_ulid_or_null)?,
        title: parse_text(row.required("title")?)?,
        description: row.optional("description", parse_text_or_null)?,
        location: row.optional("location", parse_text_or_null)?,
        meeting_url: row.optional("meeting_url", parse_text_or_null)?,
        notes: row.optional("notes", parse_text_or_null)?,
    };
    Ok((
        parse_ulid_expr(row.required("id")?)?,
        draft,
        parse_ms_expr(row.required("start")?)?,
        parse_ms_expr(row.required("end")?)?,
    ))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "clients" => Ok(Command::DeleteClient { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct BookingAssignments {
    client_id: Option<Option<Ulid>>,
    title: Option<String>,
    description: Option<Option<String>>,
    start: Option<Ms>,
    end: Option<Ms>,
    location: Option<Option<String>>,
    meeting_url: Option<Option<String>>,
    notes: Option<Option<String>>,
    status: Option<BookingStatus>,
}

/// `UPDATE bookings SET ... WHERE id = '...'`.
///
/// Only `start`/`end` set → reschedule. Only `status` set → lifecycle change
/// (cancelled or completed). Anything else → full update, which needs
/// `title`, `start` and `end`.
fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut set = BookingAssignments::default();
    let mut others = 0usize;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "start" => set.start = Some(parse_ms_expr(value)?),
            "end" => set.end = Some(parse_ms_expr(value)?),
            "status" => set.status = Some(parse_status(value)?),
            "title" => {
                set.title = Some(parse_text(value)?);
                others += 1;
            }
            "client_id" => {
                set.client_id = Some(parse_ulid_or_null(value)?);
                others += 1;
            }
            "description" => {
                set.description = Some(parse_text_or_null(value)?);
                others += 1;
            }
            "location" => {
                set.location = Some(parse_text_or_null(value)?);
                others += 1;
            }
            "meeting_url" => {
                set.meeting_url = Some(parse_text_or_null(value)?);
                others += 1;
            }
            "notes" => {
                set.notes = Some(parse_text_or_null(value)?);
                others += 1;
            }
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    match (others, set.start, set.end, set.status) {
        (0, Some(start), Some(end), None) => Ok(Command::RescheduleBooking { id, start, end }),
        (0, None, None, Some(status)) => match status {
            BookingStatus::Cancelled | BookingStatus::Completed => {
                Ok(Command::SetBookingStatus { id, status })
            }
            other => Err(SqlError::Unsupported(format!(
                "status '{other}' can only be set together with title, start and end"
            ))),
        },
        (_, start, end, status) => Ok(Command::UpdateBooking {
            id,
            draft: BookingDraft {
                client_id: set.client_id.flatten(),
                title: set.title.ok_or(SqlError::MissingColumn("title"))?,
                description: set.description.flatten(),
                location: set.location.flatten(),
                meeting_url: set.meeting_url.flatten(),
                notes: set.notes.flatten(),
            },
            start: start.ok_or(SqlError::MissingColumn("start"))?,
            end: end.ok_or(SqlError::MissingColumn("end"))?,
            status,
        }),
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
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "clients" => {
            filters.allow_only(&table, &[])?;
            Ok(Command::SelectClients)
        }
        "bookings" => match filters.id {
            Some(id) => {
                filters.allow_only(&table, &["id"])?;
                Ok(Command::SelectBooking { id })
            }
            None => {
                filters.allow_only(&table, BOOKING_FILTERS)?;
                Ok(Command::SelectBookings { filter: filters.booking_filter() })
            }
        },
        "booking_overlaps" => {
            filters.allow_only(&table, BOOKING_FILTERS)?;
            Ok(Command::SelectOverlaps { filter: filters.booking_filter() })
        }
        "upcoming_bookings" => {
            filters.allow_only(&table, &["count"])?;
            Ok(Command::SelectUpcoming {
                count: filters.count.unwrap_or(DEFAULT_UPCOMING_COUNT),
            })
        }
        "availability" => {
            filters.allow_only(&table, &["start", "end", "exclude_id"])?;
            Ok(Command::SelectAvailability {
                start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
                exclude_id: filters.exclude_id,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

const BOOKING_FILTERS: &[&str] = &["start", "end", "client_id", "status"];

/// Predicates from a WHERE clause. Only `AND` chains of the forms below are
/// understood; anything else is rejected rather than ignored.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    client_id: Option<Ulid>,
    status: Option<BookingStatus>,
    exclude_id: Option<Ulid>,
    count: Option<usize>,
    seen: Vec<&'static str>,
}

impl Filters {
    fn booking_filter(&self) -> BookingFilter {
        BookingFilter {
            start_from: self.start,
            end_until: self.end,
            client_id: self.client_id,
            status: self.status,
        }
    }

    fn record(&mut self, column: &'static str) -> Result<(), SqlError> {
        if self.seen.contains(&column) {
            return Err(SqlError::Unsupported(format!("repeated filter on {column}")));
        }
        self.seen.push(column);
        Ok(())
    }

    fn allow_only(&self, table: &str, allowed: &[&str]) -> Result<(), SqlError> {
        match self.seen.iter().find(|c| !allowed.contains(*c)) {
            Some(column) => Err(SqlError::Unsupported(format!("filter on {column} for {table}"))),
            None => Ok(()),
        }
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let (left, op, right) = match expr {
        Expr::Nested(inner) => return collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => (left, op, right),
        other => return Err(SqlError::Unsupported(format!("WHERE {other}"))),
    };
    if *op == ast::BinaryOperator::And {
        collect_filters(left, filters)?;
        return collect_filters(right, filters);
    }

    let column = expr_column_name(left);
    match (column.as_deref(), op) {
        (Some("id"), ast::BinaryOperator::Eq) => {
            filters.record("id")?;
            filters.id = Some(parse_ulid_expr(right)?);
        }
        (Some("client_id"), ast::BinaryOperator::Eq) => {
            filters.record("client_id")?;
            filters.client_id = Some(parse_ulid_expr(right)?);
        }
        (Some("exclude_id"), ast::BinaryOperator::Eq) => {
            filters.record("exclude_id")?;
            filters.exclude_id = parse_ulid_or_null(right)?;
        }
        (Some("count"), ast::BinaryOperator::Eq) => {
            filters.record("count")?;
            let n = parse_i64_expr(right)?;
            filters.count =
                Some(usize::try_from(n).map_err(|_| SqlError::Parse(format!("bad count: {n}")))?);
        }
        (Some("status"), ast::BinaryOperator::Eq) => {
            filters.record("status")?;
            // 'all' is how the calendar UI spells "no status filter".
            let text = parse_text(right)?;
            if !text.eq_ignore_ascii_case("all") {
                filters.status = Some(text.parse().map_err(SqlError::Parse)?);
            }
        }
        (Some("start"), ast::BinaryOperator::GtEq) => {
            filters.record("start")?;
            filters.start = Some(parse_ms_expr(right)?);
        }
        (Some("end"), ast::BinaryOperator::LtEq) => {
            filters.record("end")?;
            filters.end = Some(parse_ms_expr(right)?);
        }
        _ => return Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_ulid_expr(expr).map(Some)
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_text(expr).map(Some)
    }
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Unix milliseconds, either as a number or as an RFC 3339 string
/// (`'2025-03-01T10:00:00Z'`, `'2025-03-01T10:00:00+01:00'`).
fn parse_ms_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return parse_timestamp(s);
    }
    parse_i64_expr(expr)
}

pub fn parse_timestamp(s: &str) -> Result<Ms, SqlError> {
    chrono::DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::Parse(format!("bad timestamp '{s}': {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
