use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::ReservationStatus;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertMember {
        id: Ulid,
        name: String,
    },
    InsertSubscription {
        id: Ulid,
        member_id: Ulid,
        plan: String,
        starts_on: NaiveDate,
        ends_on: NaiveDate,
    },
    CloseSubscription {
        id: Ulid,
    },
    InsertEntitlements {
        /// (entry id, subscription id, benefit, allocated)
        rows: Vec<(Ulid, Ulid, String, u32)>,
    },
    InsertResource {
        id: Ulid,
        name: String,
        capacity: u32,
        benefit: Option<String>,
    },
    UpdateResource {
        id: Ulid,
        name: String,
        capacity: u32,
    },
    RetireResource {
        id: Ulid,
    },
    InsertSlot {
        id: Ulid,
        resource_id: Ulid,
        weekday: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    },
    RetireSlot {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        member_id: Ulid,
        resource_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        returning: bool,
    },
    CancelReservation {
        id: Ulid,
        actor: Option<String>,
        reason: Option<String>,
    },
    MarkAttended {
        id: Ulid,
        actor: Option<String>,
    },
    MarkNoShow {
        id: Ulid,
        actor: Option<String>,
    },
    SelectAvailability {
        resource_id: Ulid,
        date: NaiveDate,
    },
    SelectMemberReservations {
        member_id: Ulid,
        status: Option<ReservationStatus>,
        max_rows: Option<usize>,
    },
    SelectCalendar {
        resource_ids: Option<Vec<Ulid>>,
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectLedger {
        member_id: Ulid,
    },
    SelectResources,
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let all_rows = extract_insert_rows(insert)?;
    let values = &all_rows[0];
    if all_rows.len() > 1 && table != "entitlements" {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }

    match table.as_str() {
        "members" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("members", 2, values.len()));
            }
            Ok(Command::InsertMember {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "subscriptions" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("subscriptions", 5, values.len()));
            }
            Ok(Command::InsertSubscription {
                id: parse_ulid(&values[0])?,
                member_id: parse_ulid(&values[1])?,
                plan: parse_string(&values[2])?,
                starts_on: parse_date(&values[3])?,
                ends_on: parse_date(&values[4])?,
            })
        }
        "entitlements" => {
            let mut rows = Vec::with_capacity(all_rows.len());
            for (i, row) in all_rows.iter().enumerate() {
                if row.len() < 4 {
                    return Err(SqlError::WrongArity("entitlements row", 4, row.len()));
                }
                rows.push((
                    parse_ulid(&row[0]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                    parse_ulid(&row[1]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                    parse_string(&row[2]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                    parse_u32(&row[3]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                ));
            }
            Ok(Command::InsertEntitlements { rows })
        }
        "resources" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("resources", 3, values.len()));
            }
            let benefit = if values.len() >= 4 {
                parse_string_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertResource {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                capacity: parse_u32(&values[2])?,
                benefit,
            })
        }
        "slots" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("slots", 5, values.len()));
            }
            Ok(Command::InsertSlot {
                id: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
                weekday: parse_weekday(&values[2])?,
                start: parse_time(&values[3])?,
                end: parse_time(&values[4])?,
            })
        }
        "reservations" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("reservations", 5, values.len()));
            }
            Ok(Command::InsertReservation {
                id: parse_ulid(&values[0])?,
                member_id: parse_ulid(&values[1])?,
                resource_id: parse_ulid(&values[2])?,
                slot_id: parse_ulid(&values[3])?,
                date: parse_date(&values[4])?,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    // DELETE retires catalog rows and cancels reservations; nothing is
    // physically removed (reservations are audit-retained).
    match table.as_str() {
        "resources" => Ok(Command::RetireResource { id }),
        "slots" => Ok(Command::RetireSlot { id }),
        "reservations" => Ok(Command::CancelReservation { id, actor: None, reason: None }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut fields: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = assignment_column(a)?;
        fields.push((col, &a.value));
    }
    let get = |name: &str| fields.iter().find(|(c, _)| c == name).map(|(_, e)| *e);

    match table.as_str() {
        "subscriptions" => match get("status").map(parse_string).transpose()?.as_deref() {
            Some("closed") => Ok(Command::CloseSubscription { id }),
            Some(other) => Err(SqlError::Parse(format!("bad subscription status: {other}"))),
            None => Err(SqlError::MissingFilter("status")),
        },
        "resources" => {
            if let Some(active) = get("active") {
                if parse_bool(active)? {
                    return Err(SqlError::Unsupported("re-activating a resource".into()));
                }
                return Ok(Command::RetireResource { id });
            }
            let name = get("name").ok_or(SqlError::MissingFilter("name"))?;
            let capacity = get("capacity").ok_or(SqlError::MissingFilter("capacity"))?;
            Ok(Command::UpdateResource {
                id,
                name: parse_string(name)?,
                capacity: parse_u32(capacity)?,
            })
        }
        "reservations" => {
            let status = get("status").ok_or(SqlError::MissingFilter("status"))?;
            let actor = get("actor").map(parse_string).transpose()?;
            let reason = get("reason").map(parse_string).transpose()?;
            match parse_string(status)?.as_str() {
                "cancelled" => Ok(Command::CancelReservation { id, actor, reason }),
                "attended" => Ok(Command::MarkAttended { id, actor }),
                "no_show" => Ok(Command::MarkNoShow { id, actor }),
                other => Err(SqlError::Parse(format!("bad reservation status: {other}"))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
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

    match table.as_str() {
        "availability" => {
            let (mut resource_id, mut date) = (None, None);
            if let Some(selection) = &select.selection {
                walk_filters(selection, &mut |col, op, expr| {
                    match (col, op) {
                        ("resource_id", ast::BinaryOperator::Eq) => {
                            resource_id = Some(parse_ulid(expr)?);
                        }
                        ("date", ast::BinaryOperator::Eq) => {
                            date = Some(parse_date(expr)?);
                        }
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            Ok(Command::SelectAvailability {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        "reservations" => {
            let (mut member_id, mut status, mut max_rows) = (None, None, None);
            if let Some(selection) = &select.selection {
                walk_filters(selection, &mut |col, op, expr| {
                    match (col, op) {
                        ("member_id", ast::BinaryOperator::Eq) => {
                            member_id = Some(parse_ulid(expr)?);
                        }
                        ("status", ast::BinaryOperator::Eq) => {
                            status = Some(parse_status(expr)?);
                        }
                        ("max_rows", ast::BinaryOperator::Eq) => {
                            max_rows = Some(parse_i64_expr(expr)? as usize);
                        }
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            Ok(Command::SelectMemberReservations {
                member_id: member_id.ok_or(SqlError::MissingFilter("member_id"))?,
                status,
                max_rows,
            })
        }
        "calendar" => {
            let (mut resource_ids, mut from, mut to) = (None::<Vec<Ulid>>, None, None);
            if let Some(selection) = &select.selection {
                collect_calendar_filters(selection, &mut resource_ids, &mut from, &mut to)?;
            }
            Ok(Command::SelectCalendar {
                resource_ids,
                from: from.ok_or(SqlError::MissingFilter("start"))?,
                to: to.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "ledger" => {
            let mut member_id = None;
            if let Some(selection) = &select.selection {
                walk_filters(selection, &mut |col, op, expr| {
                    if col == "member_id" && op == &ast::BinaryOperator::Eq {
                        member_id = Some(parse_ulid(expr)?);
                    }
                    Ok(())
                })?;
            }
            Ok(Command::SelectLedger {
                member_id: member_id.ok_or(SqlError::MissingFilter("member_id"))?,
            })
        }
        "resources" => Ok(Command::SelectResources),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk an AND-tree of binary comparisons, invoking the callback with
/// (column, operator, value expression).
fn walk_filters(
    expr: &Expr,
    f: &mut impl FnMut(&str, &ast::BinaryOperator, &Expr) -> Result<(), SqlError>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        if op == &ast::BinaryOperator::And {
            walk_filters(left, f)?;
            walk_filters(right, f)?;
        } else if let Some(col) = expr_column_name(left) {
            f(&col, op, right)?;
        }
    }
    Ok(())
}

fn collect_calendar_filters(
    expr: &Expr,
    resource_ids: &mut Option<Vec<Ulid>>,
    from: &mut Option<NaiveDate>,
    to: &mut Option<NaiveDate>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_calendar_filters(left, resource_ids, from, to)?;
                collect_calendar_filters(right, resource_ids, from, to)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("resource_id") {
                    *resource_ids = Some(vec![parse_ulid(right)?]);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *from = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *to = Some(parse_date(right)?);
                }
            }
            _ => {}
        },
        Expr::InList { expr: left, list, negated: false } => {
            if expr_column_name(left).as_deref() == Some("resource_id") {
                let mut ids = Vec::with_capacity(list.len());
                for item in list {
                    ids.push(parse_ulid(item)?);
                }
                *resource_ids = Some(ids);
            }
        }
        _ => {}
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

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s.parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => {
                s.parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time '{s}': {e}")))
}

fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_string(expr)?;
    s.parse::<Weekday>()
        .map_err(|_| SqlError::Parse(format!("bad weekday: {s}")))
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let s = parse_string(expr)?;
    match s.as_str() {
        "confirmed" => Ok(ReservationStatus::Confirmed),
        "attended" => Ok(ReservationStatus::Attended),
        "no_show" => Ok(ReservationStatus::NoShow),
        "cancelled" => Ok(ReservationStatus::Cancelled),
        other => Err(SqlError::Parse(format!("bad status: {other}"))),
    }
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
        }
    }
}

impl std::error::Error for SqlError {}
