use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::config::parse_timestamp;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailability {
        start: Ms,
        end: Ms,
    },
    SelectSlots {
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectReservations {
        customer_id: Option<CustomerId>,
    },
    InsertReservation {
        customer_id: CustomerId,
        start: Ms,
        end: Ms,
        participants: u32,
    },
    /// Without `customer_id` the statement acts with administrator rights.
    UpdateReservation {
        id: Ulid,
        customer_id: Option<CustomerId>,
        patch: ReservationPatch,
    },
    ConfirmReservation {
        id: Ulid,
    },
    DeleteReservation {
        id: Ulid,
        customer_id: Option<CustomerId>,
    },
}

/// Column order assumed by `INSERT INTO reservations VALUES (...)` without a
/// column list.
const INSERT_COLUMNS: [&str; 4] = ["customer_id", "start", "end", "participants"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Query(query) => parse_select(query),
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        other => Err(SqlError::Unsupported(format!("{other}"))),
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
        filters.collect(selection)?;
    }

    match table.as_str() {
        "availability" => {
            filters.reject_keys(&table)?;
            Ok(Command::SelectAvailability {
                start: filters.start_from.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.end_to.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "slots" => {
            filters.reject_keys(&table)?;
            Ok(Command::SelectSlots {
                start: filters.start_from,
                end: filters.end_to,
            })
        }
        "reservations" => {
            if filters.id.is_some() || filters.start_from.is_some() || filters.end_to.is_some() {
                return Err(SqlError::Unsupported(
                    "reservations can only be filtered by customer_id".into(),
                ));
            }
            Ok(Command::SelectReservations {
                customer_id: filters.customer_id,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }

    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity("reservations", columns.len(), values.len()));
    }

    let (mut customer_id, mut start, mut end, mut participants) = (None, None, None, None);
    for (column, value) in columns.iter().zip(values) {
        match column.as_str() {
            "customer_id" => customer_id = Some(parse_customer_id(value)?),
            "start" => start = Some(parse_timestamp_expr(value)?),
            "end" => end = Some(parse_timestamp_expr(value)?),
            "participants" => participants = Some(parse_u32(value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::InsertReservation {
        customer_id: customer_id.ok_or(SqlError::MissingColumn("customer_id"))?,
        start: start.ok_or(SqlError::MissingColumn("start"))?,
        end: end.ok_or(SqlError::MissingColumn("end"))?,
        participants: participants.ok_or(SqlError::MissingColumn("participants"))?,
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let (id, customer_id) = parse_key_filter(selection)?;

    let mut patch = ReservationPatch::default();
    let mut confirmed = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        let value = &assignment.value;
        match column.as_str() {
            "start" => patch.start = Some(parse_timestamp_expr(value)?),
            "end" => patch.end = Some(parse_timestamp_expr(value)?),
            "participants" => patch.participants = Some(parse_u32(value)?),
            "confirmed" => confirmed = Some(parse_bool(value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    match confirmed {
        None => Ok(Command::UpdateReservation { id, customer_id, patch }),
        Some(true) if patch.is_empty() && customer_id.is_none() => Ok(Command::ConfirmReservation { id }),
        Some(true) if !patch.is_empty() => Err(SqlError::Unsupported(
            "confirmed cannot be set together with other columns".into(),
        )),
        Some(true) => Err(SqlError::Unsupported("confirmation is not scoped to a customer".into())),
        Some(false) => Err(SqlError::Unsupported("a reservation cannot be unconfirmed".into())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let (id, customer_id) = parse_key_filter(&delete.selection)?;
    Ok(Command::DeleteReservation { id, customer_id })
}

/// `WHERE id = ... [AND customer_id = ...]`, nothing else.
fn parse_key_filter(selection: &Option<Expr>) -> Result<(Ulid, Option<CustomerId>), SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Filters::default();
    filters.collect(sel)?;
    if filters.start_from.is_some() || filters.end_to.is_some() {
        return Err(SqlError::Unsupported("range filter on a single-row statement".into()));
    }
    Ok((filters.id.ok_or(SqlError::MissingFilter("id"))?, filters.customer_id))
}

// ── WHERE clause ──────────────────────────────────────────────

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    customer_id: Option<CustomerId>,
    start_from: Option<Ms>,
    end_to: Option<Ms>,
}

impl Filters {
    /// Walk a conjunction of simple comparisons.
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left);
                match (op, col.as_deref()) {
                    (ast::BinaryOperator::And, _) => {
                        self.collect(left)?;
                        self.collect(right)
                    }
                    (ast::BinaryOperator::Eq, Some("id")) => {
                        self.id = Some(parse_ulid_expr(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::Eq, Some("customer_id")) => {
                        self.customer_id = Some(parse_customer_id(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::GtEq, Some("start")) => {
                        self.start_from = Some(parse_timestamp_expr(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::LtEq, Some("end")) => {
                        self.end_to = Some(parse_timestamp_expr(right)?);
                        Ok(())
                    }
                    _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
                }
            }
            _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
        }
    }

    /// Slot tables have no id or owner.
    fn reject_keys(&self, table: &str) -> Result<(), SqlError> {
        if self.id.is_some() || self.customer_id.is_some() {
            return Err(SqlError::Unsupported(format!("{table} can only be filtered by start and end")));
        }
        Ok(())
    }
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let v = parse_i64_expr(expr)?;
        v.checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("integer out of range: -({v})")))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Unix milliseconds as a number, or any string `parse_timestamp` accepts.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            parse_timestamp(s).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
        }
        _ => parse_i64_expr(expr),
    }
}

fn parse_customer_id(expr: &Expr) -> Result<CustomerId, SqlError> {
    let v = parse_i64_expr(expr)?;
    CustomerId::try_from(v).map_err(|_| SqlError::Parse(format!("bad customer_id: {v}")))
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

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_select_availability() {
        let sql = "SELECT * FROM availability WHERE start >= 1000 AND \"end\" <= 2000";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability { start: 1000, end: 2000 }
        );
    }

    #[test]
    fn parse_select_availability_with_dates() {
        let sql = "SELECT * FROM availability WHERE start >= '2025-06-01 10:00:00' AND \"end\" <= '2025-06-01T12:00:00Z'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability {
                start: 1_748_772_000_000,
                end: 1_748_779_200_000,
            }
        );
    }

    #[test]
    fn negated_integers_are_range_checked() {
        let sql = "SELECT * FROM availability WHERE start >= -'-1000' AND \"end\" <= 2000";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability { start: 1000, end: 2000 }
        );

        let sql = "SELECT * FROM availability WHERE start >= -'-9223372036854775808' AND \"end\" <= 2000";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn select_availability_needs_both_bounds() {
        let sql = "SELECT * FROM availability WHERE start >= 1000";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_select_slots_unfiltered() {
        assert_eq!(
            parse_sql("SELECT * FROM slots").unwrap(),
            Command::SelectSlots { start: None, end: None }
        );
    }

    #[test]
    fn parse_select_reservations() {
        assert_eq!(
            parse_sql("SELECT * FROM reservations WHERE customer_id = 7").unwrap(),
            Command::SelectReservations { customer_id: Some(7) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM reservations").unwrap(),
            Command::SelectReservations { customer_id: None }
        );
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = r#"INSERT INTO reservations (customer_id, start, "end", participants) VALUES (42, 1000, 2000, 3)"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertReservation {
                customer_id: 42,
                start: 1000,
                end: 2000,
                participants: 3,
            }
        );
    }

    #[test]
    fn parse_insert_reordered_columns() {
        let sql = r#"INSERT INTO reservations (participants, "end", start, customer_id) VALUES (3, '2025-06-01 12:00:00', '2025-06-01 10:00:00', 42)"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertReservation {
                customer_id: 42,
                start: 1_748_772_000_000,
                end: 1_748_779_200_000,
                participants: 3,
            }
        );
    }

    #[test]
    fn parse_insert_without_column_list() {
        let sql = "INSERT INTO reservations VALUES ('42', '1000', '2000', '3')";
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::InsertReservation { customer_id: 42, participants: 3, .. }
        ));
    }

    #[test]
    fn insert_rejects_negative_participants() {
        let sql = r#"INSERT INTO reservations (customer_id, start, "end", participants) VALUES (1, 1000, 2000, -1)"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn insert_missing_column() {
        let sql = r#"INSERT INTO reservations (customer_id, start, "end") VALUES (1, 1000, 2000)"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("participants"))));
    }

    #[test]
    fn parse_customer_update() {
        let sql = format!("UPDATE reservations SET participants = 5 WHERE id = '{ID}' AND customer_id = 9");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateReservation {
                id: Ulid::from_string(ID).unwrap(),
                customer_id: Some(9),
                patch: ReservationPatch {
                    participants: Some(5),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn parse_admin_update_of_span() {
        let sql = format!(r#"UPDATE reservations SET start = 1000, "end" = 5000 WHERE id = '{ID}'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateReservation {
                id: Ulid::from_string(ID).unwrap(),
                customer_id: None,
                patch: ReservationPatch {
                    start: Some(1000),
                    end: Some(5000),
                    participants: None,
                },
            }
        );
    }

    #[test]
    fn parse_confirm() {
        let sql = format!("UPDATE reservations SET confirmed = true WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ConfirmReservation {
                id: Ulid::from_string(ID).unwrap()
            }
        );
    }

    #[test]
    fn confirm_cannot_mix_with_edits_or_be_undone() {
        let mixed = format!("UPDATE reservations SET confirmed = true, participants = 2 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&mixed), Err(SqlError::Unsupported(_))));
        let undo = format!("UPDATE reservations SET confirmed = false WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&undo), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_requires_id() {
        let sql = "UPDATE reservations SET participants = 5 WHERE customer_id = 9";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn update_unknown_column() {
        let sql = format!("UPDATE reservations SET owner = 5 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_delete() {
        let sql = format!("DELETE FROM reservations WHERE (id = '{ID}' AND customer_id = 3)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteReservation {
                id: Ulid::from_string(ID).unwrap(),
                customer_id: Some(3),
            }
        );
    }

    #[test]
    fn or_filters_are_rejected() {
        let sql = format!("DELETE FROM reservations WHERE id = '{ID}' OR customer_id = 3");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = "INSERT INTO bookings (customer_id) VALUES (1)";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
