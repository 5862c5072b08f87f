#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use record_toggle_core::{
    FieldValue, PersistReceipt, QueryOperator, Record, RecordQuery, RecordStore, ToggleError,
    ACTIVE_FIELD, SYS_ID_FIELD,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

const CLASS_NAME_COLUMN: &str = "sys_class_name";

pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn fetch(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let columns = table_columns(&self.conn, &query.table)?;
        if columns.is_empty() {
            return Err(anyhow!("no such table: {}", query.table));
        }
        for required in [SYS_ID_FIELD, ACTIVE_FIELD, query.column.as_str()] {
            if !columns
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(required))
            {
                return Err(anyhow!(
                    "table {} has no column {required}",
                    query.table
                ));
            }
        }

        let (predicate, bindings) =
            build_predicate(&query.operator, &quote_identifier(&query.column), &query.value)?;
        let mut sql = format!(
            "SELECT * FROM {} WHERE {predicate}",
            quote_identifier(&query.table)
        );
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare query on {}", query.table))?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(ToString::to_string)
            .collect();

        let mut rows = stmt.query(params_from_iter(bindings.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut fields = Vec::with_capacity(names.len());
            for (index, name) in names.iter().enumerate() {
                fields.push((name.as_str(), field_from_sql(row.get_ref(index)?)));
            }
            records.push(record_from_fields(&query.table, fields)?);
        }

        Ok(records)
    }

    /// Writes the dirty fields of `record` and returns how many rows changed.
    pub fn write_dirty(&self, record: &Record) -> Result<usize> {
        let dirty: Vec<(&str, &FieldValue)> = record.dirty_fields().collect();
        if dirty.is_empty() {
            return Ok(1);
        }

        let assignments = dirty
            .iter()
            .enumerate()
            .map(|(index, (name, _))| format!("{} = ?{}", quote_identifier(name), index + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {} = ?{}",
            quote_identifier(record.table()),
            quote_identifier(SYS_ID_FIELD),
            dirty.len() + 1
        );

        let mut values: Vec<SqlValue> = dirty.iter().map(|(_, value)| field_to_sql(value)).collect();
        values.push(SqlValue::Text(record.sys_id().to_string()));

        let changed = self
            .conn
            .execute(&sql, params_from_iter(values.iter()))
            .with_context(|| {
                format!(
                    "failed to update {} record {}",
                    record.table(),
                    record.sys_id()
                )
            })?;

        Ok(changed)
    }
}

impl RecordStore for SqliteRecordStore {
    fn query(&mut self, query: &RecordQuery) -> Result<Vec<Record>, ToggleError> {
        self.fetch(query)
            .map_err(|err| ToggleError::Store(format!("{err:#}")))
    }

    fn persist(&mut self, record: &mut Record) -> Option<PersistReceipt> {
        match self.write_dirty(record) {
            Ok(1) => {
                record.clear_dirty();
                Some(PersistReceipt {
                    sys_id: record.sys_id().to_string(),
                })
            }
            Ok(changed) => {
                tracing::warn!(
                    table = record.table(),
                    sys_id = record.sys_id(),
                    changed,
                    "update did not touch exactly one row"
                );
                None
            }
            Err(err) => {
                tracing::warn!(
                    table = record.table(),
                    sys_id = record.sys_id(),
                    error = %format!("{err:#}"),
                    "update failed"
                );
                None
            }
        }
    }
}

fn build_predicate(
    operator: &QueryOperator,
    column: &str,
    value: &str,
) -> Result<(String, Vec<String>)> {
    let single = || vec![value.to_string()];
    let predicate = match operator {
        QueryOperator::Equals => return Ok((format!("{column} = ?1"), single())),
        QueryOperator::OneOf => {
            let members: Vec<String> = value.split(',').map(ToString::to_string).collect();
            return Ok((membership_predicate(column, "IN", members.len()), members));
        }
        QueryOperator::Native(raw) => match raw.as_str() {
            "!=" => format!("{column} <> ?1"),
            "<" | "<=" | ">" | ">=" => format!("{column} {raw} ?1"),
            "LIKE" => format!("{column} LIKE ?1"),
            "CONTAINS" => format!("instr({column}, ?1) > 0"),
            "DOES NOT CONTAIN" => format!("instr({column}, ?1) = 0"),
            "STARTSWITH" => format!("substr({column}, 1, length(?1)) = ?1"),
            "ENDSWITH" => format!("(length(?1) = 0 OR substr({column}, -length(?1)) = ?1)"),
            "NOT IN" => {
                let members: Vec<String> = value.split(',').map(ToString::to_string).collect();
                return Ok((membership_predicate(column, "NOT IN", members.len()), members));
            }
            other => return Err(anyhow!("unsupported query operator {other}")),
        },
    };

    Ok((predicate, single()))
}

fn membership_predicate(column: &str, keyword: &str, count: usize) -> String {
    let placeholders = (1..=count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{column} {keyword} ({placeholders})")
}

fn record_from_fields(table: &str, fields: Vec<(&str, FieldValue)>) -> Result<Record> {
    let sys_id = fields
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(SYS_ID_FIELD))
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("record in {table} has no sys_id"))?;

    let class_name = fields
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(CLASS_NAME_COLUMN))
        .and_then(|(_, value)| value.as_text())
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);

    let mut record = Record::new(table, sys_id);
    if let Some(class_name) = class_name {
        record = record.with_record_type(class_name);
    }
    for (name, value) in fields {
        if !name.eq_ignore_ascii_case(SYS_ID_FIELD) {
            record = record.with_field(name, value);
        }
    }

    Ok(record)
}

fn field_from_sql(value: ValueRef<'_>) -> FieldValue {
    match value {
        ValueRef::Null => FieldValue::Null,
        ValueRef::Integer(value) => FieldValue::Integer(value),
        ValueRef::Real(value) => FieldValue::Real(value),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            FieldValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn field_to_sql(value: &FieldValue) -> SqlValue {
    match value {
        FieldValue::Null => SqlValue::Null,
        FieldValue::Bool(value) => SqlValue::Integer(bool_to_sql(*value)),
        FieldValue::Integer(value) => SqlValue::Integer(*value),
        FieldValue::Real(value) => SqlValue::Real(*value),
        FieldValue::Text(value) => SqlValue::Text(value.clone()),
    }
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_identifier(table_name)))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    Ok(available)
}

/// Creates a minimal toggleable table and inserts `(sys_id, active)` rows.
pub fn seed_toggle_table(conn: &Connection, table: &str, rows: &[(&str, bool)]) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            sys_id TEXT PRIMARY KEY,
            active INTEGER NOT NULL DEFAULT 1,
            name TEXT,
            sys_updated_on TEXT
         );",
        quote_identifier(table)
    ))
    .with_context(|| format!("failed to create toggle table {table}"))?;

    for (sys_id, active) in rows {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {}(sys_id, active, name, sys_updated_on)
                 VALUES (?1, ?2, ?3, '2015-01-01 00:00:00')",
                quote_identifier(table)
            ),
            params![sys_id, bool_to_sql(*active), format!("{table} {sys_id}")],
        )
        .with_context(|| format!("failed to seed {table} row {sys_id}"))?;
    }

    Ok(())
}

pub fn read_active(conn: &Connection, table: &str, sys_id: &str) -> Result<Option<bool>> {
    let value = conn
        .query_row(
            &format!(
                "SELECT active FROM {} WHERE sys_id = ?1",
                quote_identifier(table)
            ),
            params![sys_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .with_context(|| format!("failed to read {table} row {sys_id}"))?;

    Ok(value.map(|active| active != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_toggle_core::{
        apply_rules, build_query, LogLevel, MemoryLogSink, RunConfig, RunMode, ToggleRule,
    };

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteRecordStore {
        let store = must(SqliteRecordStore::open(Path::new(":memory:")));
        must(seed_toggle_table(
            store.connection(),
            "sc_category",
            &[("cat-a", true), ("cat-b", true), ("cat-c", false)],
        ));
        store
    }

    fn fetch(store: &SqliteRecordStore, rule: &ToggleRule) -> Vec<Record> {
        must(store.fetch(&build_query(rule)))
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        let mut ids: Vec<&str> = records.iter().map(Record::sys_id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn equality_query_returns_matching_record() {
        let store = fixture_store();
        let records = fetch(&store, &ToggleRule::new("sc_category", "sys_id", &["cat-b"]));

        assert_eq!(ids(&records), vec!["cat-b"]);
        assert_eq!(records[0].record_type(), "sc_category");
        assert_eq!(
            records[0].get_field("name"),
            Some(&FieldValue::Text("sc_category cat-b".to_string()))
        );
        assert_eq!(
            records[0].get_field(ACTIVE_FIELD).and_then(FieldValue::as_bool),
            Some(true)
        );
    }

    #[test]
    fn one_of_query_splits_joined_values() {
        let store = fixture_store();
        let records = fetch(
            &store,
            &ToggleRule::new("sc_category", "sys_id", &["cat-a", "cat-c", "missing"]),
        );
        assert_eq!(ids(&records), vec!["cat-a", "cat-c"]);
    }

    #[test]
    fn native_contains_and_limit_are_honoured() {
        let store = fixture_store();
        let rule = ToggleRule::new("sc_category", "name", &["cat-"])
            .with_operator(QueryOperator::parse("CONTAINS"));
        assert_eq!(fetch(&store, &rule).len(), 3);
        assert_eq!(fetch(&store, &rule.with_limit(2)).len(), 2);
    }

    #[test]
    fn startswith_and_not_equal_operators() {
        let store = fixture_store();
        let starts = ToggleRule::new("sc_category", "sys_id", &["cat-a"])
            .with_operator(QueryOperator::parse("STARTSWITH"));
        assert_eq!(ids(&fetch(&store, &starts)), vec!["cat-a"]);

        let not_equal = ToggleRule::new("sc_category", "sys_id", &["cat-a"])
            .with_operator(QueryOperator::parse("!="));
        assert_eq!(ids(&fetch(&store, &not_equal)), vec!["cat-b", "cat-c"]);
    }

    #[test]
    fn suffix_and_pattern_operators() {
        let store = fixture_store();
        let ends = ToggleRule::new("sc_category", "sys_id", &["-b"])
            .with_operator(QueryOperator::parse("ENDSWITH"));
        assert_eq!(ids(&fetch(&store, &ends)), vec!["cat-b"]);

        let like = ToggleRule::new("sc_category", "sys_id", &["cat-%"])
            .with_operator(QueryOperator::parse("LIKE"));
        assert_eq!(fetch(&store, &like).len(), 3);

        let excludes = ToggleRule::new("sc_category", "name", &["cat-a"])
            .with_operator(QueryOperator::parse("DOES NOT CONTAIN"));
        assert_eq!(ids(&fetch(&store, &excludes)), vec!["cat-b", "cat-c"]);

        let after = ToggleRule::new("sc_category", "sys_id", &["cat-a"])
            .with_operator(QueryOperator::parse(">"));
        assert_eq!(ids(&fetch(&store, &after)), vec!["cat-b", "cat-c"]);
    }

    #[test]
    fn not_in_splits_joined_value() {
        let store = fixture_store();
        let query = RecordQuery {
            table: "sc_category".to_string(),
            column: "sys_id".to_string(),
            operator: QueryOperator::parse("NOT IN"),
            value: "cat-a,cat-c".to_string(),
            limit: None,
        };
        assert_eq!(ids(&must(store.fetch(&query))), vec!["cat-b"]);
    }

    #[test]
    fn empty_affix_matches_like_prefix_and_suffix() {
        let store = fixture_store();
        for operator in ["STARTSWITH", "ENDSWITH"] {
            let query = RecordQuery {
                table: "sc_category".to_string(),
                column: "sys_id".to_string(),
                operator: QueryOperator::parse(operator),
                value: String::new(),
                limit: None,
            };
            assert_eq!(must(store.fetch(&query)).len(), 3, "{operator}");
        }
    }

    #[test]
    fn identifiers_match_case_insensitively() {
        let store = fixture_store();
        let records = fetch(&store, &ToggleRule::new("SC_CATEGORY", "SYS_ID", &["cat-a"]));
        assert_eq!(ids(&records), vec!["cat-a"]);
    }

    #[test]
    fn empty_rule_matches_nothing() {
        let store = fixture_store();
        let rule = ToggleRule::new("sc_category", "name", &[])
            .with_operator(QueryOperator::parse("CONTAINS"))
            .with_limit(10);
        assert!(fetch(&store, &rule).is_empty());
    }

    #[test]
    fn misconfigured_queries_surface_as_store_errors() {
        let mut store = fixture_store();
        for rule in [
            ToggleRule::new("sc_missing", "sys_id", &["x"]),
            ToggleRule::new("sc_category", "no_such_column", &["x"]),
            ToggleRule::new("sc_category", "sys_id", &["x"])
                .with_operator(QueryOperator::parse("SOUNDSLIKE")),
        ] {
            let result = store.query(&build_query(&rule));
            assert!(matches!(result, Err(ToggleError::Store(_))), "{rule:?}");
        }
    }

    #[test]
    fn class_name_column_overrides_record_type() {
        let store = fixture_store();
        if let Err(err) = store.connection().execute_batch(
            "CREATE TABLE sc_cat_item (
                sys_id TEXT PRIMARY KEY,
                active INTEGER NOT NULL,
                sys_class_name TEXT
             );
             INSERT INTO sc_cat_item VALUES ('item-1', 1, 'sc_cat_item_producer');",
        ) {
            panic!("test failure: {err}");
        }

        let records = fetch(&store, &ToggleRule::new("sc_cat_item", "sys_id", &["item-1"]));
        assert_eq!(records[0].table(), "sc_cat_item");
        assert_eq!(records[0].record_type(), "sc_cat_item_producer");
    }

    #[test]
    fn persist_writes_only_dirty_fields() {
        let mut store = fixture_store();
        let mut record = fetch(&store, &ToggleRule::new("sc_category", "sys_id", &["cat-a"]))
            .remove(0);
        record.set_field(ACTIVE_FIELD, FieldValue::Bool(false));

        let receipt = store.persist(&mut record);
        assert_eq!(
            receipt,
            Some(PersistReceipt {
                sys_id: "cat-a".to_string()
            })
        );
        assert!(!record.is_dirty());
        assert_eq!(
            must(read_active(store.connection(), "sc_category", "cat-a")),
            Some(false)
        );

        let updated_on: String = match store.connection().query_row(
            "SELECT sys_updated_on FROM sc_category WHERE sys_id = 'cat-a'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(updated_on, "2015-01-01 00:00:00");
    }

    #[test]
    fn persist_of_vanished_record_fails() {
        let mut store = fixture_store();
        let mut record = Record::new("sc_category", "gone");
        record.set_field(ACTIVE_FIELD, FieldValue::Bool(true));
        assert_eq!(store.persist(&mut record), None);
        assert!(record.is_dirty());
    }

    #[test]
    fn live_run_toggles_rows_and_debug_run_leaves_them() {
        let mut store = fixture_store();
        let rules = vec![
            ToggleRule::new("sc_category", "sys_id", &["cat-a", "cat-b"]).with_limit(2),
            ToggleRule::new("sc_category", "sys_id", &["cat-c"]).with_gate(true),
        ];

        let mut sink = MemoryLogSink::new();
        let summary = apply_rules(
            &rules,
            &RunConfig::new(false, RunMode::Debug),
            &mut store,
            &mut sink,
        );
        assert_eq!(summary.records_matched, 2);
        assert_eq!(summary.rules_skipped, 1);
        assert_eq!(
            must(read_active(store.connection(), "sc_category", "cat-a")),
            Some(true)
        );
        assert!(sink
            .messages(LogLevel::Info)
            .all(|message| message.starts_with("DEBUG: ")));

        let mut sink = MemoryLogSink::new();
        let summary = apply_rules(
            &rules,
            &RunConfig::new(false, RunMode::Live),
            &mut store,
            &mut sink,
        );
        assert_eq!(summary.records_updated, 2);
        for sys_id in ["cat-a", "cat-b"] {
            assert_eq!(
                must(read_active(store.connection(), "sc_category", sys_id)),
                Some(false)
            );
        }
        let mut infos: Vec<&str> = sink.messages(LogLevel::Info).collect();
        infos.sort_unstable();
        assert_eq!(
            infos,
            vec![
                "Set sc_category_cat-a to inactive",
                "Set sc_category_cat-b to inactive"
            ]
        );
    }
}
