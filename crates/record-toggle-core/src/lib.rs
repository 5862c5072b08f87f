use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const DEFAULT_SOURCE: &str = "Toggle_Script";
pub const ACTIVE_FIELD: &str = "active";
pub const SYS_ID_FIELD: &str = "sys_id";

const QUERY_VALUE_SEPARATOR: &str = ",";
const DEBUG_PREFIX: &str = "DEBUG: ";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ToggleError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QueryOperator {
    Equals,
    OneOf,
    /// Store-native operator string, passed through without validation.
    Native(String),
}

impl QueryOperator {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Equals => "=",
            Self::OneOf => "IN",
            Self::Native(raw) => raw,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "=" => Self::Equals,
            "IN" => Self::OneOf,
            other => Self::Native(other.to_string()),
        }
    }
}

impl From<String> for QueryOperator {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<QueryOperator> for String {
    fn from(value: QueryOperator) -> Self {
        value.as_str().to_string()
    }
}

impl Display for QueryOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Debug,
    Live,
}

impl RunMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToggleRule {
    pub table: String,
    pub search_column: String,
    #[serde(default)]
    pub search_strings: Vec<String>,
    #[serde(default)]
    pub search_limit: Option<u32>,
    #[serde(default)]
    pub query_operator: Option<QueryOperator>,
    /// Restricts the rule to runs whose target state matches.
    #[serde(default)]
    pub target_active_value: Option<bool>,
}

impl ToggleRule {
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        search_column: impl Into<String>,
        search_strings: &[&str],
    ) -> Self {
        Self {
            table: table.into(),
            search_column: search_column.into(),
            search_strings: search_strings.iter().map(ToString::to_string).collect(),
            search_limit: None,
            query_operator: None,
            target_active_value: None,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.search_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_operator(mut self, operator: QueryOperator) -> Self {
        self.query_operator = Some(operator);
        self
    }

    #[must_use]
    pub fn with_gate(mut self, target_active_value: bool) -> Self {
        self.target_active_value = Some(target_active_value);
        self
    }

    #[must_use]
    pub fn applies_to(&self, target_state: bool) -> bool {
        match self.target_active_value {
            Some(required) => required == target_state,
            None => true,
        }
    }

    /// Validates the structural fields of a rule.
    ///
    /// # Errors
    /// Returns [`ToggleError::Configuration`] when the table or search
    /// column is blank.
    pub fn validate(&self) -> Result<(), ToggleError> {
        if self.table.trim().is_empty() {
            return Err(ToggleError::Configuration(
                "table MUST be provided for every rule".to_string(),
            ));
        }

        if self.search_column.trim().is_empty() {
            return Err(ToggleError::Configuration(format!(
                "search_column MUST be provided for table {}",
                self.table
            )));
        }

        Ok(())
    }
}

/// Picks the comparison operator for a rule.
///
/// Checked in order: a multi-value match always becomes set membership,
/// then an explicitly configured operator, then equality.
#[must_use]
pub fn resolve_operator(rule: &ToggleRule) -> QueryOperator {
    if rule.search_strings.len() > 1 {
        return QueryOperator::OneOf;
    }

    match &rule.query_operator {
        Some(operator) => operator.clone(),
        None => QueryOperator::Equals,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordQuery {
    pub table: String,
    pub column: String,
    pub operator: QueryOperator,
    pub value: String,
    pub limit: Option<u32>,
}

#[must_use]
pub fn build_query(rule: &ToggleRule) -> RecordQuery {
    // An empty match set must never widen into "match everything".
    let limit = if rule.search_strings.is_empty() {
        Some(0)
    } else {
        rule.search_limit
    };

    RecordQuery {
        table: rule.table.clone(),
        column: rule.search_column.clone(),
        operator: resolve_operator(rule),
        value: rule.search_strings.join(QUERY_VALUE_SEPARATOR),
        limit,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RulePlan {
    pub table: String,
    pub skipped: bool,
    pub query: Option<RecordQuery>,
}

#[must_use]
pub fn plan_rule(rule: &ToggleRule, target_state: bool) -> RulePlan {
    let query = rule.applies_to(target_state).then(|| build_query(rule));
    RulePlan {
        table: rule.table.clone(),
        skipped: query.is_none(),
        query,
    }
}

#[must_use]
pub fn plan_rules(rules: &[ToggleRule], target_state: bool) -> Vec<RulePlan> {
    rules
        .iter()
        .map(|rule| plan_rule(rule, target_state))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToggleConfig {
    #[serde(default = "default_source")]
    pub source: String,
    pub rules: Vec<ToggleRule>,
}

fn default_source() -> String {
    DEFAULT_SOURCE.to_string()
}

impl ToggleConfig {
    /// Validates the source tag and every rule.
    ///
    /// # Errors
    /// Returns [`ToggleError::Configuration`] for a blank source tag or the
    /// first structurally invalid rule.
    pub fn validate(&self) -> Result<(), ToggleError> {
        if self.source.trim().is_empty() {
            return Err(ToggleError::Configuration(
                "source MUST NOT be blank".to_string(),
            ));
        }

        for (index, rule) in self.rules.iter().enumerate() {
            rule.validate().map_err(|err| {
                ToggleError::Configuration(format!("rule {index}: {err}"))
            })?;
        }

        Ok(())
    }

    /// Decodes and validates a rule file from JSON.
    ///
    /// # Errors
    /// Returns [`ToggleError::Configuration`] when decoding fails or a rule
    /// is structurally invalid.
    pub fn from_json(value: &Value) -> Result<Self, ToggleError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ToggleError::Configuration(format!("invalid rule file JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ToggleError::Configuration`] when the text is not valid
    /// JSON or fails [`ToggleConfig::from_json`].
    pub fn from_json_str(raw: &str) -> Result<Self, ToggleError> {
        let value: Value = serde_json::from_str(raw).map_err(|err| {
            ToggleError::Configuration(format!("rule file is not valid JSON: {err}"))
        })?;
        Self::from_json(&value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunConfig {
    pub target_state: bool,
    pub mode: RunMode,
    pub source: String,
}

impl RunConfig {
    #[must_use]
    pub fn new(target_state: bool, mode: RunMode) -> Self {
        Self {
            target_state,
            mode,
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Integer(value) => Some(*value != 0),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// A fetched record. Fields set after fetch are tracked as dirty so a
/// store only writes what changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: String,
    record_type: Option<String>,
    sys_id: String,
    fields: BTreeMap<String, FieldValue>,
    dirty: BTreeSet<String>,
}

impl Record {
    #[must_use]
    pub fn new(table: impl Into<String>, sys_id: impl Into<String>) -> Self {
        let sys_id = sys_id.into();
        let mut fields = BTreeMap::new();
        fields.insert(SYS_ID_FIELD.to_string(), FieldValue::Text(sys_id.clone()));
        Self {
            table: table.into(),
            record_type: None,
            sys_id,
            fields,
            dirty: BTreeSet::new(),
        }
    }

    /// Sets the concrete record class when it differs from the queried table.
    #[must_use]
    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = Some(record_type.into());
        self
    }

    /// Adds a field as fetched from the store, without marking it dirty.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn record_type(&self) -> &str {
        self.record_type.as_deref().unwrap_or(&self.table)
    }

    #[must_use]
    pub fn sys_id(&self) -> &str {
        &self.sys_id
    }

    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
        self.dirty.insert(name.to_string());
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.dirty.iter().filter_map(|name| {
            self.fields
                .get(name)
                .map(|value| (name.as_str(), value))
        })
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersistReceipt {
    pub sys_id: String,
}

pub trait RecordStore {
    /// Runs a query and returns matching records in store order.
    ///
    /// # Errors
    /// Returns [`ToggleError::Store`] when the store rejects the query, for
    /// example an unknown table or an unsupported operator.
    fn query(&mut self, query: &RecordQuery) -> Result<Vec<Record>, ToggleError>;

    /// Writes the record's dirty fields. `None` signals a failed write.
    fn persist(&mut self, record: &mut Record) -> Option<PersistReceipt>;
}

pub trait LogSink {
    fn log_info(&mut self, message: &str, source: &str);
    fn log_warning(&mut self, message: &str, source: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log_info(&mut self, message: &str, source: &str) {
        tracing::info!(source, "{message}");
    }

    fn log_warning(&mut self, message: &str, source: &str) {
        tracing::warn!(source, "{message}");
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub source: String,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLogSink {
    pub entries: Vec<LogEntry>,
}

impl MemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, level: LogLevel) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |entry| entry.level == level)
            .map(|entry| entry.message.as_str())
    }
}

impl LogSink for MemoryLogSink {
    fn log_info(&mut self, message: &str, source: &str) {
        self.entries.push(LogEntry {
            level: LogLevel::Info,
            message: message.to_string(),
            source: source.to_string(),
        });
    }

    fn log_warning(&mut self, message: &str, source: &str) {
        self.entries.push(LogEntry {
            level: LogLevel::Warning,
            message: message.to_string(),
            source: source.to_string(),
        });
    }
}

#[must_use]
pub fn state_label(state: bool) -> &'static str {
    if state {
        "active"
    } else {
        "inactive"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateLogger<'a> {
    mode: RunMode,
    source: &'a str,
}

impl<'a> UpdateLogger<'a> {
    #[must_use]
    pub fn new(mode: RunMode, source: &'a str) -> Self {
        Self { mode, source }
    }

    #[must_use]
    pub fn format(&self, success: bool, record_type: &str, record_id: &str, state: bool) -> String {
        let label = state_label(state);
        let message = if success {
            format!("Set {record_type}_{record_id} to {label}")
        } else {
            format!("Failed to set {record_type}_{record_id} to {label}")
        };

        match self.mode {
            RunMode::Debug => format!("{DEBUG_PREFIX}{message}"),
            RunMode::Live => message,
        }
    }

    pub fn emit<L: LogSink + ?Sized>(
        &self,
        sink: &mut L,
        success: bool,
        record_type: &str,
        record_id: &str,
        state: bool,
    ) {
        let message = self.format(success, record_type, record_id, state);
        if success {
            sink.log_info(&message, self.source);
        } else {
            sink.log_warning(&message, self.source);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunSummary {
    pub run_id: Ulid,
    pub target_state: bool,
    pub mode: RunMode,
    pub started_at: String,
    pub finished_at: String,
    pub rules_total: usize,
    pub rules_skipped: usize,
    pub rules_failed: usize,
    pub records_matched: usize,
    pub records_updated: usize,
    pub records_failed: usize,
}

/// Applies every rule in order, setting `active` on each matched record.
///
/// Per-record persist failures and per-rule query failures are reported to
/// the sink and never stop the run.
pub fn apply_rules<S, L>(
    rules: &[ToggleRule],
    config: &RunConfig,
    store: &mut S,
    sink: &mut L,
) -> RunSummary
where
    S: RecordStore + ?Sized,
    L: LogSink + ?Sized,
{
    let run_id = Ulid::new();
    let started_at = timestamp_now();
    let logger = UpdateLogger::new(config.mode, &config.source);
    let span = tracing::info_span!("toggle_run", %run_id, mode = config.mode.as_str());
    let _entered = span.enter();

    let mut summary = RunSummary {
        run_id,
        target_state: config.target_state,
        mode: config.mode,
        started_at,
        finished_at: String::new(),
        rules_total: rules.len(),
        rules_skipped: 0,
        rules_failed: 0,
        records_matched: 0,
        records_updated: 0,
        records_failed: 0,
    };

    for rule in rules {
        let RulePlan {
            query: Some(query), ..
        } = plan_rule(rule, config.target_state)
        else {
            tracing::debug!(table = %rule.table, "rule gated out for this target state");
            summary.rules_skipped += 1;
            continue;
        };

        tracing::debug!(
            table = %query.table,
            column = %query.column,
            operator = %query.operator,
            limit = ?query.limit,
            "querying records"
        );

        let records = match store.query(&query) {
            Ok(records) => records,
            Err(err) => {
                summary.rules_failed += 1;
                sink.log_warning(
                    &format!("Failed to query {}.{}: {err}", query.table, query.column),
                    &config.source,
                );
                continue;
            }
        };

        for mut record in records {
            summary.records_matched += 1;
            record.set_field(ACTIVE_FIELD, FieldValue::Bool(config.target_state));

            let success = match config.mode {
                RunMode::Debug => true,
                RunMode::Live => store.persist(&mut record).is_some(),
            };

            if success {
                if config.mode == RunMode::Live {
                    summary.records_updated += 1;
                }
            } else {
                summary.records_failed += 1;
            }

            logger.emit(
                sink,
                success,
                record.record_type(),
                record.sys_id(),
                config.target_state,
            );
        }
    }

    summary.finished_at = timestamp_now();
    summary
}

fn timestamp_now() -> String {
    timestamp_or_blank(format_rfc3339(now_utc()))
}

fn timestamp_or_blank(formatted: Result<String, ToggleError>) -> String {
    formatted.unwrap_or_else(|err| {
        tracing::warn!(error = %err, "run timestamp left blank");
        String::new()
    })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ToggleError::Configuration`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ToggleError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ToggleError::Configuration(format!("failed to format RFC3339 timestamp: {err}"))
        })
}
