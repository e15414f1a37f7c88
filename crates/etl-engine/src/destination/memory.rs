//! In-process destination
//!
//! Tables live in a map shared by every destination a [`MemoryConnector`]
//! opens, so a test can run the pipeline several times against the same
//! table and then inspect it. Writes follow PostgreSQL semantics closely
//! enough for the pipeline's guarantees to be checked without a database:
//! slices are atomic, unique constraints are enforced, audit columns default
//! to the write time, upserts only touch rows whose compared columns changed,
//! and numeric values are rounded to the column's declared scale.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{
    ColumnInfo, Destination, DestinationConnector, SchemaSnapshot, TableRef, UniqueConstraint,
    CREATED_AT, UPDATED_AT,
};
use crate::batch::{TabularBatch, Value};
use crate::error::{EngineError, Result};
use crate::loader::WritePlan;
use crate::models::{DestinationConfig, LoadStrategy};
use crate::schema::{NativeFamily, TypeRegistry};

const TIMESTAMP_TYPE: &str = "timestamp without time zone";

/// One table: columns in ordinal order and rows aligned to them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    columns: Vec<ColumnInfo>,
    /// Columns whose default is the write time
    now_defaults: HashSet<String>,
    constraints: Vec<UniqueConstraint>,
    rows: Vec<Vec<Value>>,
}

impl MemoryTable {
    /// Nullable columns without defaults
    pub fn new(columns: &[(&str, &str)]) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|(name, native)| ColumnInfo {
                    name: name.to_string(),
                    native_type: normalize_type(native),
                    nullable: true,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Append `created_at` and `updated_at` defaulting to the write time.
    pub fn with_audit_columns(mut self) -> Self {
        for name in [CREATED_AT, UPDATED_AT] {
            self.columns.push(ColumnInfo {
                name: name.to_string(),
                native_type: TIMESTAMP_TYPE.to_string(),
                nullable: false,
            });
            self.now_defaults.insert(name.to_string());
            for row in &mut self.rows {
                row.push(Value::Timestamp(Utc::now().naive_utc()));
            }
        }
        self
    }

    /// Primary key, named `{table}_pkey` once the table is registered
    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.constraints.retain(|c| !c.is_primary);
        self.constraints.push(UniqueConstraint {
            name: String::new(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            is_primary: true,
        });
        for column in self.columns.iter_mut().filter(|c| columns.contains(&c.name.as_str())) {
            column.nullable = false;
        }
        self
    }

    pub fn with_unique(mut self, name: &str, columns: &[&str]) -> Self {
        self.constraints.push(UniqueConstraint {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            is_primary: false,
        });
        self
    }

    /// Rows in column order; short rows are padded with nulls.
    pub fn with_rows(mut self, rows: Vec<Vec<Value>>) -> Self {
        let width = self.columns.len();
        self.rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Value::Null);
                row
            })
            .collect();
        self
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn constraints(&self) -> &[UniqueConstraint] {
        &self.constraints
    }

    /// `column` of the first row whose `key_column` equals `key`
    pub fn get(&self, key_column: &str, key: &Value, column: &str) -> Option<&Value> {
        let k = self.position(key_column)?;
        let c = self.position(column)?;
        self.rows.iter().find(|r| &r[k] == key).map(|r| &r[c])
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn name_constraints(&mut self, table: &str) {
        for constraint in self.constraints.iter_mut().filter(|c| c.name.is_empty()) {
            constraint.name = if constraint.is_primary {
                format!("{}_pkey", table)
            } else {
                format!("{}_{}_key", table, constraint.columns.join("_"))
            };
        }
    }

    fn key_of(&self, row: &[Value], columns: &[String]) -> Option<Vec<Value>> {
        let mut key = Vec::with_capacity(columns.len());
        for name in columns {
            let value = &row[self.position(name)?];
            // nulls never conflict
            if value.is_null() {
                return None;
            }
            key.push(value.clone());
        }
        Some(key)
    }

    fn conflicting_row(&self, constraint: &UniqueConstraint, row: &[Value]) -> Option<usize> {
        let key = self.key_of(row, &constraint.columns)?;
        self.rows
            .iter()
            .position(|existing| self.key_of(existing, &constraint.columns).as_ref() == Some(&key))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<TableRef, MemoryTable>,
    failing_alters: HashMap<TableRef, String>,
    /// Slices still accepted before writes start failing, and the error
    failing_writes: HashMap<TableRef, (usize, String)>,
    locked: HashSet<TableRef>,
    locks_taken: usize,
    open: usize,
}

/// Opens [`MemoryDestination`]s over one shared set of tables
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    pub fn insert_table(&self, config: &DestinationConfig, mut table: MemoryTable) {
        table.name_constraints(&config.table);
        self.state().tables.insert(TableRef::from(config), table);
    }

    /// Copy of the table's current contents
    pub fn table(&self, config: &DestinationConfig) -> Option<MemoryTable> {
        self.state().tables.get(&TableRef::from(config)).cloned()
    }

    pub fn row_count(&self, config: &DestinationConfig) -> Option<usize> {
        self.state()
            .tables
            .get(&TableRef::from(config))
            .map(MemoryTable::row_count)
    }

    /// Make DDL and schema changes on the table fail with `message`.
    pub fn fail_alters(&self, config: &DestinationConfig, message: &str) {
        self.state()
            .failing_alters
            .insert(TableRef::from(config), message.to_string());
    }

    /// Accept `ok_slices` more slices, then fail every write with `message`.
    pub fn fail_writes_after(&self, config: &DestinationConfig, ok_slices: usize, message: &str) {
        self.state()
            .failing_writes
            .insert(TableRef::from(config), (ok_slices, message.to_string()));
    }

    pub fn locks_taken(&self) -> usize {
        self.state().locks_taken
    }

    /// Destinations opened and not yet closed
    pub fn open_connections(&self) -> usize {
        self.state().open
    }
}

#[async_trait]
impl DestinationConnector for MemoryConnector {
    async fn connect(&self, config: &DestinationConfig) -> Result<Box<dyn Destination>> {
        self.state().open += 1;
        Ok(Box::new(MemoryDestination {
            table: TableRef::from(config),
            state: self.state.clone(),
            types: TypeRegistry::postgres(),
            holds_lock: false,
        }))
    }
}

pub struct MemoryDestination {
    table: TableRef,
    state: Arc<Mutex<MemoryState>>,
    types: TypeRegistry,
    holds_lock: bool,
}

impl MemoryDestination {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    fn relation_missing(&self) -> EngineError {
        EngineError::NotFound(format!("relation {} does not exist", self.table.qualified()))
    }

    fn check_alter(&self, state: &MemoryState) -> Result<()> {
        match state.failing_alters.get(&self.table) {
            Some(message) => Err(EngineError::Destination(message.clone())),
            None => Ok(()),
        }
    }

    /// Full table rows for a slice, with defaults and native conversions applied
    fn build_rows(&self, table: &MemoryTable, plan: &WritePlan, slice: &TabularBatch) -> Result<Vec<Vec<Value>>> {
        let mut sources = Vec::with_capacity(table.columns.len());
        for column in &plan.columns {
            if table.position(&column.name).is_none() {
                return Err(EngineError::Destination(format!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    column.name, self.table.table
                )));
            }
        }
        for info in &table.columns {
            sources.push(slice.column(&info.name));
        }

        let now = Utc::now().naive_utc();
        let mut rows = Vec::with_capacity(slice.row_count());
        for idx in 0..slice.row_count() {
            let mut row = Vec::with_capacity(table.columns.len());
            for (info, source) in table.columns.iter().zip(&sources) {
                let value = match source {
                    Some(column) => self.to_native(info, &column.values[idx])?,
                    None if table.now_defaults.contains(&info.name) => Value::Timestamp(now),
                    None => Value::Null,
                };
                if value.is_null() && !info.nullable {
                    return Err(EngineError::Destination(format!(
                        "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                        info.name, self.table.table
                    )));
                }
                row.push(value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn to_native(&self, info: &ColumnInfo, value: &Value) -> Result<Value> {
        let family = self.types.family(&info.native_type);
        let converted = value.coerce(family.data_type()).map_err(|e| {
            EngineError::Destination(format!(
                "invalid input for type {} in column \"{}\": {}",
                info.native_type, info.name, e
            ))
        })?;
        Ok(match (family, converted) {
            (NativeFamily::Numeric, Value::Numeric(n)) => {
                Value::Numeric(round_to_scale(n, numeric_scale(&info.native_type)))
            },
            (_, v) => v,
        })
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn table(&self) -> &TableRef {
        &self.table
    }

    async fn describe(&mut self) -> Result<Option<SchemaSnapshot>> {
        Ok(self
            .state()
            .tables
            .get(&self.table)
            .map(|t| SchemaSnapshot::new(t.columns.clone())))
    }

    async fn execute_ddl(&mut self, ddl: &str) -> Result<()> {
        let mut state = self.state();
        self.check_alter(&state)?;
        let (table_ref, mut table) = parse_create_table(ddl).map_err(EngineError::Destination)?;
        if state.tables.contains_key(&table_ref) {
            return Err(EngineError::Destination(format!(
                "relation \"{}\" already exists",
                table_ref.table
            )));
        }
        table.name_constraints(&table_ref.table);
        debug!(table = %table_ref, columns = table.columns.len(), "Created in-memory table");
        state.tables.insert(table_ref, table);
        Ok(())
    }

    async fn add_column(&mut self, name: &str, native_type: &str) -> Result<()> {
        let mut state = self.state();
        self.check_alter(&state)?;
        let table = state
            .tables
            .get_mut(&self.table)
            .ok_or_else(|| self.relation_missing())?;
        if table.position(name).is_some() {
            return Err(EngineError::Destination(format!(
                "column \"{}\" of relation \"{}\" already exists",
                name, self.table.table
            )));
        }
        table.columns.push(ColumnInfo {
            name: name.to_string(),
            native_type: normalize_type(native_type),
            nullable: true,
        });
        for row in &mut table.rows {
            row.push(Value::Null);
        }
        Ok(())
    }

    async fn truncate(&mut self) -> Result<()> {
        let mut state = self.state();
        let table = state
            .tables
            .get_mut(&self.table)
            .ok_or_else(|| self.relation_missing())?;
        table.rows.clear();
        Ok(())
    }

    async fn drop_table(&mut self) -> Result<()> {
        let mut state = self.state();
        self.check_alter(&state)?;
        state
            .tables
            .remove(&self.table)
            .map(|_| ())
            .ok_or_else(|| self.relation_missing())
    }

    async fn unique_constraints(&mut self) -> Result<Vec<UniqueConstraint>> {
        Ok(self
            .state()
            .tables
            .get(&self.table)
            .map(|t| t.constraints.clone())
            .unwrap_or_default())
    }

    async fn replace_primary_key(&mut self, columns: &[String]) -> Result<()> {
        let mut state = self.state();
        self.check_alter(&state)?;
        let table_name = self.table.table.clone();
        let table = state
            .tables
            .get_mut(&self.table)
            .ok_or_else(|| self.relation_missing())?;

        let mut positions = Vec::with_capacity(columns.len());
        for name in columns {
            let pos = table.position(name).ok_or_else(|| {
                EngineError::Destination(format!("column \"{}\" named in key does not exist", name))
            })?;
            positions.push(pos);
        }

        let mut seen = HashSet::new();
        for row in &table.rows {
            let key: Vec<String> = positions.iter().map(|&p| row[p].to_string()).collect();
            if positions.iter().any(|&p| row[p].is_null()) {
                return Err(EngineError::Destination(format!(
                    "column of key ({}) contains null values",
                    columns.join(", ")
                )));
            }
            if !seen.insert(key.clone()) {
                return Err(EngineError::Destination(format!(
                    "could not create unique index \"{}_pkey\": key ({})=({}) is duplicated",
                    table_name,
                    columns.join(", "),
                    key.join(", ")
                )));
            }
        }

        table.constraints.retain(|c| !c.is_primary);
        table.constraints.push(UniqueConstraint {
            name: format!("{}_pkey", table_name),
            columns: columns.to_vec(),
            is_primary: true,
        });
        for &p in &positions {
            table.columns[p].nullable = false;
        }
        Ok(())
    }

    async fn lock_table(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.locked.insert(self.table.clone()) {
            return Err(EngineError::Destination(format!(
                "lock on {} is held by another run",
                self.table
            )));
        }
        state.locks_taken += 1;
        self.holds_lock = true;
        Ok(())
    }

    async fn write_slice(&mut self, plan: &WritePlan, slice: &TabularBatch) -> Result<u64> {
        let mut state = self.state();

        if let Some((remaining, message)) = state.failing_writes.get_mut(&self.table) {
            if *remaining == 0 {
                return Err(EngineError::Destination(message.clone()));
            }
            *remaining -= 1;
        }

        let table = state
            .tables
            .get(&self.table)
            .ok_or_else(|| self.relation_missing())?;
        let incoming = self.build_rows(table, plan, slice)?;

        // Work on a copy so a failing row leaves the table untouched
        let mut next = table.clone();
        match plan.strategy {
            LoadStrategy::Insert | LoadStrategy::TruncateInsert => {
                for row in incoming {
                    insert_row(&mut next, row)?;
                }
            },
            LoadStrategy::Upsert => upsert_rows(&mut next, plan, incoming)?,
        }

        state.tables.insert(self.table.clone(), next);
        Ok(slice.row_count() as u64)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = lock(&self.state);
        if self.holds_lock {
            state.locked.remove(&self.table);
        }
        state.open = state.open.saturating_sub(1);
        Ok(())
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn insert_row(table: &mut MemoryTable, row: Vec<Value>) -> Result<()> {
    if let Some(constraint) = table
        .constraints
        .iter()
        .find(|c| table.conflicting_row(c, &row).is_some())
    {
        return Err(EngineError::Destination(format!(
            "duplicate key value violates unique constraint \"{}\"",
            constraint.name
        )));
    }
    table.rows.push(row);
    Ok(())
}

fn upsert_rows(table: &mut MemoryTable, plan: &WritePlan, incoming: Vec<Vec<Value>>) -> Result<()> {
    let arbiter = table
        .constraints
        .iter()
        .find(|c| c.covers_exactly(&plan.upsert_keys))
        .cloned()
        .ok_or_else(|| {
            EngineError::Destination(
                "there is no unique or exclusion constraint matching the ON CONFLICT specification"
                    .to_string(),
            )
        })?;

    let compared: Vec<usize> = plan
        .update_columns()
        .iter()
        .filter_map(|c| table.position(c))
        .collect();
    let updated_at = table.position(UPDATED_AT);
    let now = Utc::now().naive_utc();

    let mut touched = HashSet::new();
    for row in incoming {
        match table.conflicting_row(&arbiter, &row) {
            Some(existing) => {
                if !touched.insert(existing) {
                    return Err(EngineError::Destination(
                        "ON CONFLICT DO UPDATE command cannot affect row a second time".to_string(),
                    ));
                }
                let stored = &table.rows[existing];
                let distinct = compared.iter().any(|&p| stored[p] != row[p]);
                if compared.is_empty() || !distinct {
                    continue;
                }
                let target = &mut table.rows[existing];
                for &p in &compared {
                    target[p] = row[p].clone();
                }
                if let Some(p) = updated_at {
                    target[p] = Value::Timestamp(now);
                }
            },
            None => {
                insert_row(table, row)?;
                touched.insert(table.rows.len() - 1);
            },
        }
    }
    Ok(())
}

/// Declared scale of `numeric(p,s)`, if any
fn numeric_scale(native_type: &str) -> Option<i32> {
    let args = native_type.split_once('(')?.1.trim_end_matches(')');
    args.split(',').nth(1)?.trim().parse().ok()
}

fn round_to_scale(n: f64, scale: Option<i32>) -> f64 {
    match scale {
        Some(s) => {
            let factor = 10f64.powi(s);
            (n * factor).round() / factor
        },
        None => n,
    }
}

/// Type name as PostgreSQL's `format_type` reports it
fn normalize_type(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let (base, args) = match lower.split_once('(') {
        Some((b, a)) => (b.trim().to_string(), Some(format!("({}", a.replace(' ', "")))),
        None => (lower.clone(), None),
    };
    let base = match base.as_str() {
        "int" | "int4" => "integer",
        "int8" => "bigint",
        "int2" => "smallint",
        "bool" => "boolean",
        "decimal" => "numeric",
        "float8" | "float" => "double precision",
        "float4" => "real",
        "varchar" => "character varying",
        "char" | "bpchar" => "character",
        "timestamp" => TIMESTAMP_TYPE,
        "timestamptz" => "timestamp with time zone",
        other => other,
    };
    match args {
        Some(args) => format!("{}{}", base, args),
        None => base.to_string(),
    }
}

/// Read the table name, columns and key constraints of a `CREATE TABLE`
/// statement.
pub fn parse_create_table(ddl: &str) -> std::result::Result<(TableRef, MemoryTable), String> {
    let upper = ddl.to_ascii_uppercase();
    let start = upper
        .find("CREATE TABLE")
        .ok_or_else(|| "not a CREATE TABLE statement".to_string())?
        + "CREATE TABLE".len();
    let open = ddl[start..]
        .find('(')
        .map(|p| p + start)
        .ok_or_else(|| "CREATE TABLE without a column list".to_string())?;
    let close = ddl
        .rfind(')')
        .filter(|&c| c > open)
        .ok_or_else(|| "unbalanced parentheses in CREATE TABLE".to_string())?;

    let mut name = ddl[start..open].trim();
    if name.to_ascii_uppercase().starts_with("IF NOT EXISTS") {
        name = name["IF NOT EXISTS".len()..].trim();
    }
    let parts = split_top_level(name, '.');
    let table_ref = match parts.as_slice() {
        [table] => TableRef::new("public", unquote(table)),
        [schema, table] => TableRef::new(unquote(schema), unquote(table)),
        _ => return Err(format!("invalid table name '{}'", name)),
    };

    let mut table = MemoryTable::default();
    for item in split_top_level(&ddl[open + 1..close], ',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let upper = item.to_ascii_uppercase();
        let (constraint_name, body, body_upper) = if upper.starts_with("CONSTRAINT ") {
            let rest = item["CONSTRAINT ".len()..].trim();
            let (name, body) = split_first_word(rest);
            (unquote(name), body.trim(), body.trim().to_ascii_uppercase())
        } else {
            (String::new(), item, upper.clone())
        };

        if body_upper.starts_with("PRIMARY KEY") {
            table.constraints.retain(|c| !c.is_primary);
            table.constraints.push(UniqueConstraint {
                name: constraint_name,
                columns: paren_list(body),
                is_primary: true,
            });
        } else if body_upper.starts_with("UNIQUE") {
            table.constraints.push(UniqueConstraint {
                name: constraint_name,
                columns: paren_list(body),
                is_primary: false,
            });
        } else if body_upper.starts_with("CHECK") || body_upper.starts_with("FOREIGN KEY") {
            continue;
        } else {
            parse_column(&mut table, body)?;
        }
    }

    let key_columns: Vec<String> = table
        .constraints
        .iter()
        .filter(|c| c.is_primary)
        .flat_map(|c| c.columns.clone())
        .collect();
    for column in table.columns.iter_mut().filter(|c| key_columns.contains(&c.name)) {
        column.nullable = false;
    }
    if table.columns.is_empty() {
        return Err("CREATE TABLE without columns".to_string());
    }
    Ok((table_ref, table))
}

const COLUMN_KEYWORDS: &[&str] = &[
    "NOT",
    "NULL",
    "DEFAULT",
    "PRIMARY",
    "UNIQUE",
    "REFERENCES",
    "CHECK",
    "CONSTRAINT",
    "COLLATE",
    "GENERATED",
];

fn parse_column(table: &mut MemoryTable, item: &str) -> std::result::Result<(), String> {
    let (raw_name, rest) = split_first_word(item);
    let name = unquote(raw_name);

    // type runs until the first constraint keyword outside parentheses
    let mut depth = 0i32;
    let mut type_end = rest.len();
    let mut word_start = None;
    for (i, ch) in rest.char_indices().chain(std::iter::once((rest.len(), ' '))) {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {},
        }
        if ch.is_whitespace() || ch == '(' {
            if let Some(s) = word_start.take() {
                if depth == 0 && COLUMN_KEYWORDS.contains(&rest[s..i].to_uppercase().as_str()) {
                    type_end = s;
                    break;
                }
            }
        } else if word_start.is_none() && depth == 0 {
            word_start = Some(i);
        }
    }

    let native = rest[..type_end].trim();
    if native.is_empty() {
        return Err(format!("column '{}' has no type", name));
    }
    let constraints = rest[type_end..].to_uppercase();
    let primary = constraints.contains("PRIMARY KEY");

    if constraints.contains("DEFAULT CURRENT_TIMESTAMP")
        || constraints.contains("DEFAULT NOW()")
        || constraints.contains("DEFAULT LOCALTIMESTAMP")
    {
        table.now_defaults.insert(name.clone());
    }
    if primary {
        table.constraints.retain(|c| !c.is_primary);
        table.constraints.push(UniqueConstraint {
            name: String::new(),
            columns: vec![name.clone()],
            is_primary: true,
        });
    } else if constraints.contains("UNIQUE") {
        table.constraints.push(UniqueConstraint {
            name: String::new(),
            columns: vec![name.clone()],
            is_primary: false,
        });
    }

    table.columns.push(ColumnInfo {
        name,
        native_type: normalize_type(native),
        nullable: !(primary || constraints.contains("NOT NULL")),
    });
    Ok(())
}

fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    let end = if s.starts_with('"') {
        let mut i = 1;
        let bytes = s.as_bytes();
        while i < bytes.len() {
            if bytes[i] == b'"' {
                if bytes.get(i + 1) == Some(&b'"') {
                    i += 2;
                    continue;
                }
                i += 1;
                break;
            }
            i += 1;
        }
        i
    } else {
        s.find(char::is_whitespace).unwrap_or(s.len())
    };
    (&s[..end], &s[end..])
}

/// Split on `sep` outside parentheses and double quotes
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            c if c == sep && !quoted && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + ch.len_utf8();
            },
            _ => {},
        }
    }
    parts.push(&s[start..]);
    parts
}

fn paren_list(s: &str) -> Vec<String> {
    let inner = match (s.find('('), s.rfind(')')) {
        (Some(open), Some(close)) if close > open => &s[open + 1..close],
        _ => return Vec::new(),
    };
    split_top_level(inner, ',')
        .into_iter()
        .map(unquote)
        .filter(|c| !c.is_empty())
        .collect()
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    match s.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => s.to_lowercase(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::batch::{Column, DataType};
    use crate::models::DestinationKind;

    fn config() -> DestinationConfig {
        DestinationConfig {
            kind: DestinationKind::Postgresql,
            credential_id: 1,
            schema: "public".into(),
            table: "items".into(),
        }
    }

    #[test]
    fn test_parse_generated_ddl() {
        let ddl = "CREATE TABLE \"public\".\"items\" (\n    \"id\" BIGINT NOT NULL,\n    \
                   \"price\" NUMERIC(18, 2) DEFAULT 0,\n    \"Label\" VARCHAR(255),\n    \
                   \"created_at\" TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,\n    \
                   PRIMARY KEY (\"id\")\n);";
        let (table_ref, table) = parse_create_table(ddl).unwrap();
        assert_eq!(table_ref, TableRef::new("public", "items"));
        assert_eq!(table.column_names(), vec!["id", "price", "Label", "created_at"]);
        assert_eq!(table.columns[1].native_type, "numeric(18,2)");
        assert_eq!(table.columns[2].native_type, "character varying(255)");
        assert_eq!(table.columns[3].native_type, TIMESTAMP_TYPE);
        assert!(table.now_defaults.contains("created_at"));
        assert!(table.constraints[0].is_primary);
        assert_eq!(table.constraints[0].columns, vec!["id"]);
    }

    #[test]
    fn test_parse_inline_key_and_bare_name() {
        let (table_ref, table) =
            parse_create_table("create table if not exists Items (ID int primary key, v text unique)")
                .unwrap();
        assert_eq!(table_ref, TableRef::new("public", "items"));
        assert_eq!(table.column_names(), vec!["id", "v"]);
        assert_eq!(table.columns[0].native_type, "integer");
        assert!(!table.columns[0].nullable);
        assert_eq!(table.constraints.len(), 2);
    }

    #[test]
    fn test_numeric_scale() {
        assert_eq!(numeric_scale("numeric(18,2)"), Some(2));
        assert_eq!(numeric_scale("numeric"), None);
        assert_eq!(round_to_scale(1.005_1, Some(2)), 1.01);
    }

    fn plan_for(batch: &TabularBatch, table: &MemoryTable, strategy: LoadStrategy) -> WritePlan {
        WritePlan::new(
            TableRef::from(&config()),
            strategy,
            &["id".to_string()],
            batch,
            &SchemaSnapshot::new(table.columns.clone()),
            &TypeRegistry::postgres(),
        )
    }

    #[tokio::test]
    async fn test_failed_slice_leaves_table_untouched() {
        let connector = MemoryConnector::new();
        connector.insert_table(
            &config(),
            MemoryTable::new(&[("id", "bigint")]).with_primary_key(&["id"]),
        );
        let mut dest = connector.connect(&config()).await.unwrap();
        let batch = TabularBatch::from_columns(vec![Column::new(
            "id",
            DataType::Integer,
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(1)],
        )])
        .unwrap();
        let table = connector.table(&config()).unwrap();
        let err = dest
            .write_slice(&plan_for(&batch, &table, LoadStrategy::Insert), &batch)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("items_pkey"));
        assert_eq!(connector.row_count(&config()), Some(0));
    }

    #[tokio::test]
    async fn test_not_null_enforced() {
        let connector = MemoryConnector::new();
        connector.insert_table(&config(), MemoryTable::new(&[("id", "bigint"), ("v", "text")]).with_primary_key(&["id"]));
        let mut dest = connector.connect(&config()).await.unwrap();
        let batch = TabularBatch::from_columns(vec![Column::new("id", DataType::Integer, vec![Value::Null])]).unwrap();
        let table = connector.table(&config()).unwrap();
        let err = dest
            .write_slice(&plan_for(&batch, &table, LoadStrategy::Insert), &batch)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not-null"));
    }

    #[tokio::test]
    async fn test_upsert_needs_arbiter_constraint() {
        let connector = MemoryConnector::new();
        connector.insert_table(&config(), MemoryTable::new(&[("id", "bigint")]));
        let mut dest = connector.connect(&config()).await.unwrap();
        let batch = TabularBatch::from_columns(vec![Column::new("id", DataType::Integer, vec![Value::Integer(1)])]).unwrap();
        let table = connector.table(&config()).unwrap();
        let err = dest
            .write_slice(&plan_for(&batch, &table, LoadStrategy::Upsert), &batch)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ON CONFLICT"));
    }

    #[tokio::test]
    async fn test_lock_is_released_on_close() {
        let connector = MemoryConnector::new();
        let mut first = connector.connect(&config()).await.unwrap();
        first.lock_table().await.unwrap();
        let mut second = connector.connect(&config()).await.unwrap();
        assert!(second.lock_table().await.is_err());
        first.close().await.unwrap();
        second.lock_table().await.unwrap();
        second.close().await.unwrap();
        assert_eq!(connector.locks_taken(), 2);
        assert_eq!(connector.open_connections(), 0);
    }
}
