//! In-memory MySQL stand-in used by the engine tests.
//!
//! Understands exactly the statements `MysqlDialect` and the SQL dump writer
//! produce. Transactions stage a copy of the current database and swap it in
//! on commit.

#![allow(dead_code)]

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dbkit_core::driver::{Connection, ConnectionProvider, QueryResult, Transaction, Value};
use dbkit_core::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub create_sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

pub type Database = BTreeMap<String, Table>;

#[derive(Default)]
pub struct MemoryServer {
    databases: Mutex<BTreeMap<String, Database>>,
    failures: Mutex<Vec<String>>,
    log: Mutex<Vec<String>>,
    sessions: AtomicUsize,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_database(&self, name: &str) {
        self.databases
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
    }

    /// Creates a table from its DDL and fills it.
    pub fn seed_table(&self, database: &str, ddl: &str, rows: Vec<Vec<Value>>) {
        let (name, mut table) = parse_create_table(ddl).unwrap();
        table.rows = rows;
        self.databases
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default()
            .insert(name, table);
    }

    /// Any statement or query containing `pattern` fails from now on.
    pub fn fail_on(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.lock().unwrap().contains_key(name)
    }

    pub fn table_names(&self, database: &str) -> Vec<String> {
        self.databases
            .lock()
            .unwrap()
            .get(database)
            .map(|db| db.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rows(&self, database: &str, table: &str) -> Vec<Vec<Value>> {
        self.databases
            .lock()
            .unwrap()
            .get(database)
            .and_then(|db| db.get(table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Every statement executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    fn check_failure(&self, sql: &str) -> Result<()> {
        let failures = self.failures.lock().unwrap();
        if failures.iter().any(|p| sql.contains(p.as_str())) {
            return Err(Error::database(format!("injected failure: {}", sql)));
        }
        Ok(())
    }

    fn record(&self, sql: &str) {
        self.log.lock().unwrap().push(sql.to_string());
    }
}

pub struct MemoryProvider {
    server: Arc<MemoryServer>,
}

impl MemoryProvider {
    pub fn new(server: Arc<MemoryServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        self.server.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection::new(self.server.clone())))
    }
}

struct Session {
    current: Option<String>,
    variables: HashMap<String, String>,
}

impl Session {
    fn new() -> Self {
        let variables = [("FOREIGN_KEY_CHECKS", "1"), ("UNIQUE_CHECKS", "1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            current: None,
            variables,
        }
    }
}

pub struct MemoryConnection {
    server: Arc<MemoryServer>,
    session: Arc<Mutex<Session>>,
}

impl MemoryConnection {
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self {
            server,
            session: Arc::new(Mutex::new(Session::new())),
        }
    }

    pub fn current_database(&self) -> Option<String> {
        self.session.lock().unwrap().current.clone()
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.session.lock().unwrap().variables.get(name).cloned()
    }

    fn current(&self) -> Result<String> {
        self.current_database()
            .ok_or_else(|| Error::database("No database selected"))
    }

    fn apply_server(&self, sql: &str) -> Option<Result<u64>> {
        if let Some(rest) = strip_words(sql, &["CREATE", "DATABASE"]) {
            let (rest, if_not_exists) = optional_words(rest, &["IF", "NOT", "EXISTS"]);
            return Some(parse_ident(rest).and_then(|(name, _)| {
                let mut dbs = self.server.databases.lock().unwrap();
                if dbs.contains_key(&name) {
                    if if_not_exists {
                        return Ok(0);
                    }
                    return Err(Error::database(format!("Database '{}' exists", name)));
                }
                dbs.insert(name, Database::new());
                Ok(1)
            }));
        }
        if let Some(rest) = strip_words(sql, &["DROP", "DATABASE"]) {
            let (rest, if_exists) = optional_words(rest, &["IF", "EXISTS"]);
            return Some(parse_ident(rest).and_then(|(name, _)| {
                let removed = self.server.databases.lock().unwrap().remove(&name);
                match removed {
                    Some(_) => Ok(1),
                    None if if_exists => Ok(0),
                    None => Err(unknown_database(&name)),
                }
            }));
        }
        if let Some(rest) = strip_words(sql, &["USE"]) {
            return Some(parse_ident(rest).and_then(|(name, _)| {
                if !self.server.has_database(&name) {
                    return Err(unknown_database(&name));
                }
                self.session.lock().unwrap().current = Some(name);
                Ok(0)
            }));
        }
        None
    }

    fn run_query(&self, sql: &str) -> Result<QueryResult> {
        if strip_words(sql, &["SHOW", "DATABASES"]).is_some() {
            let rows = self
                .server
                .database_names()
                .into_iter()
                .map(|name| vec![Value::Text(name)])
                .collect();
            return Ok(QueryResult::new(vec!["Database".to_string()], rows));
        }

        if let Some(rest) = strip_words(sql, &["SHOW", "FULL", "TABLES", "FROM"]) {
            let (name, _) = parse_ident(rest)?;
            if !self.server.has_database(&name) {
                return Err(unknown_database(&name));
            }
            let rows = self
                .server
                .table_names(&name)
                .into_iter()
                .map(|t| vec![Value::Text(t), Value::from("BASE TABLE")])
                .collect();
            return Ok(QueryResult::new(
                vec![format!("Tables_in_{}", name), "Table_type".to_string()],
                rows,
            ));
        }

        if let Some(rest) = strip_words(sql, &["SHOW", "CREATE", "TABLE"]) {
            let (name, _) = parse_ident(rest)?;
            let table = self.table(&name)?;
            return Ok(QueryResult::new(
                vec!["Table".to_string(), "Create Table".to_string()],
                vec![vec![Value::Text(name), Value::Text(table.create_sql)]],
            ));
        }

        if let Some(rest) = strip_words(sql, &["SELECT", "*", "FROM"]) {
            let (name, mut rest) = parse_ident(rest)?;
            let table = self.table(&name)?;

            let mut order = Vec::new();
            if let Some(list) = strip_words(rest, &["ORDER", "BY"]) {
                rest = list;
                loop {
                    let (column, after) = parse_ident(rest)?;
                    let index = table
                        .columns
                        .iter()
                        .position(|c| *c == column)
                        .ok_or_else(|| Error::database(format!("Unknown column '{}'", column)))?;
                    order.push(index);
                    match after.trim_start().strip_prefix(',') {
                        Some(next) => rest = next,
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }

            let rest = strip_words(rest, &["LIMIT"]).ok_or_else(|| syntax(sql))?;
            let (limit, rest) = parse_number(rest).ok_or_else(|| syntax(sql))?;
            let rest = strip_words(rest, &["OFFSET"]).ok_or_else(|| syntax(sql))?;
            let (offset, _) = parse_number(rest).ok_or_else(|| syntax(sql))?;

            let mut rows = table.rows.clone();
            rows.sort_by(|a, b| {
                order
                    .iter()
                    .map(|&i| compare_values(&a[i], &b[i]))
                    .find(|o| *o != CmpOrdering::Equal)
                    .unwrap_or(CmpOrdering::Equal)
            });
            let rows = rows
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect();
            return Ok(QueryResult::new(table.columns, rows));
        }

        if strip_words(
            sql,
            &["SELECT", "COLUMN_NAME", "FROM", "information_schema.COLUMNS"],
        )
        .is_some()
        {
            // Quoted schema and table names are the first two literals
            let literals: Vec<&str> = sql.split('\'').skip(1).step_by(2).collect();
            let (Some(database), Some(name)) = (literals.first(), literals.get(1)) else {
                return Err(syntax(sql));
            };
            let table = self
                .server
                .databases
                .lock()
                .unwrap()
                .get(*database)
                .and_then(|db| db.get(*name))
                .cloned()
                .ok_or_else(|| missing_table(name))?;
            let rows = order_columns(&table)
                .into_iter()
                .map(|c| vec![Value::Text(c)])
                .collect();
            return Ok(QueryResult::new(vec!["COLUMN_NAME".to_string()], rows));
        }

        if let Some(rest) = strip_words(sql, &["SELECT"]) {
            let rest = rest.trim();
            if let Some(prefix) = rest.get(..10) {
                if prefix.eq_ignore_ascii_case("@@SESSION.") {
                    let name = rest[10..].trim().to_ascii_uppercase();
                    // Numeric variables come back typed, like on a real server
                    let value = match self.variable(&name) {
                        Some(v) => v.parse::<i64>().map(Value::Int).unwrap_or(Value::Text(v)),
                        None => Value::Null,
                    };
                    return Ok(QueryResult::new(vec![rest.to_string()], vec![vec![value]]));
                }
            }
        }

        Err(syntax(sql))
    }

    fn table(&self, name: &str) -> Result<Table> {
        let database = self.current()?;
        self.server
            .databases
            .lock()
            .unwrap()
            .get(&database)
            .and_then(|db| db.get(name))
            .cloned()
            .ok_or_else(|| missing_table(name))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.server.check_failure(sql)?;
        self.server.record(sql);
        if let Some(result) = apply_session(&self.session, sql) {
            return result;
        }
        if let Some(result) = self.apply_server(sql) {
            return result;
        }
        let database = self.current()?;
        let mut dbs = self.server.databases.lock().unwrap();
        let db = dbs
            .get_mut(&database)
            .ok_or_else(|| unknown_database(&database))?;
        apply_table(db, sql)
    }

    async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.server.check_failure(sql)?;
        self.run_query(sql)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        let database = self.current()?;
        let staged = self
            .server
            .databases
            .lock()
            .unwrap()
            .get(&database)
            .cloned()
            .ok_or_else(|| unknown_database(&database))?;
        Ok(Box::new(MemoryTransaction {
            server: self.server.clone(),
            session: self.session.clone(),
            database,
            staged,
        }))
    }

    async fn use_database(&self, database: &str) -> Result<()> {
        self.execute(&format!("USE `{}`", database.replace('`', "``")))
            .await
            .map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        self.server.check_failure("PING")
    }

    fn server_version(&self) -> String {
        "8.0.36".to_string()
    }

    fn server_type(&self) -> String {
        "mysql".to_string()
    }
}

struct MemoryTransaction {
    server: Arc<MemoryServer>,
    session: Arc<Mutex<Session>>,
    database: String,
    staged: Database,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.server.check_failure(sql)?;
        self.server.record(sql);
        if let Some(result) = apply_session(&self.session, sql) {
            return result;
        }
        apply_table(&mut self.staged, sql)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.server
            .databases
            .lock()
            .unwrap()
            .insert(this.database, this.staged);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn apply_session(session: &Mutex<Session>, sql: &str) -> Option<Result<u64>> {
    let control: [&[&str]; 3] = [&["COMMIT"], &["ROLLBACK"], &["START", "TRANSACTION"]];
    for words in control {
        if strip_words(sql, words).is_some() {
            return Some(Ok(0));
        }
    }

    let rest = strip_words(sql, &["SET"])?;
    if strip_words(rest, &["NAMES"]).is_some() {
        return Some(Ok(0));
    }
    let (rest, _) = optional_words(rest, &["SESSION"]);
    if strip_words(rest, &["TRANSACTION"]).is_some() {
        return Some(Ok(0));
    }
    let Some((name, value)) = rest.split_once('=') else {
        return Some(Err(syntax(sql)));
    };
    let name = name.trim().to_ascii_uppercase();
    let value = value.trim();
    if NUMERIC_VARIABLES.contains(&name.as_str()) && value.starts_with('\'') {
        return Some(Err(Error::database(format!(
            "Variable '{}' can't be set to the value of {}",
            name, value
        ))));
    }
    session
        .lock()
        .unwrap()
        .variables
        .insert(name, value.trim_matches('\'').to_string());
    Some(Ok(0))
}

/// Session variables that only accept numeric values
const NUMERIC_VARIABLES: &[&str] = &["FOREIGN_KEY_CHECKS", "UNIQUE_CHECKS", "AUTOCOMMIT"];

/// Primary-key columns from the creation statement, or all columns.
fn order_columns(table: &Table) -> Vec<String> {
    let Some(start) = table.create_sql.find("PRIMARY KEY (") else {
        return table.columns.clone();
    };
    let list = &table.create_sql[start + "PRIMARY KEY (".len()..];
    let end = list.find(')').unwrap_or(list.len());
    split_top_level(&list[..end])
        .iter()
        .filter_map(|c| parse_ident(c).ok().map(|(name, _)| name))
        .collect()
}

fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Less,
        (_, Value::Null) => CmpOrdering::Greater,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Decimal(x), Value::Decimal(y)) => match (x.parse::<f64>(), y.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
            _ => x.cmp(y),
        },
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        _ => format!("{:?}", a).cmp(&format!("{:?}", b)),
    }
}

fn apply_table(db: &mut Database, sql: &str) -> Result<u64> {
    if let Some(rest) = strip_words(sql, &["DROP", "TABLE"]) {
        let (rest, if_exists) = optional_words(rest, &["IF", "EXISTS"]);
        let (name, _) = parse_ident(rest)?;
        return match db.remove(&name) {
            Some(_) => Ok(0),
            None if if_exists => Ok(0),
            None => Err(missing_table(&name)),
        };
    }

    if strip_words(sql, &["CREATE", "TABLE"]).is_some() {
        let (name, table) = parse_create_table(sql)?;
        if db.contains_key(&name) {
            return Err(Error::database(format!("Table '{}' already exists", name)));
        }
        db.insert(name, table);
        return Ok(0);
    }

    if let Some(rest) = strip_words(sql, &["INSERT", "INTO"]) {
        let (name, rest) = parse_ident(rest)?;
        let table = db.get_mut(&name).ok_or_else(|| missing_table(&name))?;

        let mut rest = rest.trim_start();
        let mut columns = None;
        if let Some(list) = rest.strip_prefix('(') {
            let close = list.find(')').ok_or_else(|| syntax(sql))?;
            let names = split_top_level(&list[..close])
                .iter()
                .map(|c| parse_ident(c).map(|(n, _)| n))
                .collect::<Result<Vec<_>>>()?;
            columns = Some(names);
            rest = &list[close + 1..];
        }
        let rest = strip_words(rest, &["VALUES"]).ok_or_else(|| syntax(sql))?;

        let rows = parse_rows(rest).ok_or_else(|| syntax(sql))?;
        let count = rows.len() as u64;
        for row in rows {
            let row = match &columns {
                None => row,
                Some(names) => {
                    if names.len() != row.len() {
                        return Err(column_count());
                    }
                    table
                        .columns
                        .iter()
                        .map(|c| {
                            names
                                .iter()
                                .position(|n| n == c)
                                .map(|i| row[i].clone())
                                .unwrap_or(Value::Null)
                        })
                        .collect()
                }
            };
            if row.len() != table.columns.len() {
                return Err(column_count());
            }
            table.rows.push(row);
        }
        return Ok(count);
    }

    Err(syntax(sql))
}

fn parse_create_table(sql: &str) -> Result<(String, Table)> {
    let rest = strip_words(sql, &["CREATE", "TABLE"]).ok_or_else(|| syntax(sql))?;
    let (rest, _) = optional_words(rest, &["IF", "NOT", "EXISTS"]);
    let (name, rest) = parse_ident(rest)?;

    let open = rest.find('(').ok_or_else(|| syntax(sql))?;
    let close = rest.rfind(')').ok_or_else(|| syntax(sql))?;
    let mut columns = Vec::new();
    for part in split_top_level(&rest[open + 1..close]) {
        if part.trim_start().starts_with('`') {
            columns.push(parse_ident(&part)?.0);
        }
    }

    Ok((
        name,
        Table {
            create_sql: sql.trim().to_string(),
            columns,
            rows: Vec::new(),
        },
    ))
}

/// Splits on commas outside parentheses and quotes.
fn split_top_level(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in body.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

/// Parses `(v, ...), (v, ...)` tuples.
fn parse_rows(input: &str) -> Option<Vec<Vec<Value>>> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;
    let mut rows = Vec::new();

    loop {
        while pos < chars.len() && (chars[pos].is_whitespace() || chars[pos] == ',') {
            pos += 1;
        }
        if pos >= chars.len() {
            break;
        }
        if chars[pos] != '(' {
            return None;
        }
        pos += 1;

        let mut row = Vec::new();
        loop {
            while pos < chars.len() && chars[pos].is_whitespace() {
                pos += 1;
            }
            let (value, next) = parse_literal(&chars, pos)?;
            row.push(value);
            pos = next;
            while pos < chars.len() && chars[pos].is_whitespace() {
                pos += 1;
            }
            match chars.get(pos)? {
                ',' => pos += 1,
                ')' => {
                    pos += 1;
                    break;
                }
                _ => return None,
            }
        }
        rows.push(row);
    }
    Some(rows)
}

fn parse_literal(chars: &[char], start: usize) -> Option<(Value, usize)> {
    let mut pos = start;
    if chars.get(pos) == Some(&'\'') {
        pos += 1;
        let mut text = String::new();
        loop {
            let c = *chars.get(pos)?;
            pos += 1;
            match c {
                '\\' => {
                    let escaped = *chars.get(pos)?;
                    pos += 1;
                    text.push(match escaped {
                        '0' => '\0',
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        'Z' => '\x1a',
                        other => other,
                    });
                }
                '\'' if chars.get(pos) == Some(&'\'') => {
                    text.push('\'');
                    pos += 1;
                }
                '\'' => return Some((Value::Text(text), pos)),
                other => text.push(other),
            }
        }
    }

    while pos < chars.len() && !matches!(chars[pos], ',' | ')') && !chars[pos].is_whitespace() {
        pos += 1;
    }
    let token: String = chars[start..pos].iter().collect();
    if token.is_empty() {
        return None;
    }

    let value = if token.eq_ignore_ascii_case("NULL") {
        Value::Null
    } else if let Some(hex) = token.strip_prefix("0x") {
        Value::Bytes(decode_hex(hex)?)
    } else if let Ok(i) = token.parse::<i64>() {
        Value::Int(i)
    } else {
        Value::Decimal(token)
    };
    Some((value, pos))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Consumes `words` case-insensitively from the start of `sql`.
fn strip_words<'a>(sql: &'a str, words: &[&str]) -> Option<&'a str> {
    let mut rest = sql.trim_start();
    for word in words {
        let head = rest.get(..word.len())?;
        if !head.eq_ignore_ascii_case(word) {
            return None;
        }
        let after = &rest[word.len()..];
        if after
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return None;
        }
        rest = after.trim_start();
    }
    Some(rest)
}

fn optional_words<'a>(sql: &'a str, words: &[&str]) -> (&'a str, bool) {
    match strip_words(sql, words) {
        Some(rest) => (rest, true),
        None => (sql, false),
    }
}

fn parse_ident(s: &str) -> Result<(String, &str)> {
    let s = s.trim_start();
    if let Some(body) = s.strip_prefix('`') {
        let mut name = String::new();
        let mut chars = body.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '`' {
                if matches!(chars.peek(), Some((_, '`'))) {
                    name.push('`');
                    chars.next();
                    continue;
                }
                return Ok((name, &body[i + 1..]));
            }
            name.push(c);
        }
        return Err(syntax(s));
    }

    let end = s
        .find(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';'))
        .unwrap_or(s.len());
    if end == 0 {
        return Err(syntax(s));
    }
    Ok((s[..end].to_string(), &s[end..]))
}

fn parse_number(s: &str) -> Option<(u64, &str)> {
    let s = s.trim_start();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    Some((s[..end].parse().ok()?, &s[end..]))
}

fn syntax(sql: &str) -> Error {
    Error::database(format!("You have an error in your SQL syntax near '{}'", sql))
}

fn unknown_database(name: &str) -> Error {
    Error::database(format!("Unknown database '{}'", name))
}

fn missing_table(name: &str) -> Error {
    Error::database(format!("Table '{}' doesn't exist", name))
}

fn column_count() -> Error {
    Error::database("Column count doesn't match value count")
}
