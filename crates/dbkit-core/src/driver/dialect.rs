//! Dialect-specific SQL text.
//!
//! A [`Dialect`] never talks to the server; it only produces the SQL that the
//! export and import engines send through a [`Connection`](super::Connection).

/// SQL text generator for one database engine.
pub trait Dialect: Send + Sync {
    /// Short engine name, e.g. "mysql"
    fn name(&self) -> &str;

    /// Quote an identifier (table, database, column)
    fn quote_identifier(&self, ident: &str) -> String;

    /// Produce a complete string literal including quotes
    fn quote_string(&self, value: &str) -> String;

    /// Literal for raw bytes
    fn hex_literal(&self, bytes: &[u8]) -> String {
        if bytes.is_empty() {
            return "''".to_string();
        }
        let mut out = String::with_capacity(2 + bytes.len() * 2);
        out.push_str("0x");
        for b in bytes {
            out.push_str(&format!("{:02X}", b));
        }
        out
    }

    /// Literal for a boolean
    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn create_database_sql(&self, database: &str) -> String;

    fn drop_database_sql(&self, database: &str) -> String;

    fn use_database_sql(&self, database: &str) -> String;

    /// Query returning one database name per row in the first column
    fn list_databases_sql(&self) -> String;

    /// Databases that are never backed up implicitly
    fn system_databases(&self) -> &'static [&'static str];

    /// Query returning one table name per row in the first column
    fn list_tables_sql(&self, database: &str) -> String;

    /// Query whose result holds the table's creation statement
    fn create_table_query(&self, table: &str) -> String;

    /// Column index of the creation statement in [`create_table_query`](Self::create_table_query)
    fn create_table_column(&self) -> usize {
        1
    }

    fn drop_table_sql(&self, table: &str) -> String;

    /// Query returning, one per row, the columns that give a table a total
    /// row order: the primary key, or every column when there is none
    fn order_columns_query(&self, database: &str, table: &str) -> String;

    /// Select one page of a table's rows ordered by `order_by`
    fn select_page_sql(
        &self,
        table: &str,
        order_by: &[String],
        limit: usize,
        offset: u64,
    ) -> String;

    /// Statements that pin the session to one consistent snapshot, so every
    /// page of every table reads the same data
    fn begin_snapshot_sql(&self) -> Vec<String>;

    /// Statements releasing the snapshot taken by [`begin_snapshot_sql`](Self::begin_snapshot_sql)
    fn end_snapshot_sql(&self) -> Vec<String>;

    /// Session variables controlling foreign-key and unique checking
    fn constraint_check_variables(&self) -> &'static [&'static str];

    /// Query returning a session variable's current value in the first cell
    fn session_variable_query(&self, name: &str) -> String;

    /// Statement assigning a session variable; `value` is already a literal
    fn set_session_variable_sql(&self, name: &str, value: &str) -> String;

    /// Statements written before any table in an export
    fn export_prologue(&self) -> Vec<String>;

    /// Statements written after the last table in an export
    fn export_epilogue(&self) -> Vec<String>;
}
