//! MySQL / MariaDB dialect.

use super::dialect::Dialect;

/// Dialect for MySQL-compatible servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDialect;

const SYSTEM_DATABASES: &[&str] = &["information_schema", "mysql", "performance_schema", "sys"];
const CONSTRAINT_VARIABLES: &[&str] = &["FOREIGN_KEY_CHECKS", "UNIQUE_CHECKS"];

impl Dialect for MysqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn quote_string(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 2);
        out.push('\'');
        for c in value.chars() {
            match c {
                '\0' => out.push_str("\\0"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\x1a' => out.push_str("\\Z"),
                '\\' => out.push_str("\\\\"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                _ => out.push(c),
            }
        }
        out.push('\'');
        out
    }

    fn create_database_sql(&self, database: &str) -> String {
        format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            self.quote_identifier(database)
        )
    }

    fn drop_database_sql(&self, database: &str) -> String {
        format!("DROP DATABASE IF EXISTS {}", self.quote_identifier(database))
    }

    fn use_database_sql(&self, database: &str) -> String {
        format!("USE {}", self.quote_identifier(database))
    }

    fn list_databases_sql(&self) -> String {
        "SHOW DATABASES".to_string()
    }

    fn system_databases(&self) -> &'static [&'static str] {
        SYSTEM_DATABASES
    }

    fn list_tables_sql(&self, database: &str) -> String {
        format!(
            "SHOW FULL TABLES FROM {} WHERE Table_type = 'BASE TABLE'",
            self.quote_identifier(database)
        )
    }

    fn create_table_query(&self, table: &str) -> String {
        format!("SHOW CREATE TABLE {}", self.quote_identifier(table))
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_identifier(table))
    }

    fn order_columns_query(&self, database: &str, table: &str) -> String {
        let scope = format!(
            "TABLE_SCHEMA = {} AND TABLE_NAME = {}",
            self.quote_string(database),
            self.quote_string(table)
        );
        format!(
            "SELECT COLUMN_NAME FROM information_schema.COLUMNS WHERE {scope} \
             AND (COLUMN_KEY = 'PRI' OR NOT EXISTS \
             (SELECT 1 FROM information_schema.COLUMNS WHERE {scope} AND COLUMN_KEY = 'PRI')) \
             ORDER BY ORDINAL_POSITION"
        )
    }

    fn select_page_sql(
        &self,
        table: &str,
        order_by: &[String],
        limit: usize,
        offset: u64,
    ) -> String {
        let mut sql = format!("SELECT * FROM {}", self.quote_identifier(table));
        if !order_by.is_empty() {
            let columns: Vec<String> = order_by.iter().map(|c| self.quote_identifier(c)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&columns.join(", "));
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
        sql
    }

    fn begin_snapshot_sql(&self) -> Vec<String> {
        vec![
            "SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ".to_string(),
            "START TRANSACTION WITH CONSISTENT SNAPSHOT".to_string(),
        ]
    }

    fn end_snapshot_sql(&self) -> Vec<String> {
        vec!["COMMIT".to_string()]
    }

    fn constraint_check_variables(&self) -> &'static [&'static str] {
        CONSTRAINT_VARIABLES
    }

    fn session_variable_query(&self, name: &str) -> String {
        format!("SELECT @@SESSION.{}", name)
    }

    fn set_session_variable_sql(&self, name: &str, value: &str) -> String {
        format!("SET SESSION {} = {}", name, value)
    }

    fn export_prologue(&self) -> Vec<String> {
        vec![
            "SET NAMES utf8mb4".to_string(),
            "SET FOREIGN_KEY_CHECKS = 0".to_string(),
            "SET UNIQUE_CHECKS = 0".to_string(),
            "SET AUTOCOMMIT = 0".to_string(),
        ]
    }

    fn export_epilogue(&self) -> Vec<String> {
        vec![
            "COMMIT".to_string(),
            "SET UNIQUE_CHECKS = 1".to_string(),
            "SET FOREIGN_KEY_CHECKS = 1".to_string(),
        ]
    }
}
