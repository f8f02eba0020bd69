//! Interfaces to the database: sessions, transactions and SQL dialects

mod connection;
mod dialect;
mod mysql;
mod value;

pub use connection::{check_liveness, Connection, ConnectionProvider, Transaction};
pub use dialect::Dialect;
pub use mysql::MysqlDialect;
pub use value::{QueryResult, Value};
