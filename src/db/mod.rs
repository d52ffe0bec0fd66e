mod connection;
pub(crate) mod helpers;
mod migrations;
mod repositories;

pub use connection::Database;
