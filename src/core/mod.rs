pub mod error;
pub mod ids;
pub mod migrations;
pub mod models;
pub mod store;
