pub mod aggregate_queries;
mod pg_store;
mod rows;

pub use pg_store::PgStore;
