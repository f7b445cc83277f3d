pub mod aggregator;
pub mod app_state;
pub mod bootstrap;
pub mod cache;
pub mod http_client;
pub mod log_table;
pub mod log_writer;
