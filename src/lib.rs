pub mod aggregator_core;
pub mod config;
pub mod feed_core;
pub mod pipeline;
pub mod sqlite_pragma;
pub mod systems;
