pub mod client;
pub mod config;
pub mod interactive;
pub mod listing;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod source;
pub mod tags;
pub mod text;
