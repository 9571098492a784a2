pub mod channels;
pub mod config;
pub mod error;
pub mod extractor;
pub mod handlers;
pub mod janitor;
pub mod parser;
pub mod pipeline;
pub mod repository;
pub mod validate;
