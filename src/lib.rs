pub mod cloak;
pub mod config;
pub mod models;
pub mod tests;
pub mod worker;
