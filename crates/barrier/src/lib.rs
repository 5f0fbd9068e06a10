pub mod config;
pub mod factory;
pub mod logic;
pub mod repository;
