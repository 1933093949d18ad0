pub mod adapters;
pub mod config;
pub mod error;
pub mod startup;
pub mod sweeper;
pub mod web;
