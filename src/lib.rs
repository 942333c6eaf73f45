pub mod app_config;
pub mod db;
pub mod orm;
pub mod results;
pub mod vote;
pub mod web;
