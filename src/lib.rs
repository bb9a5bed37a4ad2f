#![allow(clippy::new_without_default)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

pub mod export_data;
pub mod geo_math;
pub mod location_provider;
pub mod logs;
pub mod route_tracker;
pub mod session_controller;
pub mod utils;
