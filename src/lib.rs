#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;

pub mod browser_controller;
pub mod dashboard;
pub mod run_log;
pub mod runner;
pub mod types;
pub mod utils;
pub mod visitor;
