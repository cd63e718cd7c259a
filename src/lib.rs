pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{eligibility, executor, extractor, locations, mapper, pipeline, planner, schema};
pub use domain::{state, types};
pub use infrastructure::{jsonx, llm, server, tools};
