pub mod eligibility;
pub mod executor;
pub mod extractor;
pub mod locations;
pub mod mapper;
pub mod pipeline;
pub mod planner;
pub mod schema;
