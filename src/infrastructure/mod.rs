pub mod jsonx;
pub mod llm;
pub mod server;
pub mod tools;
