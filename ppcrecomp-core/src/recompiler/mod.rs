pub mod config;
pub mod error;
pub mod image;
pub mod parser;
pub mod decoder;
pub mod analysis;
pub mod contract;
pub mod codegen;
pub mod validator;
pub mod pipeline;
pub mod harness;
