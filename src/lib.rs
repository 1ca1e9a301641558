pub mod cli;
pub mod data_module;
pub mod dataset;
pub mod error;
pub mod image_data;
pub mod metric;
pub mod model;
pub mod parse_config;
pub mod training;
pub mod utils;
