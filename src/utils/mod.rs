pub mod benetech;
pub mod text_processor;
