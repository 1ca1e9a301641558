pub mod chart_to_text;
pub mod decoder;
pub mod encoder;
