pub mod types;
pub mod source;
pub mod matrix;
pub mod universe;
pub mod fetcher;
pub mod import;
