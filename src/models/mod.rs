pub mod download;
pub mod paper;
