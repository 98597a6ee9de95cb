pub mod blob;
pub mod config;
pub mod db;
pub mod generator;
pub mod imaging;
pub mod model;
pub mod openai;
pub mod sketches;
pub mod store;
pub mod sweep;
pub mod worker;
