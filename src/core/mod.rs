pub mod domain;
pub mod errors;
pub mod languages;
pub mod scanner;
pub mod traits;
