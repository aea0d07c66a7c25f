pub mod credentials;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod types;
pub mod utils;
