pub mod errors;
pub mod factory;
pub mod service;

pub use errors::AppError;
pub use factory::{AppFactory, AppPaths};
pub use service::App;
