pub mod aggregate;
pub mod catalog;
pub mod details;
pub mod propagate;
pub mod upsert;
