//! HTTP reporting surface

pub mod routes;

pub use routes::build_router;
