//! Admin REST API.

pub mod routes;
