//! Use cases (application services)

pub mod dispatcher;
