pub mod client;
pub mod finalizer;
pub mod metrics;
pub mod url;
