//! Library half of the binary: the concrete `WebApp` component and its
//! manifest generator, split out so the end-to-end test crate can drive them
//! without relinking the whole `main`.

pub mod crd;
pub mod generator;
