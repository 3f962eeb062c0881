pub mod config;
pub(crate) mod conv;
pub(crate) mod dconv;
pub mod htdemucs;
pub mod kernels;
pub mod metadata;
pub(crate) mod recurrent;
