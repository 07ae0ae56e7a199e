pub mod arena;
pub mod packages;
pub mod scoring;
pub mod simulate;
