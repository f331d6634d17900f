pub mod allocator;
pub mod audit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod lookup;
pub mod recorder;
pub mod store;

#[cfg(test)]
mod test_support;
