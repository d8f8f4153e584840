pub mod cli;
pub mod config;
pub mod handoff;
pub mod http;
pub mod influx;
pub mod lifecycle;
pub mod point;
pub mod store;
pub mod writer;

#[cfg(test)]
pub mod test_support;
