pub mod adb;
pub mod aggregate;
pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod perf;
pub mod poll;
pub mod profilers;
pub mod scripts;

#[cfg(test)]
pub(crate) mod testing;
