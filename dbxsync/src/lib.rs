pub mod config;
pub mod explorer;
pub mod logging;
pub mod remote;
pub mod sync;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;
