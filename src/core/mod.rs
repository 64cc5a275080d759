pub mod engine;
pub mod enrollment;
pub mod executor;
pub mod github;
pub mod lifecycle;
pub mod locks;
pub mod monitor;
pub mod prober;
pub mod settings;
pub mod ssh;
pub mod store;
pub mod terminal;
pub mod vault;

#[cfg(test)]
pub(crate) mod fakes;
