pub mod export;
pub mod rancher;
pub mod store;
