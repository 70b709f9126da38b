pub mod config;
pub mod keyring;
pub mod token_store;
