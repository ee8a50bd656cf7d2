pub mod actions;
pub mod codec;
pub mod generation;
pub mod processor;
pub mod session_store;
pub mod store;
