pub mod error;
pub mod key_cache;
pub mod lease;
pub mod session_token;
pub mod single_flight;
pub mod token_refresh;
pub mod transit;
pub mod vault_client;
