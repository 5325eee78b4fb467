pub mod edge_gate;
pub mod local_api;
pub mod proxy;
