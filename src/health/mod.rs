pub mod connect_back;
pub mod health_checker;
pub mod probe_context;
