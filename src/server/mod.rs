pub mod acceptor;
pub mod connection_policy;
pub mod stack_provider;
