pub mod chain_client;
pub mod constants;
pub mod db;
pub mod http;
pub mod kube;
pub mod metrics;
pub mod observer;
pub mod retrier;
pub mod runtime;
pub mod settings;
