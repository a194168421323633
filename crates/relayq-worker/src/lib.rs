pub mod config;
pub mod executor;
pub mod handler;
pub mod worker;

pub use config::WorkerConfig;
pub use handler::{EchoHandler, FnHandler, HandlerRegistry, HandlerResult, SleepHandler, TaskHandler};
pub use worker::Worker;
