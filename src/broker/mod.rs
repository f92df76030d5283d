pub mod message;
pub mod schema;
pub mod types;
pub mod ack;
pub mod repository;
pub mod group;
pub mod channel_queue;
pub mod routing;
pub mod subscription;
pub mod domain;
pub mod snapshot;
pub mod service;

pub use service::MessageService;
