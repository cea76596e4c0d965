pub mod database;
pub mod health;
pub mod lock;
pub mod memory;
pub mod publisher;
pub mod rbmq;
pub mod redis;
pub mod store;
