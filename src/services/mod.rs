pub mod configuration;
pub mod dispatch;
pub mod intake;
pub mod matching;
pub mod registration;
pub mod rule_cache;
pub mod scheduler;
