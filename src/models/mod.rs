pub mod health;
pub mod job;
pub mod message;
pub mod recipient_error;
pub mod report;
pub mod request;
pub mod response;
pub mod retry;
pub mod rule;
pub mod status;
pub mod tenant;
pub mod validation;
