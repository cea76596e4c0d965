mod common;

mod api;
mod backends;
mod matching;
mod registration;
