//! Google Calendar provider

pub mod client;
pub mod models;
pub mod token;

pub use client::{GoogleCalendarClient, DEFAULT_API_BASE_URL, DEFAULT_PEOPLE_BASE_URL};
pub use token::{RedisTokenSource, StaticToken, StoredToken, TokenSource};
