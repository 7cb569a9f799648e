//! mathtop: a Telegram math tutor with metered token credits.
//!
//! Users send text or photos of math problems; the bot answers through an
//! OpenAI-compatible API, recommends a related video from a local catalogue,
//! and bills every completion against the user's credit balance kept by the
//! [`credit_ledger`] crate.

pub mod api;
pub mod assistant;
pub mod bot;
pub mod channels;
pub mod cli;
pub mod config;
pub mod history;
pub mod openai;
pub mod videos;

pub use config::Config;
