//! Streaming Japanese-tutor relay with a per-caller kanji vocabulary index.
//!
//! A caller sends a message into a chat session; kotoba forwards the
//! conversation to an OpenAI-compatible model, streams the reply back as
//! server-sent events, and afterwards stores the reply and indexes every kanji
//! it mentions under the caller's scope.
//!
//! | Stage | Where |
//! |-------|-------|
//! | Authenticate the access key | [`auth`] |
//! | Append the user message, derive the title | [`chat`], [`relay`] |
//! | Stream the upstream reply as `{"token":…}` … `[DONE]` | [`relay`], [`upstream`], [`server`] |
//! | Store the reply, extract and upsert kanji | [`relay`], [`vocab`] |
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, and health checks
//! - [`chat`]: Conversation Store: sessions and ordered messages
//! - [`vocab`]: Entity Extractor and Vocabulary Index Store
//! - [`upstream`]: Streaming language-model providers
//! - [`relay`]: The exchange state machine tying the above together

pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod relay;
pub mod server;
pub mod upstream;
pub mod vocab;
