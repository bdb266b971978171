//! # stagepipe
//!
//! Directory-as-queue stage processing with a cross-process endpoint pool.
//!
//! Items are plain files that move through an ordered list of stage
//! directories. Each stage claims an item by renaming it into a private
//! `tmp/`, runs a [`engine::Stage`] on it with bounded retries, and then
//! relocates it to the next stage or to a reject directory. Stages that
//! call out to capacity-limited remote endpoints take a slot from a
//! [`pool::ResourcePool`], backed by advisory file locks that any number of
//! processes sharing the lock directory respect.

pub mod config;
pub mod engine;
pub mod error;
pub mod hook;
pub mod item_store;
pub mod lock;
pub mod model;
pub mod pool;
pub mod telemetry;
