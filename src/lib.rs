//! # devicio-rs
//!
//! At-least-once device routine pipeline over a durable message queue.
//!
//! A simulator publishes protobuf routine reports from a bounded worker
//! pool; a processor consumes them with manual acknowledgment, calls a
//! deliberately unreliable dependency, and persists each routine to
//! Postgres through prepared statements. Failed deliveries are requeued.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod processor;
pub mod queue;
pub mod shutdown;
pub mod telemetry;
