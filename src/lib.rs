// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Task publishing and consumption over AMQP 0-9-1.
//!
//! A [`channel::ConnectionManager`] owns the broker connection of a process.
//! [`publisher::TaskPublisher`] declares a destination and publishes tasks to
//! it with bounded retries; [`worker::Worker`] declares the same destination
//! and consumes tasks one at a time with manual acknowledgment.
//!
//! The `memory` feature exposes `memory::InMemoryBroker`, a process-local
//! broker for exercising publishers and workers without RabbitMQ.

mod otel;

pub mod amqp;
pub mod channel;
pub mod configs;
pub mod errors;
pub mod exchange;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod message;
pub mod presets;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod transport;
pub mod worker;
