// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! This module provides types for defining queues and the bindings that connect
//! them to exchanges, either by routing key or by header-matching arguments.

use crate::{errors::AmqpError, message::MessageHeaders};
use std::str::FromStr;

/// Binding argument selecting the header-matching mode of a headers exchange.
pub const AMQP_HEADERS_X_MATCH: &str = "x-match";

/// Name and declaration flags of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
}

impl QueueDefinition {
    /// A transient, shared queue called `name`.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Survives broker restarts together with its persistent messages.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Owned by the declaring connection and removed with it.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}

/// How a headers exchange compares binding arguments with message headers.
///
/// In the plain modes, arguments whose name starts with `x-` are ignored
/// when matching; the `-with-x` modes compare them too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeadersMatch {
    #[default]
    All,
    Any,
    AllWithX,
    AnyWithX,
}

impl HeadersMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadersMatch::All => "all",
            HeadersMatch::Any => "any",
            HeadersMatch::AllWithX => "all-with-x",
            HeadersMatch::AnyWithX => "any-with-x",
        }
    }

    pub fn requires_all(&self) -> bool {
        matches!(self, HeadersMatch::All | HeadersMatch::AllWithX)
    }

    pub fn includes_x_headers(&self) -> bool {
        matches!(self, HeadersMatch::AllWithX | HeadersMatch::AnyWithX)
    }
}

impl FromStr for HeadersMatch {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(HeadersMatch::All),
            "any" => Ok(HeadersMatch::Any),
            "all-with-x" => Ok(HeadersMatch::AllWithX),
            "any-with-x" => Ok(HeadersMatch::AnyWithX),
            other => Err(AmqpError::ConfigError(format!(
                "unknown x-match mode `{other}`"
            ))),
        }
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys (direct, topic), nothing (fanout) or header arguments (headers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) headers: MessageHeaders,
    pub(crate) header_match: Option<HeadersMatch>,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            headers: MessageHeaders::new(),
            header_match: None,
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key or topic pattern for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Binds on header values instead of a routing key.
    pub fn headers(mut self, headers: MessageHeaders, mode: HeadersMatch) -> Self {
        self.headers = headers;
        self.header_match = Some(mode);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    /// Binding arguments as sent to the broker, including `x-match` for header bindings.
    pub fn arguments(&self) -> MessageHeaders {
        let mut args = self.headers.clone();
        if let Some(mode) = self.header_match {
            args.insert(AMQP_HEADERS_X_MATCH.to_owned(), mode.as_str().to_owned());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_binding_arguments_carry_x_match() {
        let binding = QueueBinding::new("queue_pdf")
            .exchange("dokumen_headers")
            .headers(
                MessageHeaders::from([("format".to_owned(), "pdf".to_owned())]),
                HeadersMatch::Any,
            );

        let args = binding.arguments();
        assert_eq!(args.get("format").map(String::as_str), Some("pdf"));
        assert_eq!(args.get(AMQP_HEADERS_X_MATCH).map(String::as_str), Some("any"));
    }

    #[test]
    fn routing_key_binding_has_no_arguments() {
        let binding = QueueBinding::new("queue_log_error")
            .exchange("direct_logs")
            .routing_key("error");

        assert!(binding.arguments().is_empty());
        assert_eq!(binding.key(), "error");
    }
}
