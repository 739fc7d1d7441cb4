// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Task Broker Layer
//!
//! This module provides the error taxonomy shared by the connection manager,
//! the topology declarator, the publisher and the worker. The `AmqpError` enum
//! also classifies each failure as transient (retried by the publisher) or
//! fatal (surfaced to the caller immediately).

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Transport faults (`ConnectionError`, `ChannelError`, declare and publish
/// failures, timeouts) are transient. Configuration faults, topology
/// conflicts and payload errors are fatal and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid or incomplete configuration, such as a broker URL without credentials
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Channel-level fault: creation failure, protocol violation or broker-side close
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// An exchange or queue already exists with incompatible properties
    #[error("topology conflict: {0}")]
    TopologyConflictError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error handing a message to the broker
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker refused the message (publisher confirm nack, flow control)
    #[error("broker refused the message")]
    PublishNackedError,

    /// All publish attempts failed; wraps the last underlying cause
    #[error("failure to publish after {attempts} attempts")]
    PublishError {
        attempts: u32,
        #[source]
        source: Box<AmqpError>,
    },

    /// Error serializing a payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// A delivered body could not be decoded into a task
    #[error("malformed message: {0}")]
    MalformedMessageError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A broker operation or a processing step did not finish in time
    #[error("operation timed out")]
    TimeoutError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Reports whether a later attempt on a fresh channel may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AmqpError::ConfigError(_)
                | AmqpError::TopologyConflictError(_)
                | AmqpError::SerializePayloadError(_)
                | AmqpError::MalformedMessageError(_)
                | AmqpError::PublishError { .. }
        )
    }
}
