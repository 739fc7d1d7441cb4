// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! This module provides types for defining broker exchanges. Exchanges are the
//! routing mechanism that determines how published tasks are distributed to
//! queues.

use crate::errors::AmqpError;
use std::{fmt, str::FromStr};

/// How an exchange picks the queues a task goes to.
///
/// `Direct` compares the routing key with the binding key, `Fanout` copies to
/// every bound queue, `Topic` matches the key against a `*`/`#` pattern and
/// `Headers` compares message headers with the binding arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }

    /// Whether the routing key takes part in routing for this kind.
    pub fn uses_routing_key(&self) -> bool {
        matches!(self, ExchangeKind::Direct | ExchangeKind::Topic)
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::ConfigError(format!(
                "unknown exchange kind `{other}`"
            ))),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Name, kind and declaration flags of an exchange.
///
/// Two declarations of the same name must agree on kind and flags; the broker
/// refuses the second one otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// A transient direct exchange called `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Auto-delete once the last binding goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Survives broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only checks that the exchange exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!("Topic".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert_eq!("headers".parse::<ExchangeKind>().unwrap(), ExchangeKind::Headers);
        assert!(matches!(
            "x-delayed-message".parse::<ExchangeKind>(),
            Err(AmqpError::ConfigError(_))
        ));
    }

    #[test]
    fn only_direct_and_topic_route_by_key() {
        assert!(ExchangeKind::Direct.uses_routing_key());
        assert!(ExchangeKind::Topic.uses_routing_key());
        assert!(!ExchangeKind::Fanout.uses_routing_key());
        assert!(!ExchangeKind::Headers.uses_routing_key());
    }

    #[test]
    fn builder_sets_flags() {
        let def = ExchangeDefinition::new("berita_topic")
            .kind(ExchangeKind::Topic)
            .durable();

        assert_eq!(def.name(), "berita_topic");
        assert_eq!(def.exchange_kind(), ExchangeKind::Topic);
        assert!(def.is_durable());
        assert!(!def.passive && !def.internal && !def.delete);
    }
}
