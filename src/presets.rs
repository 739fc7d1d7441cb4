// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Ready-made destinations, one per exchange kind plus a plain queue.

use crate::{
    errors::AmqpError,
    message::MessageHeaders,
    queue::HeadersMatch,
    topology::ExchangeTopology,
};
use clap::ValueEnum;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// `test_queue` through the default exchange.
    Queue,
    /// `direct_logs` routing `error` to `queue_log_error`.
    Direct,
    /// `notifikasi_massal` broadcasting to `queue.log.info`.
    Fanout,
    /// `berita_topic`: publishes `asia.indonesia.jakarta`, binds `asia.indonesia.#`.
    Topic,
    /// `dokumen_headers` matching `format=pdf` into `queue_dokumen_rahasia`.
    Headers,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Queue,
        Preset::Direct,
        Preset::Fanout,
        Preset::Topic,
        Preset::Headers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Queue => "queue",
            Preset::Direct => "direct",
            Preset::Fanout => "fanout",
            Preset::Topic => "topic",
            Preset::Headers => "headers",
        }
    }

    pub fn topology(&self) -> ExchangeTopology {
        match self {
            Preset::Queue => ExchangeTopology::queue("test_queue"),
            Preset::Direct => ExchangeTopology::direct("direct_logs", "queue_log_error", "error"),
            Preset::Fanout => ExchangeTopology::fanout("notifikasi_massal", "queue.log.info"),
            Preset::Topic => {
                ExchangeTopology::topic("berita_topic", "queue_berita_indo", "asia.indonesia.jakarta")
                    .binding_pattern("asia.indonesia.#")
            }
            Preset::Headers => {
                let matchers = MessageHeaders::from([
                    ("format".to_owned(), "pdf".to_owned()),
                    ("x-secret".to_owned(), "true".to_owned()),
                ]);
                ExchangeTopology::headers(
                    "dokumen_headers",
                    "queue_dokumen_rahasia",
                    matchers,
                    HeadersMatch::All,
                )
            }
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preset::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AmqpError::ConfigError(format!("unknown preset `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;

    #[test]
    fn every_preset_is_a_valid_destination() {
        for preset in Preset::ALL {
            assert_eq!(preset.topology().validate(), Ok(()), "{preset}");
        }
    }

    #[test]
    fn queue_and_exchange_names_stay_distinct() {
        for preset in &Preset::ALL[1..] {
            let topology = preset.topology();
            assert_ne!(topology.exchange_name(), topology.queue_name());
        }
    }

    #[test]
    fn topic_publishes_and_binds_with_different_keys() {
        let topic = Preset::Topic.topology();

        assert_eq!(topic.exchange_kind(), ExchangeKind::Topic);
        assert_eq!(topic.publish_key(), "asia.indonesia.jakarta");
        assert_eq!(topic.binding_key(), "asia.indonesia.#");
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("Headers".parse::<Preset>(), Ok(Preset::Headers));
        assert!(matches!("smtp".parse::<Preset>(), Err(AmqpError::ConfigError(_))));
    }
}
