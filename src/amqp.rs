// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! lapin-backed implementation of the transport seam, speaking AMQP 0-9-1 to a
//! RabbitMQ broker.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{MessageHeaders, JSON_CONTENT_TYPE, PERSISTENT_DELIVERY_MODE},
    queue::{QueueBinding, QueueDefinition},
    transport::{
        AmqpChannel, AmqpConnection, AmqpConnector, ChannelId, Delivery, DeliveryAcker,
        DeliveryStream, ErrorHook, OutboundMessage,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    publisher_confirms: bool,
}

impl LapinConnector {
    /// # Parameters
    /// * `publisher_confirms` - put every channel created by the connection in confirm mode
    pub fn new(publisher_confirms: bool) -> Self {
        LapinConnector { publisher_confirms }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection {
            inner: conn,
            publisher_confirms: self.publisher_confirms,
        }))
    }
}

struct LapinConnection {
    inner: Connection,
    publisher_confirms: bool,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_error(&self, hook: ErrorHook) {
        self.inner
            .on_error(move |err| hook(AmqpError::ConnectionError(err.to_string())));
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.inner.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to enable publisher confirms");
                    AmqpError::ChannelError(err.to_string())
                })?;
        }

        let channel = LapinChannel {
            id: ChannelId::next(),
            inner: channel,
        };
        debug!(channel = channel.id.to_string(), "channel created");

        Ok(Arc::new(channel))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

struct LapinChannel {
    id: ChannelId,
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_error(&self, hook: ErrorHook) {
        self.inner
            .on_error(move |err| hook(AmqpError::ChannelError(err.to_string())));
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| classify(&err, AmqpError::DeclareExchangeError(def.name.clone())))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| classify(&err, AmqpError::DeclareQueueError(def.name.clone())))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                to_field_table(&binding.arguments()),
            )
            .await
            .map_err(|err| {
                classify(
                    &err,
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ),
                )
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_publish(&self, msg: OutboundMessage<'_>) -> Result<(), AmqpError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(msg.kind.to_owned()))
            .with_message_id(ShortString::from(msg.message_id.to_owned()))
            .with_headers(to_field_table(&msg.headers));

        if msg.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let confirm = self
            .inner
            .basic_publish(
                msg.exchange,
                msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                msg.body,
                properties,
            )
            .await
            .map_err(|err| classify(&err, AmqpError::PublishingError(err.to_string())))?;

        let confirmation = confirm
            .await
            .map_err(|err| classify(&err, AmqpError::PublishingError(err.to_string())))?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishNackedError);
        }

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ChannelError(err.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers,
        data: delivery.data,
        acker: Arc::new(LapinAcker(delivery.acker)),
    }
}

/// PRECONDITION_FAILED on a declare means the entity exists with other properties.
fn classify(err: &lapin::Error, fallback: AmqpError) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(amqp_err)
            if matches!(
                amqp_err.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            error!(error = err.to_string(), "conflicting declaration");
            AmqpError::TopologyConflictError(amqp_err.to_string())
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            AmqpError::ChannelError(err.to_string())
        }
        _ => {
            error!(error = err.to_string(), "broker operation failed");
            fallback
        }
    }
}

pub(crate) fn to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

pub(crate) fn from_field_table(table: &FieldTable) -> MessageHeaders {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                AMQPValue::Boolean(v) => v.to_string(),
                AMQPValue::ShortInt(v) => v.to_string(),
                AMQPValue::LongInt(v) => v.to_string(),
                AMQPValue::LongLongInt(v) => v.to_string(),
                AMQPValue::LongUInt(v) => v.to_string(),
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}
