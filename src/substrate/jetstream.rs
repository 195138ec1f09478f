//! NATS JetStream substrate backend.

use crate::error::{EngineError, EngineResult};
use crate::substrate::types::{AckPolicy, ConsumerSpec, Record, RecordId, StreamSpec};
use crate::substrate::{Substrate, SubstrateConsumer};
use async_nats::jetstream::{self, consumer::pull};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;

pub struct JetStreamSubstrate {
    client: async_nats::Client,
    context: jetstream::Context,
}

impl JetStreamSubstrate {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| EngineError::SubstrateConnect(format!("{url}: {e}")))?;
        let context = jetstream::new(client.clone());
        Ok(Self { client, context })
    }
}

fn substrate_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Substrate(e.to_string())
}

#[async_trait]
impl Substrate for JetStreamSubstrate {
    async fn create_stream(&self, spec: StreamSpec) -> EngineResult<()> {
        self.context
            .get_or_create_stream(jetstream::stream::Config {
                name: spec.name,
                subjects: vec![spec.subject.into()],
                max_age: spec.ttl.unwrap_or(Duration::ZERO),
                ..Default::default()
            })
            .await
            .map_err(substrate_err)?;
        Ok(())
    }

    async fn delete_stream(&self, name: &str) -> EngineResult<()> {
        self.context
            .delete_stream(name)
            .await
            .map_err(substrate_err)?;
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: &BTreeMap<String, String>,
    ) -> EngineResult<u64> {
        let mut header_map = async_nats::HeaderMap::new();
        for (k, v) in headers {
            header_map.insert(k.as_str(), v.as_str());
        }
        let ack = self
            .context
            .publish_with_headers(subject.to_string(), header_map, payload)
            .await
            .map_err(substrate_err)?
            // Wait for the stream-level ack: the record is durable once
            // this resolves.
            .await
            .map_err(substrate_err)?;
        Ok(ack.sequence)
    }

    async fn create_consumer(
        &self,
        spec: ConsumerSpec,
    ) -> EngineResult<Box<dyn SubstrateConsumer>> {
        let stream = self
            .context
            .get_stream(&spec.stream)
            .await
            .map_err(|_| EngineError::StreamNotFound(spec.stream.clone()))?;

        let ack_policy = match spec.ack_policy {
            AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
            AckPolicy::Cumulative => jetstream::consumer::AckPolicy::All,
        };
        let consumer = stream
            .get_or_create_consumer(
                &spec.name,
                pull::Config {
                    durable_name: Some(spec.name.clone()),
                    filter_subject: spec.filter_subject.clone().unwrap_or_default(),
                    ack_policy,
                    ack_wait: spec.ack_wait,
                    max_deliver: if spec.max_deliver == 0 {
                        -1
                    } else {
                        spec.max_deliver as i64
                    },
                    ..Default::default()
                },
            )
            .await
            .map_err(substrate_err)?;

        Ok(Box::new(JetStreamConsumer {
            client: self.client.clone(),
            stream: spec.stream,
            consumer,
        }))
    }
}

pub struct JetStreamConsumer {
    client: async_nats::Client,
    stream: String,
    consumer: jetstream::consumer::Consumer<pull::Config>,
}

impl JetStreamConsumer {
    fn reply_subject(record: &Record) -> EngineResult<&str> {
        record
            .reply
            .as_deref()
            .ok_or_else(|| EngineError::Substrate(format!("record {} has no ack token", record.id)))
    }
}

#[async_trait]
impl SubstrateConsumer for JetStreamConsumer {
    async fn fetch(&mut self, max_batch: usize, max_wait: Duration) -> EngineResult<Vec<Record>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_batch)
            .expires(max_wait)
            .messages()
            .await
            .map_err(substrate_err)?;

        let mut out = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(substrate_err)?;
            let info = message.info().map_err(substrate_err)?;
            let sequence = info.stream_sequence;
            let delivery_count = info.delivered.max(1) as u32;

            let mut headers = BTreeMap::new();
            if let Some(header_map) = &message.headers {
                for (name, values) in header_map.iter() {
                    if let Some(value) = values.first() {
                        headers.insert(name.to_string(), value.as_str().to_string());
                    }
                }
            }

            out.push(Record {
                id: RecordId {
                    stream: self.stream.clone(),
                    sequence,
                },
                subject: message.subject.to_string(),
                payload: message.payload.clone(),
                headers,
                delivery_count,
                reply: message.reply.as_ref().map(|r| r.to_string()),
            });
        }
        Ok(out)
    }

    async fn ack(&mut self, record: &Record) -> EngineResult<()> {
        let reply = Self::reply_subject(record)?.to_string();
        // Request (rather than bare publish) so the ack is confirmed by the
        // server before the caller moves on.
        self.client
            .request(reply, Bytes::from_static(b"+ACK"))
            .await
            .map_err(substrate_err)?;
        Ok(())
    }

    async fn nak(&mut self, record: &Record, delay: Option<Duration>) -> EngineResult<()> {
        let reply = Self::reply_subject(record)?.to_string();
        let payload = match delay {
            Some(d) => Bytes::from(format!("-NAK {{\"delay\": {}}}", d.as_nanos())),
            None => Bytes::from_static(b"-NAK"),
        };
        self.client
            .publish(reply, payload)
            .await
            .map_err(substrate_err)?;
        Ok(())
    }

    async fn term(&mut self, record: &Record) -> EngineResult<()> {
        let reply = Self::reply_subject(record)?.to_string();
        self.client
            .publish(reply, Bytes::from_static(b"+TERM"))
            .await
            .map_err(substrate_err)?;
        Ok(())
    }

    async fn lag(&mut self) -> EngineResult<u64> {
        let info = self.consumer.info().await.map_err(substrate_err)?;
        Ok(info.num_pending + info.num_ack_pending as u64)
    }
}
