// Local crates
use crate::helpers::load_config::{KafkaConfig, ProducerType};

// External crates
use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::fmt;
use std::future::Future;

/// Broker failures, split into the class the shipper retries forever and the
/// class it surfaces to the operator.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("retryable broker error: {0}")]
    Retryable(String),
    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Retryable(_))
    }
}

/// The publish contract the shipper requires of a broker client: deliver a
/// group of lines to a topic and either acknowledge or fail, with retryable
/// failures distinguishable from fatal ones.
pub trait Broker: Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        lines: &[String],
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// Kafka-backed broker client built on rdkafka's `FutureProducer`.
///
/// `sync` awaits each record's delivery report before enqueuing the next;
/// `async` enqueues the whole batch and then awaits every report. Either way
/// `publish` returns only once the full batch is acknowledged.
pub struct KafkaBroker {
    producer: FutureProducer,
    producer_type: ProducerType,
}

impl fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("producer_type", &self.producer_type)
            .finish_non_exhaustive()
    }
}

impl KafkaBroker {
    pub fn from_config(config: &KafkaConfig) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .create()
            .context("failed to create kafka producer")?;

        Ok(Self {
            producer,
            producer_type: config.producer_type,
        })
    }

    async fn send_one(&self, topic: &str, line: &str) -> Result<(), BrokerError> {
        let record = FutureRecord::<(), str>::to(topic).payload(line);
        match self.producer.send(record, Timeout::Never).await {
            Ok(_) => Ok(()),
            Err((err, _message)) => Err(classify(err)),
        }
    }
}

impl Broker for KafkaBroker {
    async fn publish(&self, topic: &str, lines: &[String]) -> Result<(), BrokerError> {
        match self.producer_type {
            ProducerType::Sync => {
                for line in lines {
                    self.send_one(topic, line).await?;
                }
            }
            ProducerType::Async => {
                let pending: Vec<_> = lines.iter().map(|l| self.send_one(topic, l)).collect();
                for result in futures::future::join_all(pending).await {
                    result?;
                }
            }
        }
        Ok(())
    }
}

/// Metadata-unavailable and transport-level errors resolve on their own once
/// the cluster settles, so they map to the retryable class. Everything else
/// is surfaced.
fn classify(err: KafkaError) -> BrokerError {
    let retryable = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::NetworkException
        )
    );

    if retryable {
        BrokerError::Retryable(err.to_string())
    } else {
        BrokerError::Fatal(err.to_string())
    }
}
