//! Async broker sink.
//!
//! Wraps the rdkafka producer into the channel shape the forwarder consumes:
//! an input channel of produce requests plus success and failure response
//! streams carrying the message id as metadata. A dispatcher task turns each
//! request into a delivery future and routes completions to the response
//! streams, so sends never wait for broker round trips.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::future::BoxFuture;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerErrorKind};
use crate::metrics::RelayMetrics;
use crate::model::MessageId;
use crate::retry::RetryConfig;

/// Capacity of the sink's response streams.
const RESPONSE_CHANNEL_CAPACITY: usize = 256;

/// A produce request keyed by message id.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    /// Destination topic
    pub topic: String,
    /// Partition key
    pub partition_key: String,
    /// Message payload
    pub payload: Vec<u8>,
    /// Message id carried as metadata through the broker round trip
    pub uid: MessageId,
}

/// A confirmed delivery.
#[derive(Debug, Clone)]
pub struct SinkAck {
    /// Message id of the delivered request
    pub uid: MessageId,
    /// Topic it was delivered to
    pub topic: String,
}

/// A failed delivery.
#[derive(Debug, Clone)]
pub struct ProduceFailure {
    /// Message id of the failed request
    pub uid: MessageId,
    /// Topic the request targeted
    pub topic: String,
    /// Failure classification
    pub kind: BrokerErrorKind,
    /// Client library error text
    pub reason: String,
}

/// Sending half of a sink. Dropping it closes the input channel; the
/// dispatcher then drains outstanding deliveries and closes the response
/// streams.
pub struct SinkHandle {
    input: mpsc::Sender<ProduceRequest>,
}

impl SinkHandle {
    /// Build a handle from the input channel of a sink implementation.
    pub fn new(input: mpsc::Sender<ProduceRequest>) -> Self {
        Self { input }
    }

    /// Enqueue a produce request.
    pub async fn send(&self, request: ProduceRequest) -> Result<(), BrokerError> {
        self.input
            .send(request)
            .await
            .map_err(|_| BrokerError::SinkClosed)
    }
}

/// Receiving half of a sink: the success and failure response streams.
pub struct SinkResponses {
    /// Confirmed deliveries
    pub successes: mpsc::Receiver<SinkAck>,
    /// Failed deliveries
    pub failures: mpsc::Receiver<ProduceFailure>,
}

/// Connects a sink for a forwarding session.
///
/// The production implementation is [`KafkaSinkConnector`]; tests script the
/// broker by providing their own connector.
#[async_trait::async_trait]
pub trait SinkConnector: Send + Sync {
    /// Establish the sink, retrying until it is up. Returns `None` when
    /// cancelled before a connection could be established.
    async fn connect(
        &self,
        config: &BrokerConfig,
        cancel: &CancellationToken,
    ) -> Option<(SinkHandle, SinkResponses)>;
}

/// [`SinkConnector`] backed by an rdkafka asynchronous producer.
pub struct KafkaSinkConnector {
    metrics: Arc<RelayMetrics>,
}

impl KafkaSinkConnector {
    /// Create a connector.
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self { metrics }
    }

    fn build_producer(config: &BrokerConfig) -> Result<FutureProducer, BrokerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            // The store redelivers on nack; idempotence keeps broker-side
            // retries from multiplying duplicates further.
            .set("enable.idempotence", "true");

        if let Some(ref protocol) = config.security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = config.security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = config.security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = config.security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = config.security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
        }
        if let Some(ref path) = config.security.ssl_cert_location {
            client_config.set("ssl.certificate.location", path.to_string_lossy().as_ref());
        }
        if let Some(ref path) = config.security.ssl_key_location {
            client_config.set("ssl.key.location", path.to_string_lossy().as_ref());
        }

        client_config.create().map_err(|e| BrokerError::ConnectionFailed {
            brokers: config.bootstrap_servers.join(","),
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl SinkConnector for KafkaSinkConnector {
    async fn connect(
        &self,
        config: &BrokerConfig,
        cancel: &CancellationToken,
    ) -> Option<(SinkHandle, SinkResponses)> {
        let retry = RetryConfig::for_broker_connect();
        let mut attempt: u32 = 0;

        let producer = loop {
            match Self::build_producer(config) {
                Ok(producer) => {
                    debug!("Got a broker producer");
                    break producer;
                }
                Err(e) => {
                    self.metrics.record_broker_connection_error();
                    warn!(error = %e, "Error creating a broker producer");
                    let delay = retry.calculate_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        let (input_tx, input_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let (success_tx, successes) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let (failure_tx, failures) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);

        let flush_timeout = Duration::from_millis(config.flush_timeout_ms);
        tokio::spawn(dispatch(
            producer,
            input_rx,
            success_tx,
            failure_tx,
            flush_timeout,
        ));

        Some((
            SinkHandle { input: input_tx },
            SinkResponses {
                successes,
                failures,
            },
        ))
    }
}

type DeliveryOutcome = (MessageId, String, Result<(), (BrokerErrorKind, String)>);

/// Turn produce requests into delivery futures and route completions to the
/// response streams. Runs until the input channel closes, then drains.
async fn dispatch(
    producer: FutureProducer,
    mut input_rx: mpsc::Receiver<ProduceRequest>,
    success_tx: mpsc::Sender<SinkAck>,
    failure_tx: mpsc::Sender<ProduceFailure>,
    flush_timeout: Duration,
) {
    let mut pending: FuturesUnordered<BoxFuture<'static, DeliveryOutcome>> =
        FuturesUnordered::new();
    let mut input_open = true;

    while input_open || !pending.is_empty() {
        tokio::select! {
            maybe_request = input_rx.recv(), if input_open => match maybe_request {
                Some(request) => {
                    let record = FutureRecord::to(&request.topic)
                        .key(&request.partition_key)
                        .payload(&request.payload);
                    match producer.send_result(record) {
                        Ok(delivery) => {
                            let uid = request.uid;
                            let topic = request.topic.clone();
                            pending.push(Box::pin(async move {
                                let outcome = match delivery.await {
                                    Ok(Ok(_)) => Ok(()),
                                    Ok(Err((e, _))) => Err((classify(&e), e.to_string())),
                                    Err(_cancelled) => Err((
                                        BrokerErrorKind::Transient,
                                        "delivery future cancelled".to_string(),
                                    )),
                                };
                                (uid, topic, outcome)
                            }));
                        }
                        Err((e, _)) => {
                            let _ = failure_tx
                                .send(ProduceFailure {
                                    uid: request.uid,
                                    topic: request.topic,
                                    kind: classify(&e),
                                    reason: e.to_string(),
                                })
                                .await;
                        }
                    }
                }
                None => input_open = false,
            },

            Some((uid, topic, outcome)) = pending.next(), if !pending.is_empty() => {
                match outcome {
                    Ok(()) => {
                        let _ = success_tx.send(SinkAck { uid, topic }).await;
                    }
                    Err((kind, reason)) => {
                        let _ = failure_tx
                            .send(ProduceFailure { uid, topic, kind, reason })
                            .await;
                    }
                }
            }
        }
    }

    if let Err(e) = producer.flush(flush_timeout) {
        warn!(error = %e, "Producer flush on close failed");
    }
    info!("Broker sink dispatcher stopped");
}

/// Map a client library error to the fatal/retriable taxonomy. Everything
/// not explicitly fatal is retriable via nack.
fn classify(error: &KafkaError) -> BrokerErrorKind {
    match error {
        KafkaError::MessageProduction(code) => classify_code(*code),
        KafkaError::ClientConfig(..) | KafkaError::ClientCreation(_) => {
            BrokerErrorKind::InvalidConfig
        }
        _ => BrokerErrorKind::Transient,
    }
}

fn classify_code(code: RDKafkaErrorCode) -> BrokerErrorKind {
    match code {
        RDKafkaErrorCode::SaslAuthenticationFailed | RDKafkaErrorCode::Authentication => {
            BrokerErrorKind::AuthFailure
        }
        RDKafkaErrorCode::TopicAuthorizationFailed
        | RDKafkaErrorCode::GroupAuthorizationFailed
        | RDKafkaErrorCode::ClusterAuthorizationFailed => BrokerErrorKind::TopicAuthFailure,
        RDKafkaErrorCode::InvalidConfig => BrokerErrorKind::InvalidConfig,
        _ => BrokerErrorKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert_eq!(
            classify_code(RDKafkaErrorCode::SaslAuthenticationFailed),
            BrokerErrorKind::AuthFailure
        );
        assert_eq!(
            classify_code(RDKafkaErrorCode::TopicAuthorizationFailed),
            BrokerErrorKind::TopicAuthFailure
        );
        assert!(classify_code(RDKafkaErrorCode::SaslAuthenticationFailed).is_fatal());
    }

    #[test]
    fn test_transient_classification() {
        assert_eq!(
            classify_code(RDKafkaErrorCode::QueueFull),
            BrokerErrorKind::Transient
        );
        assert_eq!(
            classify_code(RDKafkaErrorCode::MessageTimedOut),
            BrokerErrorKind::Transient
        );
        assert_eq!(
            classify_code(RDKafkaErrorCode::AllBrokersDown),
            BrokerErrorKind::Transient
        );
        assert!(!classify_code(RDKafkaErrorCode::QueueFull).is_fatal());
    }
}
