use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentb_core::{Broker, BrokerError, InboundMessage};
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, SubscribeFilter, SubscribeReasonCode,
};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::MqttError;

const LOOP_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum MqttEvent {
    SubAck { pkid: u16, granted: bool },
}

#[derive(Clone)]
pub struct MqttService {
    client: Arc<Mutex<AsyncClient>>,
    ready: Arc<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    events_tx: broadcast::Sender<MqttEvent>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    subscriptions: Arc<RwLock<HashMap<String, QoS>>>,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MqttService {
    pub async fn connect(config: MqttConfig) -> Result<Self, MqttError> {
        let (client, eventloop) = build_client(&config);
        let (ready, _) = watch::channel(false);
        let ready = Arc::new(ready);
        let closing = Arc::new(AtomicBool::new(false));
        let (events_tx, _) = broadcast::channel(256);
        let (inbound_tx, _) = broadcast::channel(1024);
        let subscriptions = Arc::new(RwLock::new(HashMap::new()));

        let client_shared = Arc::new(Mutex::new(client));
        let shared = LoopShared {
            client: client_shared.clone(),
            ready: ready.clone(),
            closing: closing.clone(),
            events_tx: events_tx.clone(),
            inbound_tx: inbound_tx.clone(),
            subscriptions: subscriptions.clone(),
        };
        let loop_handle = tokio::spawn(run_eventloop(eventloop, shared, config));

        Ok(Self {
            client: client_shared,
            ready,
            closing,
            events_tx,
            inbound_tx,
            subscriptions,
            loop_handle: Arc::new(Mutex::new(Some(loop_handle))),
        })
    }

    /// Resolves once the broker acknowledged the connection.
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), MqttError> {
        let mut ready = self.ready.subscribe();
        let connected = matches!(timeout(limit, ready.wait_for(|r| *r)).await, Ok(Ok(_)));
        if connected {
            Ok(())
        } else {
            Err(MqttError::ConnectTimeout(limit))
        }
    }

    pub fn events(&self) -> broadcast::Receiver<MqttEvent> {
        self.events_tx.subscribe()
    }

    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound_tx.subscribe()
    }

    /// Current client handle; the lock is never held across a request.
    async fn client(&self) -> AsyncClient {
        self.client.lock().await.clone()
    }

    pub async fn publish<T: Into<Vec<u8>>>(&self, topic: &str, qos: QoS, retain: bool, payload: T) -> Result<(), MqttError> {
        self.client().await.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    /// Subscribes to every topic in one request and waits for its granted SUBACK.
    pub async fn subscribe_acked(&self, topics: &[String], qos: QoS) -> Result<(), MqttError> {
        if topics.is_empty() {
            return Ok(());
        }
        let mut events = self.events();
        for topic in topics {
            info!(%topic, "Subscribing");
        }
        let filters = topics.iter().map(|t| SubscribeFilter::new(t.clone(), qos));
        self.client().await.subscribe_many(filters).await?;
        {
            let mut subs = self.subscriptions.write().await;
            subs.extend(topics.iter().map(|t| (t.clone(), qos)));
        }
        loop {
            match events.recv().await {
                Ok(MqttEvent::SubAck { granted: true, .. }) => return Ok(()),
                Ok(MqttEvent::SubAck { pkid, granted: false }) => return Err(MqttError::SubscribeRejected(pkid)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed MQTT events while waiting for SUBACK");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(MqttError::Closed),
            }
        }
    }

    /// Disconnects and waits for the event loop task to end.
    ///
    /// Each step is bounded; a stuck loop task is aborted.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.closing.store(true, Ordering::SeqCst);
        self.ready.send_replace(false);
        let requested = timeout(LOOP_SHUTDOWN_GRACE, async { self.client().await.disconnect().await }).await;
        if let Some(mut handle) = self.loop_handle.lock().await.take() {
            let stopped = requested.is_ok() && timeout(LOOP_SHUTDOWN_GRACE, &mut handle).await.is_ok();
            if !stopped {
                warn!("MQTT event loop did not stop in time; aborting");
                handle.abort();
            }
        }
        match requested {
            Ok(result) => result.map_err(MqttError::from),
            Err(_) => Err(MqttError::ShutdownTimeout(LOOP_SHUTDOWN_GRACE)),
        }
    }
}

#[async_trait]
impl Broker for MqttService {
    fn inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages()
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        Ok(self.subscribe_acked(topics, QoS::AtMostOnce).await?)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        Ok(MqttService::publish(self, topic, QoS::AtMostOnce, false, payload).await?)
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        Ok(MqttService::disconnect(self).await?)
    }
}

fn build_client(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&config.client_id, &config.host, config.port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs as u64));
    opts.set_clean_session(config.clean_session);
    opts.set_max_packet_size(config.max_packet_size, config.max_packet_size);
    if let (Some(u), Some(p)) = (&config.username, &config.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    opts.set_request_channel_capacity(64);
    AsyncClient::new(opts, 64)
}

struct LoopShared {
    client: Arc<Mutex<AsyncClient>>,
    ready: Arc<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    events_tx: broadcast::Sender<MqttEvent>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    subscriptions: Arc<RwLock<HashMap<String, QoS>>>,
}

async fn run_eventloop(mut eventloop: EventLoop, shared: LoopShared, config: MqttConfig) {
    let mut backoff_secs = 1u64;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!(host = %config.host, "MQTT connected");
                shared.ready.send_replace(true);

                // Restore tracked subscriptions without waiting on the request
                // channel, which only this loop drains.
                let filters = restore_filters(&*shared.subscriptions.read().await);
                if !filters.is_empty() {
                    debug!(count = filters.len(), "Restoring subscriptions");
                    let client = shared.client.lock().await.clone();
                    if let Err(err) = client.try_subscribe_many(filters) {
                        warn!(?err, "Failed to restore subscriptions");
                    }
                }

                backoff_secs = 1;
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                let _ = shared.inbound_tx.send(InboundMessage {
                    topic: p.topic.to_string(),
                    payload: p.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                let _ = shared.events_tx.send(MqttEvent::SubAck { pkid: ack.pkid, granted });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT disconnect requested");
                shared.ready.send_replace(false);
                if shared.closing.load(Ordering::SeqCst) {
                    return;
                }
            }
            Ok(other) => {
                debug!(?other, "MQTT event");
            }
            Err(e) => {
                shared.ready.send_replace(false);
                if shared.closing.load(Ordering::SeqCst) {
                    debug!(error = ?e, "MQTT event loop closed");
                    return;
                }
                error!(error = ?e, "MQTT error; will attempt reconnect");

                // Exponential backoff with cap
                let wait = backoff_secs.min(30);
                sleep(Duration::from_secs(wait)).await;
                backoff_secs = (backoff_secs * 2).min(60);

                // Replace both eventloop and client with fresh instances
                let (new_client, new_eventloop) = build_client(&config);
                eventloop = new_eventloop;
                *shared.client.lock().await = new_client;
                info!("MQTT client and eventloop rebuilt, attempting reconnection");
            }
        }
    }
}

fn restore_filters(subscriptions: &HashMap<String, QoS>) -> Vec<SubscribeFilter> {
    subscriptions
        .iter()
        .map(|(topic, qos)| SubscribeFilter::new(topic.clone(), *qos))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tracked_subscription_is_restored_in_one_request() {
        let subs: HashMap<String, QoS> = (0..80)
            .map(|i| (format!("opentestbed/deviceType/mote/deviceId/m{}/resp/program", i), QoS::AtMostOnce))
            .collect();
        let filters = restore_filters(&subs);
        assert_eq!(filters.len(), 80);
        assert!(filters.iter().all(|f| f.qos == QoS::AtMostOnce));
        assert!(filters.iter().any(|f| f.path.ends_with("/m79/resp/program")));
    }

    #[tokio::test]
    async fn disconnect_is_bounded_when_the_client_is_held() {
        let config = MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..MqttConfig::default()
        };
        let service = MqttService::connect(config).await.unwrap();
        let held = service.client.lock().await;

        let started = std::time::Instant::now();
        let result = service.disconnect().await;
        assert!(matches!(result, Err(MqttError::ShutdownTimeout(_))));
        assert!(started.elapsed() < LOOP_SHUTDOWN_GRACE * 2);
        assert!(service.loop_handle.lock().await.is_none());
        drop(held);
    }
}
