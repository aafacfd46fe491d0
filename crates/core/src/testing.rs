use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::broker::{Broker, BrokerError, InboundMessage};

type Responder = Box<dyn Fn(&str) -> Vec<InboundMessage> + Send + Sync>;

/// In-memory broker that records traffic and answers publishes from a closure.
pub(crate) struct FakeBroker {
    inbound: broadcast::Sender<InboundMessage>,
    log: Mutex<Vec<String>>,
    acks: bool,
    disconnected: AtomicBool,
    responder: Option<Responder>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        let (inbound, _) = broadcast::channel(64);
        Self {
            inbound,
            log: Mutex::new(Vec::new()),
            acks: true,
            disconnected: AtomicBool::new(false),
            responder: None,
        }
    }
}

impl FakeBroker {
    pub(crate) fn never_acks() -> Self {
        Self {
            acks: false,
            ..Self::default()
        }
    }

    pub(crate) fn responding<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Vec<InboundMessage> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn published(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|l| l.strip_prefix("pub ").map(str::to_string))
            .collect()
    }

    /// Handle for delivering messages later, outside of any publish.
    pub(crate) fn injector(&self) -> broadcast::Sender<InboundMessage> {
        self.inbound.clone()
    }

    pub(crate) fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for FakeBroker {
    fn inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        if !self.acks {
            std::future::pending::<()>().await;
        }
        let mut log = self.log.lock().unwrap();
        log.extend(topics.iter().map(|t| format!("sub {}", t)));
        Ok(())
    }

    async fn publish(&self, topic: &str, _payload: Vec<u8>) -> Result<(), BrokerError> {
        self.log.lock().unwrap().push(format!("pub {}", topic));
        if let Some(responder) = &self.responder {
            for message in responder(topic) {
                let _ = self.inbound.send(message);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}
