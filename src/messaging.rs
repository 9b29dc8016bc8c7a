//! Stand-in for the pub/sub messaging fabric (spec §6). The wire format
//! and transport are explicitly opaque; this is an in-process, named-topic
//! broadcast hub built on `crossbeam-channel` so the worker loops can be
//! written and tested against a trait boundary the real fabric would also
//! satisfy (spec §9 "pub/sub coupling").

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::errors::{Error, Result};

/// A published message: opaque bytes plus the channel name it was emitted
/// on. The daemon never inspects payloads it merely forwards (`can`,
/// `ubloxRaw`); topics it produces structured content for (`pandaState`)
/// are encoded by the caller before publishing.
#[derive(Clone, Debug)]
pub struct Message {
    pub bytes: Vec<u8>,
}

impl Message {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

pub trait Publisher: Send {
    fn publish(&self, message: Message) -> Result<()>;
}

pub trait Subscriber: Send {
    /// Block for up to `timeout` for the next message; `Ok(None)` on
    /// timeout, `Err` if the fabric was interrupted (treated as a shutdown
    /// signal per spec §7).
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>>;
}

/// In-process hub: one MPMC channel per topic. `publish` on `topic` wakes
/// every subscriber created for that same topic.
#[derive(Clone)]
pub struct Hub {
    topics: HashMap<&'static str, (Sender<Message>, Receiver<Message>)>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
        }
    }

    fn topic(&mut self, name: &'static str) -> &(Sender<Message>, Receiver<Message>) {
        self.topics
            .entry(name)
            .or_insert_with(|| crossbeam_channel::unbounded())
    }

    pub fn publisher(&mut self, name: &'static str) -> HubPublisher {
        let (sender, _) = self.topic(name).clone();
        HubPublisher { sender }
    }

    pub fn subscriber(&mut self, name: &'static str) -> HubSubscriber {
        let (_, receiver) = self.topic(name).clone();
        HubSubscriber { receiver }
    }
}

pub struct HubPublisher {
    sender: Sender<Message>,
}

impl Publisher for HubPublisher {
    fn publish(&self, message: Message) -> Result<()> {
        self.sender.send(message).map_err(|_| Error::ChannelClosed)
    }
}

pub struct HubSubscriber {
    receiver: Receiver<Message>,
}

impl Subscriber for HubSubscriber {
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_subscribe_round_trips() {
        let mut hub = Hub::new();
        let publisher = hub.publisher("can");
        let subscriber = hub.subscriber("can");

        publisher.publish(Message::new(vec![1, 2, 3])).unwrap();
        let received = subscriber
            .recv_timeout(Duration::from_millis(50))
            .unwrap()
            .expect("message delivered");
        assert_eq!(received.bytes, vec![1, 2, 3]);
    }

    #[test]
    fn subscriber_times_out_with_no_publisher_activity() {
        let mut hub = Hub::new();
        let subscriber = hub.subscriber("sendcan");
        let received = subscriber.recv_timeout(Duration::from_millis(10)).unwrap();
        assert!(received.is_none());
    }
}
