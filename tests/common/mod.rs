//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use framelink::core::packet::{Packet, PacketContext};
use framelink::core::wire::{PacketReader, PacketWriter};
use framelink::error::Result;
use framelink::protocol::event::{Event, EventSink, NetworkEvent};
use framelink::protocol::registry::PacketRegistry;

/// Application packet used throughout the scenarios.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplePacket {
    pub int_a: i32,
    pub bool_b: bool,
}

impl SamplePacket {
    pub const ID: i32 = 1;
}

impl Packet for SamplePacket {
    fn id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, out: &mut PacketWriter) -> Result<()> {
        out.write_i32(self.int_a).write_bool(self.bool_b);
        Ok(())
    }

    fn decode(&mut self, _ctx: &dyn PacketContext, input: &mut PacketReader) -> Result<()> {
        self.int_a = input.read_i32()?;
        self.bool_b = input.read_bool()?;
        Ok(())
    }
}

/// Variable-length packet, large enough to expose interleaved writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobPacket {
    pub seq: u32,
    pub data: Vec<u8>,
}

impl BlobPacket {
    pub const ID: i32 = 2;
}

impl Packet for BlobPacket {
    fn id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, out: &mut PacketWriter) -> Result<()> {
        out.write_u32(self.seq).write_bytes(&self.data);
        Ok(())
    }

    fn decode(&mut self, _ctx: &dyn PacketContext, input: &mut PacketReader) -> Result<()> {
        self.seq = input.read_u32()?;
        self.data = input.read_bytes()?.to_vec();
        Ok(())
    }
}

pub fn registry() -> Arc<PacketRegistry> {
    let registry = PacketRegistry::new();
    registry.register::<SamplePacket>().unwrap();
    registry.register::<BlobPacket>().unwrap();
    Arc::new(registry)
}

/// Event sink that keeps every event it sees.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<NetworkEvent>>,
    reject_incoming: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A recorder that cancels every `IncomingConnection`.
    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            reject_incoming: true,
        })
    }

    pub fn events(&self) -> Vec<NetworkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&NetworkEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(*e)).count()
    }

    pub fn received<T: Packet + Clone>(&self) -> Vec<T> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                NetworkEvent::PacketReceived { packet, .. } => {
                    packet.downcast_ref::<T>().cloned()
                }
                _ => None,
            })
            .collect()
    }

    /// Wait until `n` packets of type `T` were received.
    pub async fn wait_for_packets<T: Packet>(&self, n: usize) {
        self.wait_for(n, |e| match e {
            NetworkEvent::PacketReceived { packet, .. } => packet.is::<T>(),
            _ => false,
        })
        .await;
    }

    /// Wait until `pred` matches at least `n` recorded events.
    pub async fn wait_for(&self, n: usize, pred: impl Fn(&NetworkEvent) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.count(&pred) >= n {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {n} matching events, saw: {:?}",
                    self.events()
                        .iter()
                        .map(NetworkEvent::name)
                        .collect::<Vec<_>>()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl EventSink for Recorder {
    fn emit(&self, event: &mut Event) {
        if self.reject_incoming && matches!(event.kind(), NetworkEvent::IncomingConnection { .. }) {
            event.cancel();
        }
        self.events.lock().unwrap().push(event.kind().clone());
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
