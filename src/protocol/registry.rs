use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::core::codec::Frame;
use crate::core::packet::{is_system_id, Packet, PacketContext};
use crate::core::wire::{PacketReader, PacketWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::system::{ClientIdPacket, DisconnectPacket};

type FactoryFn = dyn Fn() -> Box<dyn Packet> + Send + Sync + 'static;

/// Maps packet ids to factories producing fresh, zero-valued instances.
///
/// A new registry already contains the system packets. User packets must use
/// ids `> 0`; registering an id twice fails. Lookups and registration are
/// safe from any number of receive tasks at once.
pub struct PacketRegistry {
    factories: RwLock<HashMap<i32, Arc<FactoryFn>>>,
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("ids", &self.registered_ids())
            .finish()
    }
}

impl PacketRegistry {
    pub fn new() -> Self {
        let mut factories: HashMap<i32, Arc<FactoryFn>> = HashMap::new();
        factories.insert(
            ClientIdPacket::ID,
            Arc::new(|| Box::new(ClientIdPacket::default()) as Box<dyn Packet>),
        );
        factories.insert(
            DisconnectPacket::ID,
            Arc::new(|| Box::new(DisconnectPacket::default()) as Box<dyn Packet>),
        );
        Self {
            factories: RwLock::new(factories),
        }
    }

    /// Register a packet type constructed through `Default`.
    pub fn register<P>(&self) -> Result<()>
    where
        P: Packet + Default,
    {
        self.register_with(P::default)
    }

    /// Register a packet type with an explicit factory.
    ///
    /// The id is taken from a prototype built by the factory.
    pub fn register_with<P, F>(&self, factory: F) -> Result<()>
    where
        P: Packet,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let id = factory().id();
        if is_system_id(id) {
            return Err(ProtocolError::ReservedPacketId(id));
        }

        let mut factories = self
            .factories
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        if factories.contains_key(&id) {
            return Err(ProtocolError::DuplicatePacketId(id));
        }

        factories.insert(id, Arc::new(move || Box::new(factory()) as Box<dyn Packet>));
        Ok(())
    }

    pub fn is_registered(&self, id: i32) -> bool {
        self.factories
            .read()
            .map(|factories| factories.contains_key(&id))
            .unwrap_or(false)
    }

    /// Sorted list of every registered id, system ids included.
    pub fn registered_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .factories
            .read()
            .map(|factories| factories.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.factories.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fresh instance of the type registered under `id`.
    pub fn lookup(&self, id: i32) -> Option<Box<dyn Packet>> {
        // Clone the factory out so user code never runs under the lock.
        let factory = self.factories.read().ok()?.get(&id).cloned()?;
        Some(factory())
    }

    /// Encode `packet` into a frame ready for the writer.
    pub fn encode(&self, packet: &dyn Packet) -> Result<Frame> {
        let id = packet.id();
        if !self.is_registered(id) {
            return Err(ProtocolError::UnregisteredPacket(id));
        }

        let mut out = PacketWriter::new();
        packet.encode(&mut out)?;
        Ok(Frame::packet(id, out.into_bytes()))
    }

    /// Decode `body` into a fresh instance of the type registered under `id`.
    pub fn decode(
        &self,
        id: i32,
        body: Bytes,
        ctx: &dyn PacketContext,
    ) -> Result<Box<dyn Packet>> {
        let mut packet = self
            .lookup(id)
            .ok_or(ProtocolError::UnregisteredPacket(id))?;
        self.decode_into(id, packet.as_mut(), body, ctx)?;
        Ok(packet)
    }

    /// Decode `body` into an existing packet whose id must equal `id`.
    pub fn decode_into(
        &self,
        id: i32,
        packet: &mut dyn Packet,
        body: Bytes,
        ctx: &dyn PacketContext,
    ) -> Result<()> {
        if !self.is_registered(id) {
            return Err(ProtocolError::UnregisteredPacket(id));
        }
        if packet.id() != id {
            return Err(ProtocolError::PacketIdMismatch {
                expected: id,
                actual: packet.id(),
            });
        }

        let mut input = PacketReader::new(body);
        packet.decode(ctx, &mut input)?;
        input.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Score {
        value: i32,
    }

    impl Packet for Score {
        fn id(&self) -> i32 {
            1
        }

        fn encode(&self, out: &mut PacketWriter) -> Result<()> {
            out.write_i32(self.value);
            Ok(())
        }

        fn decode(&mut self, _ctx: &dyn PacketContext, input: &mut PacketReader) -> Result<()> {
            self.value = input.read_i32()?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct ScoreV2;

    impl Packet for ScoreV2 {
        fn id(&self) -> i32 {
            1
        }

        fn encode(&self, _out: &mut PacketWriter) -> Result<()> {
            Ok(())
        }

        fn decode(&mut self, _ctx: &dyn PacketContext, _input: &mut PacketReader) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Rogue;

    impl Packet for Rogue {
        fn id(&self) -> i32 {
            -1
        }

        fn encode(&self, _out: &mut PacketWriter) -> Result<()> {
            Ok(())
        }

        fn decode(&mut self, _ctx: &dyn PacketContext, _input: &mut PacketReader) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn new_registry_holds_system_packets() {
        let registry = PacketRegistry::new();
        assert_eq!(registry.registered_ids(), vec![-2, -1]);
        assert!(registry.is_registered(ClientIdPacket::ID));
    }

    #[test]
    fn duplicate_id_rejected() {
        let registry = PacketRegistry::new();
        registry.register::<Score>().unwrap();
        assert!(matches!(
            registry.register::<ScoreV2>(),
            Err(ProtocolError::DuplicatePacketId(1))
        ));
    }

    #[test]
    fn reserved_id_rejected() {
        let registry = PacketRegistry::new();
        assert!(matches!(
            registry.register::<Rogue>(),
            Err(ProtocolError::ReservedPacketId(-1))
        ));
        // the system packet is untouched
        assert!(registry.lookup(-1).unwrap().is::<ClientIdPacket>());
    }

    #[test]
    fn lookup_returns_fresh_instances() {
        let registry = PacketRegistry::new();
        registry.register_with(|| Score { value: 0 }).unwrap();
        let packet = registry.lookup(1).unwrap();
        assert_eq!(packet.downcast_ref::<Score>().unwrap().value, 0);
        assert!(registry.lookup(99).is_none());
    }

    #[test]
    fn encode_unregistered_fails() {
        let registry = PacketRegistry::new();
        assert!(matches!(
            registry.encode(&Score { value: 1 }),
            Err(ProtocolError::UnregisteredPacket(1))
        ));
    }
}
