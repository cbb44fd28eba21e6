//! Id-based packet registry.
//!
//! Maps packet-type ids to factories. Built once with [`PacketRegistryBuilder`]
//! and shared read-only by every connection that decodes with it, so lookups
//! need no locking.

use crate::core::codec::Decoder;
use crate::core::framing::Frame;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Factory = dyn Fn() -> Box<dyn Packet> + Send + Sync + 'static;

/// Immutable id → factory mapping.
#[derive(Clone)]
pub struct PacketRegistry {
    factories: Arc<HashMap<u32, Box<Factory>>>,
}

impl PacketRegistry {
    pub fn builder() -> PacketRegistryBuilder {
        PacketRegistryBuilder::default()
    }

    /// Construct an empty packet for `id`.
    pub fn create(&self, id: u32) -> Result<Box<dyn Packet>> {
        self.factories
            .get(&id)
            .map(|factory| factory())
            .ok_or(ProtocolError::UnknownPacketId(id))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.factories.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("PacketRegistry").field("ids", &ids).finish()
    }
}

impl Decoder for PacketRegistry {
    type Packet = Box<dyn Packet>;

    fn decode(&self, frame: Frame) -> Result<Box<dyn Packet>> {
        let id = frame.id.ok_or(ProtocolError::InvalidHeader)?;
        let mut packet = self.create(id)?;
        let mut body = frame.body;
        packet.read(&mut body)?;
        Ok(packet)
    }
}

/// Collects factories before freezing them into a [`PacketRegistry`].
#[derive(Default)]
pub struct PacketRegistryBuilder {
    factories: HashMap<u32, Box<Factory>>,
}

impl PacketRegistryBuilder {
    /// Register a packet type constructed through `Default`.
    pub fn register<T>(self, id: u32) -> Self
    where
        T: Packet + Default,
    {
        self.register_with(id, || Box::new(T::default()))
    }

    /// Register an explicit factory. A later registration for the same id wins.
    pub fn register_with<F>(mut self, id: u32, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Packet> + Send + Sync + 'static,
    {
        self.factories.insert(id, Box::new(factory));
        self
    }

    pub fn build(self) -> PacketRegistry {
        PacketRegistry {
            factories: Arc::new(self.factories),
        }
    }
}
