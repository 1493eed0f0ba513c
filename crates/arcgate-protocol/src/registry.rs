//! Message-id to constructor registry used by the decoder.

use std::collections::HashMap;
use std::fmt;

use crate::messages::{builtin_factories, Msg};
use crate::types::MsgId;
use crate::wire::WireReader;
use crate::ProtocolError;

/// Decodes one message body.
pub type MsgFactory = for<'a> fn(&mut WireReader<'a>) -> Result<Msg, ProtocolError>;

/// Maps message ids to constructors.
///
/// `MsgCreator::default()` knows every built-in message. Deployments
/// that want to refuse some ids (or decode an id differently) start
/// from the default and [`unregister`](Self::unregister) or
/// [`register`](Self::register) on top.
#[derive(Clone)]
pub struct MsgCreator {
    factories: HashMap<MsgId, MsgFactory>,
}

impl MsgCreator {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers (or replaces) the constructor for `id`.
    pub fn register(&mut self, id: MsgId, factory: MsgFactory) -> &mut Self {
        self.factories.insert(id, factory);
        self
    }

    pub fn unregister(&mut self, id: MsgId) -> &mut Self {
        self.factories.remove(&id);
        self
    }

    pub fn is_registered(&self, id: MsgId) -> bool {
        self.factories.contains_key(&id)
    }

    /// Builds the message for `id` from a complete body.
    pub fn create(&self, id: MsgId, body: &[u8]) -> Result<Msg, ProtocolError> {
        let factory = self
            .factories
            .get(&id)
            .ok_or(ProtocolError::UnregisteredMsg(id))?;
        let mut reader = WireReader::new(body);
        let msg = factory(&mut reader)?;
        reader.finish()?;
        Ok(msg)
    }
}

impl Default for MsgCreator {
    fn default() -> Self {
        let mut creator = Self::empty();
        for (id, factory) in builtin_factories() {
            creator.register(id, factory);
        }
        creator
    }
}

impl fmt::Debug for MsgCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().copied().collect();
        ids.sort();
        f.debug_struct("MsgCreator").field("ids", &ids).finish()
    }
}
