pub mod ecdsa;
pub mod ethereum;

use crate::error::Result;
use crate::storage::KeyStore;
use shared::operation::{ sorted_participants, OperationData };
use shared::operation::SigningResult;

/// 1-based index of a participant inside one session, in the order the TSS
/// library sees the parties.
pub type PartyIndex = u16;

/// A protocol frame on its way into the local party.
#[derive(Clone, Debug)]
pub struct IncomingFrame {
    pub from: PartyIndex,
    pub round: u16,
    pub is_broadcast: bool,
    pub payload: Vec<u8>,
}

/// A protocol frame produced by the local party. `to: None` broadcasts to
/// every other participant.
#[derive(Clone, Debug)]
pub struct OutgoingFrame {
    pub to: Option<PartyIndex>,
    pub round: u16,
    pub payload: Vec<u8>,
}

/// What a finished party hands back to the driver.
#[derive(Clone, Debug)]
pub enum PartyOutcome {
    Key(KeygenOutcome),
    Signature(SigningResult),
}

/// A fresh key share produced by keygen or resharing.
#[derive(Clone, Debug)]
pub struct KeygenOutcome {
    pub key_id: String,
    pub public_key_hex: String,
    pub share_blob: Vec<u8>,
}

/// One participant's local state machine within a session. This is the
/// box the driver pumps: frames in, frames out, eventually an outcome.
/// `proceed` may do heavy cryptographic work and is called off the async
/// threads.
pub trait Party: Send {
    fn handle_incoming(&mut self, frame: IncomingFrame) -> Result<()>;
    fn wants_to_proceed(&self) -> bool;
    fn proceed(&mut self) -> Result<()>;
    fn drain_outgoing(&mut self) -> Result<Vec<OutgoingFrame>>;
    fn is_finished(&self) -> bool;
    fn take_outcome(&mut self) -> Option<Result<PartyOutcome>>;
    fn current_round(&self) -> u16;
}

/// Builds the party for an operation. The production factory wires the
/// ECDSA library; tests substitute lightweight parties to exercise the
/// orchestration without the cryptography.
pub trait PartyFactory: Send + Sync {
    fn create(
        &self,
        operation: &OperationData,
        local_peer: &str,
        keys: &KeyStore
    ) -> Result<Box<dyn Party>>;
}

/// Pure mapping between peer ids and party indices: party index is the
/// 1-based position in the sorted participant list, so every node computes
/// the same mapping without coordination.
#[derive(Clone, Debug)]
pub struct PartyMap {
    ids: Vec<String>,
}

impl PartyMap {
    pub fn new(participants: &[String]) -> Self {
        Self { ids: sorted_participants(participants) }
    }

    pub fn index_of(&self, peer: &str) -> Option<PartyIndex> {
        self.ids
            .iter()
            .position(|id| id == peer)
            .map(|pos| (pos as PartyIndex) + 1)
    }

    pub fn peer_of(&self, index: PartyIndex) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.ids.get((index as usize) - 1).map(String::as_str)
    }

    pub fn peers(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> u16 {
        self.ids.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_indices_are_order_independent() {
        let a = PartyMap::new(&["pc".into(), "pa".into(), "pb".into()]);
        let b = PartyMap::new(&["pa".into(), "pb".into(), "pc".into()]);
        assert_eq!(a.index_of("pa"), Some(1));
        assert_eq!(a.index_of("pb"), Some(2));
        assert_eq!(a.index_of("pc"), Some(3));
        assert_eq!(a.index_of("pa"), b.index_of("pa"));
        assert_eq!(a.peer_of(3), Some("pc"));
        assert_eq!(a.peer_of(0), None);
        assert_eq!(a.peer_of(4), None);
        assert_eq!(a.index_of("px"), None);
    }
}
