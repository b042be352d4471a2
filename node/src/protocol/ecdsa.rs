use crate::error::{ Error, Result };
use crate::protocol::ethereum::{ encode_signature, ethereum_prefixed_hash };
use crate::protocol::{
    IncomingFrame,
    KeygenOutcome,
    OutgoingFrame,
    Party,
    PartyFactory,
    PartyIndex,
    PartyMap,
    PartyOutcome,
};
use crate::storage::KeyStore;
use curv::arithmetic::Converter;
use curv::elliptic::curves::Secp256k1;
use curv::BigInt;
use itertools::Itertools;
use multi_party_ecdsa::protocols::multi_party_ecdsa::gg_2020::state_machine::keygen::{
    Keygen,
    LocalKey,
    ProtocolMessage as KeygenMessage,
};
use multi_party_ecdsa::protocols::multi_party_ecdsa::gg_2020::state_machine::sign::{
    OfflineProtocolMessage,
    OfflineStage,
    PartialSignature,
    SignManual,
};
use round_based::{ Msg, StateMachine };
use serde::{ Deserialize, Serialize };
use shared::operation::{ decode_message_hex, OperationData, OperationRequest };
use tracing::debug;

/// Round tag for the partial-signature exchange that follows the offline
/// stage. Any value above the offline stage's own rounds works, as long as
/// every participant uses the same one.
const PARTIAL_SIG_ROUND: u16 = 8;

/// Local keygen party: a thin pump around the library state machine that
/// serializes message bodies and turns the produced local key into a share
/// bundle outcome. Resharing runs the same machine over the new participant
/// set.
pub struct KeygenParty {
    inner: Keygen,
    outcome: Option<Result<PartyOutcome>>,
}

impl KeygenParty {
    pub fn new(self_index: PartyIndex, threshold: u16, parties: u16) -> Result<Self> {
        let inner = Keygen::new(self_index, threshold, parties).map_err(Error::protocol)?;
        Ok(Self { inner, outcome: None })
    }
}

impl Party for KeygenParty {
    fn handle_incoming(&mut self, frame: IncomingFrame) -> Result<()> {
        let body: KeygenMessage = serde_json::from_slice(&frame.payload)?;
        let receiver = if frame.is_broadcast { None } else { Some(self.inner.party_ind()) };
        self.inner
            .handle_incoming(Msg { sender: frame.from, receiver, body })
            .map_err(Error::protocol)
    }

    fn wants_to_proceed(&self) -> bool {
        self.inner.wants_to_proceed()
    }

    fn proceed(&mut self) -> Result<()> {
        self.inner.proceed().map_err(Error::protocol)?;
        if self.inner.is_finished() && self.outcome.is_none() {
            let picked = self.inner
                .pick_output()
                .ok_or_else(|| Error::protocol("finished keygen yielded no output"))?;
            self.outcome = Some(
                picked.map_err(Error::protocol).and_then(|local_key| keygen_outcome(&local_key))
            );
        }
        Ok(())
    }

    fn drain_outgoing(&mut self) -> Result<Vec<OutgoingFrame>> {
        let round = self.inner.current_round();
        self.inner
            .message_queue()
            .drain(..)
            .map(|msg| {
                Ok(OutgoingFrame {
                    to: msg.receiver,
                    round,
                    payload: serde_json::to_vec(&msg.body)?,
                })
            })
            .collect()
    }

    fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    fn take_outcome(&mut self) -> Option<Result<PartyOutcome>> {
        self.outcome.take()
    }

    fn current_round(&self) -> u16 {
        self.inner.current_round()
    }
}

fn keygen_outcome(local_key: &LocalKey<Secp256k1>) -> Result<PartyOutcome> {
    let public_key = local_key.public_key();
    let x_coord = public_key
        .x_coord()
        .ok_or_else(|| Error::protocol("generated public key has no x coordinate"))?;
    Ok(
        PartyOutcome::Key(KeygenOutcome {
            key_id: x_coord.to_hex(),
            public_key_hex: hex::encode(&*public_key.to_bytes(true)),
            share_blob: serde_json::to_vec(local_key)?,
        })
    )
}

/// Messages a signing session exchanges: the offline stage's own protocol
/// messages, then one broadcast round of partial signatures.
#[derive(Serialize, Deserialize)]
pub enum SigningMessage {
    Offline(OfflineProtocolMessage),
    Partial(PartialSignature),
}

/// Local signing party. Drives the offline stage to completion, then
/// broadcasts its partial signature and completes once every co-signer's
/// partial arrived. Partials that race ahead of the local offline stage are
/// buffered.
pub struct SigningParty {
    offline: Option<OfflineStage>,
    pending: Option<SignManual>,
    received_partials: Vec<PartialSignature>,
    message_hash: BigInt,
    self_index: PartyIndex,
    signers: u16,
    queue: Vec<OutgoingFrame>,
    outcome: Option<Result<PartyOutcome>>,
    done: bool,
}

impl SigningParty {
    pub fn new(
        self_index: PartyIndex,
        signers: u16,
        keygen_indices: Vec<u16>,
        local_key: LocalKey<Secp256k1>,
        message_hash: BigInt
    ) -> Result<Self> {
        let offline = OfflineStage::new(self_index, keygen_indices, local_key).map_err(
            Error::protocol
        )?;
        Ok(Self {
            offline: Some(offline),
            pending: None,
            received_partials: Vec::new(),
            message_hash,
            self_index,
            signers,
            queue: Vec::new(),
            outcome: None,
            done: false,
        })
    }

    fn pump_offline_queue(&mut self) -> Result<()> {
        if let Some(offline) = &mut self.offline {
            let round = offline.current_round();
            for msg in offline.message_queue().drain(..) {
                self.queue.push(OutgoingFrame {
                    to: msg.receiver,
                    round,
                    payload: serde_json::to_vec(&SigningMessage::Offline(msg.body))?,
                });
            }
        }
        Ok(())
    }

    fn finish_offline_stage(&mut self) -> Result<()> {
        let mut offline = match self.offline.take() {
            Some(offline) if offline.is_finished() => offline,
            other => {
                self.offline = other;
                return Ok(());
            }
        };
        let completed = offline
            .pick_output()
            .ok_or_else(|| Error::protocol("offline stage finished without output"))?
            .map_err(Error::protocol)?;
        let (manual, own_partial) = SignManual::new(self.message_hash.clone(), completed).map_err(
            Error::protocol
        )?;
        self.queue.push(OutgoingFrame {
            to: None,
            round: PARTIAL_SIG_ROUND,
            payload: serde_json::to_vec(&SigningMessage::Partial(own_partial))?,
        });
        self.pending = Some(manual);
        self.try_complete()
    }

    fn try_complete(&mut self) -> Result<()> {
        let expected = (self.signers as usize) - 1;
        if self.pending.is_none() || self.received_partials.len() < expected {
            return Ok(());
        }
        let manual = self.pending.take().expect("pending signature checked above");
        let partials: Vec<PartialSignature> = self.received_partials.drain(..).collect();
        let result = manual
            .complete(&partials)
            .map(|sig| PartyOutcome::Signature(encode_signature(&sig)))
            .map_err(Error::protocol);
        self.outcome = Some(result);
        self.done = true;
        Ok(())
    }
}

impl Party for SigningParty {
    fn handle_incoming(&mut self, frame: IncomingFrame) -> Result<()> {
        match serde_json::from_slice::<SigningMessage>(&frame.payload)? {
            SigningMessage::Offline(body) => {
                match &mut self.offline {
                    Some(offline) => {
                        let receiver = if frame.is_broadcast {
                            None
                        } else {
                            Some(self.self_index)
                        };
                        offline
                            .handle_incoming(Msg { sender: frame.from, receiver, body })
                            .map_err(Error::protocol)?;
                    }
                    None => {
                        debug!("Dropping offline-stage frame received after stage completion");
                    }
                }
                Ok(())
            }
            SigningMessage::Partial(partial) => {
                self.received_partials.push(partial);
                self.try_complete()
            }
        }
    }

    fn wants_to_proceed(&self) -> bool {
        match &self.offline {
            Some(offline) => offline.wants_to_proceed() || offline.is_finished(),
            None => false,
        }
    }

    fn proceed(&mut self) -> Result<()> {
        if let Some(offline) = &mut self.offline {
            if !offline.is_finished() && offline.wants_to_proceed() {
                offline.proceed().map_err(Error::protocol)?;
            }
        }
        self.pump_offline_queue()?;
        self.finish_offline_stage()
    }

    fn drain_outgoing(&mut self) -> Result<Vec<OutgoingFrame>> {
        self.pump_offline_queue()?;
        Ok(std::mem::take(&mut self.queue))
    }

    fn is_finished(&self) -> bool {
        self.done
    }

    fn take_outcome(&mut self) -> Option<Result<PartyOutcome>> {
        self.outcome.take()
    }

    fn current_round(&self) -> u16 {
        match &self.offline {
            Some(offline) => offline.current_round(),
            None => PARTIAL_SIG_ROUND,
        }
    }
}

/// Production factory: maps the operation onto the GG20 state machines.
pub struct EcdsaPartyFactory;

impl PartyFactory for EcdsaPartyFactory {
    fn create(
        &self,
        operation: &OperationData,
        local_peer: &str,
        keys: &KeyStore
    ) -> Result<Box<dyn Party>> {
        let map = PartyMap::new(operation.request.session_participants());
        let self_index = map
            .index_of(local_peer)
            .ok_or_else(|| {
                Error::invalid(format!("local peer {} is not a session participant", local_peer))
            })?;

        match &operation.request {
            OperationRequest::Keygen(req) => {
                Ok(Box::new(KeygenParty::new(self_index, req.threshold, map.len())?))
            }
            OperationRequest::Resharing(req) => {
                Ok(Box::new(KeygenParty::new(self_index, req.new_threshold, map.len())?))
            }
            OperationRequest::Signing(req) => {
                let bundle = keys.get(&req.key_id)?;
                let local_key: LocalKey<Secp256k1> = serde_json
                    ::from_slice(
                        &bundle
                            .share_bytes()
                            .map_err(|err| {
                                Error::Storage(format!("corrupt share blob: {}", err))
                            })?
                    )
                    .map_err(|err| Error::Storage(format!("unreadable local key: {}", err)))?;

                let keygen_map = PartyMap::new(&bundle.participants);
                let keygen_indices: Vec<u16> = map
                    .peers()
                    .iter()
                    .map(|peer| {
                        keygen_map
                            .index_of(peer)
                            .ok_or_else(|| {
                                Error::invalid(
                                    format!("{} did not participate in keygen for {}", peer, req.key_id)
                                )
                            })
                    })
                    .try_collect()?;

                let message = decode_message_hex(&req.message).map_err(|err| {
                    Error::invalid(format!("message is not valid hex: {}", err))
                })?;
                let digest = ethereum_prefixed_hash(&message);

                Ok(
                    Box::new(
                        SigningParty::new(
                            self_index,
                            map.len(),
                            keygen_indices,
                            local_key,
                            BigInt::from_bytes(&digest)
                        )?
                    )
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IncomingFrame;

    #[test]
    fn keygen_party_rejects_degenerate_parameters() {
        // threshold must leave at least one honest co-signer
        assert!(KeygenParty::new(1, 0, 3).is_err() || KeygenParty::new(1, 3, 3).is_err());
    }

    #[test]
    fn keygen_party_first_round_wants_to_proceed() {
        let party = KeygenParty::new(1, 1, 3).unwrap();
        assert!(party.wants_to_proceed());
        assert!(!party.is_finished());
    }

    /// Pump a set of parties against each other in-process until every one
    /// finished. Panics on deadlock.
    fn run_local_session(mut parties: Vec<Box<dyn Party>>) -> Vec<PartyOutcome> {
        let count = parties.len();
        let mut outcomes: Vec<Option<PartyOutcome>> = (0..count).map(|_| None).collect();

        loop {
            let mut progressed = false;
            let mut deliveries: Vec<(usize, IncomingFrame)> = Vec::new();

            for (index, party) in parties.iter_mut().enumerate() {
                if outcomes[index].is_some() {
                    continue;
                }
                while party.wants_to_proceed() {
                    party.proceed().unwrap();
                    progressed = true;
                }
                for frame in party.drain_outgoing().unwrap() {
                    progressed = true;
                    let make = |_: usize| IncomingFrame {
                        from: (index as u16) + 1,
                        round: frame.round,
                        is_broadcast: frame.to.is_none(),
                        payload: frame.payload.clone(),
                    };
                    match frame.to {
                        None => {
                            for target in 0..count {
                                if target != index {
                                    deliveries.push((target, make(target)));
                                }
                            }
                        }
                        Some(to) => deliveries.push(((to as usize) - 1, make(0))),
                    }
                }
                if party.is_finished() {
                    if let Some(outcome) = party.take_outcome() {
                        outcomes[index] = Some(outcome.unwrap());
                        progressed = true;
                    }
                }
            }

            for (target, frame) in deliveries {
                if outcomes[target].is_none() {
                    parties[target].handle_incoming(frame).unwrap();
                    progressed = true;
                }
            }

            if outcomes.iter().all(|outcome| outcome.is_some()) {
                return outcomes.into_iter().map(|outcome| outcome.unwrap()).collect();
            }
            assert!(progressed, "session deadlocked");
        }
    }

    #[test]
    #[ignore = "runs full GG20 keygen and signing; several minutes in debug builds"]
    fn full_keygen_then_signing_round_trip() {
        let keygens: Vec<Box<dyn Party>> = (1..=3u16)
            .map(|index| Box::new(KeygenParty::new(index, 1, 3).unwrap()) as Box<dyn Party>)
            .collect();
        let outcomes = run_local_session(keygens);

        let mut shares = Vec::new();
        let mut key_ids = Vec::new();
        for outcome in outcomes {
            let PartyOutcome::Key(key) = outcome else {
                panic!("keygen must yield key outcomes");
            };
            let local_key: LocalKey<Secp256k1> = serde_json::from_slice(&key.share_blob).unwrap();
            shares.push(local_key);
            key_ids.push(key.key_id);
        }
        assert_eq!(key_ids[0], key_ids[1]);
        assert_eq!(key_ids[1], key_ids[2]);

        // sign with parties 1 and 2 of the keygen set
        let digest = ethereum_prefixed_hash(b"Hello");
        let hash = BigInt::from_bytes(&digest);
        let signers: Vec<Box<dyn Party>> = vec![
            Box::new(
                SigningParty::new(1, 2, vec![1, 2], shares[0].clone(), hash.clone()).unwrap()
            ),
            Box::new(SigningParty::new(2, 2, vec![1, 2], shares[1].clone(), hash).unwrap())
        ];
        let outcomes = run_local_session(signers);
        let mut signatures = Vec::new();
        for outcome in outcomes {
            let PartyOutcome::Signature(signature) = outcome else {
                panic!("signing must yield signatures");
            };
            assert!(signature.v <= 1);
            signatures.push(signature);
        }
        assert_eq!(signatures[0], signatures[1]);
    }
}
