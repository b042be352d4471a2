use crate::error::{ Error, Result };
use crate::protocol::{ OutgoingFrame, Party, PartyFactory, PartyMap, PartyOutcome };
use crate::registry::OperationRegistry;
use crate::router::Router;
use crate::storage::KeyStore;
use crate::transport::TransportHandle;
use crate::validation::ValidationClient;
use chrono::Utc;
use libp2p::PeerId;
use shared::envelope::ProtocolEnvelope;
use shared::key_info::KeyShareBundle;
use shared::operation::{ KeygenResult, OperationData, OperationRequest, OperationResult };
use shared::validation::ValidationRequest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{ mpsc, watch };
use tracing::{ error, info, instrument, warn };

/// Everything one operation's driver task needs. All fields are cheap
/// clones of node-owned handles; the driver holds no lock while awaiting.
pub struct DriverContext {
    pub operation: OperationData,
    pub local_peer: String,
    pub registry: OperationRegistry,
    pub router: Arc<Router>,
    pub transport: TransportHandle,
    pub keys: KeyStore,
    pub factory: Arc<dyn PartyFactory>,
    pub validator: Option<Arc<ValidationClient>>,
    pub deadline: Duration,
    pub queue_size: usize,
}

enum PumpEnd {
    Outcome(PartyOutcome),
    Canceled,
    TimedOut,
}

/// Drive one operation from `pending` to a terminal status. Spawned as its
/// own task; owns the party, the inbound queue registration, and every
/// status transition of the operation.
#[instrument(skip_all, fields(operation = %ctx.operation.id))]
pub async fn run_operation(ctx: DriverContext, cancel: watch::Receiver<bool>) {
    let operation_id = ctx.operation.id.clone();
    match drive(ctx, cancel).await {
        Ok(()) => {}
        Err(err) => error!("Driver for operation {} ended with an error: {}", operation_id, err),
    }
}

async fn drive(ctx: DriverContext, mut cancel: watch::Receiver<bool>) -> Result<()> {
    let operation = &ctx.operation;
    let session_id = operation.session_id.clone();

    if *cancel.borrow() {
        ctx.registry.mark_canceled(&operation.id)?;
        return Ok(());
    }

    // Policy gate: signing only starts once the hook approves. Fail closed,
    // before any party state exists and before any round is transmitted.
    if let OperationRequest::Signing(request) = &operation.request {
        if let Some(validator) = &ctx.validator {
            let validation = ValidationRequest {
                message: request.message.clone(),
                key_id: request.key_id.clone(),
                participants: operation.participants.clone(),
                node_id: ctx.local_peer.clone(),
                timestamp: Utc::now(),
                metadata: HashMap::new(),
            };
            if let Err(err) = validator.validate(&validation).await {
                warn!("Signing operation {} rejected by validation hook", operation.id);
                ctx.registry.fail(&operation.id, err.to_string())?;
                return Ok(());
            }
        }
    }

    // Build the party off the async threads; for signing this hydrates the
    // key share, for keygen the library may precompute.
    let party = {
        let factory = ctx.factory.clone();
        let op = operation.clone();
        let local = ctx.local_peer.clone();
        let keys = ctx.keys.clone();
        tokio::task
            ::spawn_blocking(move || factory.create(&op, &local, &keys)).await
            .map_err(|err| Error::Internal(anyhow::anyhow!("party construction panicked: {err}")))?
    };
    let party = match party {
        Ok(party) => party,
        Err(err) => {
            ctx.registry.fail(&operation.id, err.to_string())?;
            return Ok(());
        }
    };

    ctx.registry.mark_in_progress(&operation.id)?;
    let inbound = ctx.router.register(&session_id, ctx.queue_size);

    let result = pump(&ctx, party, inbound, &mut cancel).await;
    ctx.router.unregister(&session_id);

    match result {
        Ok(PumpEnd::Outcome(outcome)) => finish(&ctx, outcome),
        Ok(PumpEnd::Canceled) => {
            info!("Operation {} canceled", ctx.operation.id);
            ctx.registry.mark_canceled(&ctx.operation.id)
        }
        Ok(PumpEnd::TimedOut) => {
            warn!("Operation {} exceeded its {:?} deadline", ctx.operation.id, ctx.deadline);
            ctx.registry.fail(
                &ctx.operation.id,
                Error::Timeout(format!("deadline of {:?} exceeded", ctx.deadline)).to_string()
            )
        }
        Err(err) => {
            warn!("Operation {} failed: {}", ctx.operation.id, err);
            ctx.registry.fail(&ctx.operation.id, err.to_string())
        }
    }
}

/// The four-way wait of the party pump: inbound frames, the cancellation
/// signal, the operation deadline, and (between waits) the party's own
/// appetite to proceed. Round computation runs on the blocking pool so the
/// select loop stays responsive.
async fn pump(
    ctx: &DriverContext,
    party: Box<dyn Party>,
    mut inbound: mpsc::Receiver<crate::protocol::IncomingFrame>,
    cancel: &mut watch::Receiver<bool>
) -> Result<PumpEnd> {
    let party_map = PartyMap::new(ctx.operation.request.session_participants());
    let self_index = party_map
        .index_of(&ctx.local_peer)
        .ok_or_else(|| Error::invalid("local peer left the participant set"))?;

    let deadline = tokio::time::sleep(ctx.deadline);
    tokio::pin!(deadline);

    let mut party = Some(party);

    loop {
        // Crank the machine until it neither wants to proceed nor holds
        // outgoing frames, then wait for outside input.
        loop {
            let current = party.as_mut().expect("party is always restored");
            let frames = current.drain_outgoing()?;
            dispatch(ctx, &party_map, self_index, frames);

            if current.is_finished() {
                if let Some(outcome) = current.take_outcome() {
                    return Ok(PumpEnd::Outcome(outcome?));
                }
            }

            if !current.wants_to_proceed() {
                break;
            }
            let mut owned = party.take().expect("party present");
            let (owned, proceeded) = tokio::task
                ::spawn_blocking(move || {
                    let result = owned.proceed();
                    (owned, result)
                }).await
                .map_err(|err| Error::Internal(anyhow::anyhow!("party round panicked: {err}")))?;
            party = Some(owned);
            proceeded?;
        }

        tokio::select! {
            frame = inbound.recv() => {
                match frame {
                    Some(frame) => {
                        party.as_mut().expect("party present").handle_incoming(frame)?;
                    }
                    None => {
                        return Err(Error::Transport("inbound queue closed".to_string()));
                    }
                }
            }
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Ok(PumpEnd::Canceled);
                }
            }
            _ = &mut deadline => {
                return Ok(PumpEnd::TimedOut);
            }
        }
    }
}

/// Hand outgoing frames to the transport without blocking the pump. Send
/// failures are logged; a session that cannot reach threshold runs into
/// its own deadline.
fn dispatch(ctx: &DriverContext, map: &PartyMap, self_index: u16, frames: Vec<OutgoingFrame>) {
    for frame in frames {
        let envelope = ProtocolEnvelope::new(
            ctx.operation.session_id.clone(),
            self_index,
            frame.round,
            frame.to.is_none(),
            &frame.payload
        );
        match frame.to {
            None => {
                let transport = ctx.transport.clone();
                let operation_id = ctx.operation.id.clone();
                tokio::spawn(async move {
                    if let Err(err) = transport.broadcast(envelope).await {
                        warn!("Broadcast for operation {} failed: {}", operation_id, err);
                    }
                });
            }
            Some(to) => {
                let Some(peer) = map.peer_of(to) else {
                    warn!("Party {} has no peer mapping, dropping frame", to);
                    continue;
                };
                let peer: PeerId = match peer.parse() {
                    Ok(peer) => peer,
                    Err(err) => {
                        warn!("Unparseable peer id {}: {}", peer, err);
                        continue;
                    }
                };
                let transport = ctx.transport.clone();
                let operation_id = ctx.operation.id.clone();
                tokio::spawn(async move {
                    if let Err(err) = transport.send_protocol(peer, envelope).await {
                        warn!("Send for operation {} to {} failed: {}", operation_id, peer, err);
                    }
                });
            }
        }
    }
}

/// Persist a successful outcome: signatures go straight into the operation
/// record, fresh key shares are written to the key store first (exactly
/// once per key id).
fn finish(ctx: &DriverContext, outcome: PartyOutcome) -> Result<()> {
    match outcome {
        PartyOutcome::Signature(result) => {
            info!("Operation {} produced a signature", ctx.operation.id);
            ctx.registry.complete(&ctx.operation.id, OperationResult::Signing(result))
        }
        PartyOutcome::Key(key) => {
            let (threshold, moniker) = match &ctx.operation.request {
                OperationRequest::Keygen(req) => {
                    (req.threshold, req.moniker.clone().unwrap_or_default())
                }
                OperationRequest::Resharing(req) => {
                    // carry the moniker over from the key being reshared,
                    // when this node holds it
                    let moniker = ctx.keys
                        .get(&req.key_id)
                        .map(|bundle| bundle.moniker)
                        .unwrap_or_default();
                    (req.new_threshold, moniker)
                }
                OperationRequest::Signing(_) => {
                    return Err(Error::protocol("signing produced key material"));
                }
            };
            let bundle = KeyShareBundle {
                key_id: key.key_id.clone(),
                moniker,
                threshold,
                participants: ctx.operation.participants.clone(),
                public_key_hex: key.public_key_hex.clone(),
                created_at: Utc::now(),
                share_blob: base64::encode(&key.share_blob),
            };
            if let Err(err) = ctx.keys.put(&bundle) {
                ctx.registry.fail(&ctx.operation.id, err.to_string())?;
                return Err(err);
            }
            info!("Operation {} produced key share for key id {}", ctx.operation.id, key.key_id);
            ctx.registry.complete(
                &ctx.operation.id,
                OperationResult::Keygen(KeygenResult {
                    public_key_hex: key.public_key_hex,
                    key_id: key.key_id,
                })
            )
        }
    }
}

/// Expose the terminal-state decision table for tests.
#[cfg(test)]
mod tests {
    use shared::operation::OperationStatus;

    #[test]
    fn terminal_statuses_are_final() {
        for status in [
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::Canceled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(OperationStatus::InProgress));
        }
    }
}
