use std::sync::{Arc, Mutex};

use obvchan_crypto::{aead, Secret};
use obvchan_protocol::codec::encode_channel_message;
use obvchan_protocol::{
    ApplicationMessage, AttachmentDescriptor, ChannelMessage, CryptoIdentity, DialogCategory,
    DialogMessage, Envelope, InstanceId, ProtocolKind, ServerQuery, ServerResponse, Uid,
};

use super::{connected_pair, introduce, Device};
use crate::context::ReceptionChannelInfo;
use crate::decryptor::{
    DecryptionOutcome, Decryptor, KeyUnwrapper, UnwrapAttempt, UnwrapKind, UnwrappedKey,
};
use crate::delegates::IdentityDelegate;
use crate::error::EngineError;
use crate::memory::MemoryNetwork;
use crate::outbox::CONTENT_AAD;
use crate::store::{ChannelKey, Database};
use crate::ProtocolManager;

fn text(payload: &str) -> ApplicationMessage {
    ApplicationMessage {
        payload: payload.as_bytes().to_vec(),
        attachments: vec![],
    }
}

fn send(network: &MemoryNetwork, from: &Device, to: &Device, message: ApplicationMessage) -> Envelope {
    from.manager
        .send_application_message(from.identity, to.identity, message)
        .unwrap();
    network.pop_for(&to.uid).unwrap()
}

#[test]
fn swapped_seed_leaves_nothing_to_unwrap() {
    let network = Arc::new(MemoryNetwork::new());
    let (alice, bob) = connected_pair(&network);

    // Bob's end of the channel is replaced with one on another seed.
    let key = ChannelKey {
        owner_device: bob.uid,
        remote_identity: alice.identity,
        remote_device: alice.uid,
    };
    let store = bob.manager.store();
    let mut ctx = store.begin().unwrap();
    let db = ctx.db_mut();
    db.channels.delete(&key);
    db.channels
        .create(bob.identity, key, Secret::from_bytes([9u8; 32]), 1)
        .unwrap();
    db.channels.confirm(&key).unwrap();
    store.commit(ctx).unwrap();

    let envelope = send(&network, &alice, &bob, text("hello"));
    assert_eq!(bob.receive(&envelope), DecryptionOutcome::NoKeyCouldUnwrap);
}

#[test]
fn protocol_content_is_not_an_application_message() {
    let network = Arc::new(MemoryNetwork::new());
    let (alice, bob) = connected_pair(&network);
    alice
        .manager
        .start_channel_creation(alice.identity, bob.identity, bob.uid)
        .unwrap();
    let ping = network.pop_for(&bob.uid).unwrap();

    assert!(matches!(
        bob.manager.decrypt_application_message(&ping),
        Err(EngineError::NotAnApplicationMessage)
    ));
    // Nothing ran on bob's side.
    assert_eq!(bob.instance_count(ProtocolKind::ChannelCreationWithContactDevice), 0);
    assert!(bob.channel_with(&alice).unwrap().confirmed);
}

#[test]
fn decryption_is_idempotent() {
    let network = Arc::new(MemoryNetwork::new());
    let (alice, bob) = connected_pair(&network);
    let envelope = send(&network, &alice, &bob, text("twice"));

    let first = bob.receive(&envelope);
    let second = bob.receive(&envelope);
    assert!(matches!(first, DecryptionOutcome::RemoteIdentityResolved(_)));
    assert_eq!(first, second);

    let resolved = bob.manager.decrypt_application_message(&envelope).unwrap();
    assert_eq!(DecryptionOutcome::RemoteIdentityResolved(resolved), first);
}

#[test]
fn attachment_count_mismatch_cannot_be_parsed() {
    let network = Arc::new(MemoryNetwork::new());
    let (alice, bob) = connected_pair(&network);
    let message = ApplicationMessage {
        payload: b"photo".to_vec(),
        attachments: vec![AttachmentDescriptor {
            key: [3u8; 32],
            length: 2048,
            metadata: b"image/jpeg".to_vec(),
        }],
    };
    let mut envelope = send(&network, &alice, &bob, message);
    assert_eq!(envelope.known_attachment_count, 1);

    envelope.known_attachment_count = 2;
    assert_eq!(bob.receive(&envelope), DecryptionOutcome::CouldNotParse);
}

#[test]
fn extended_payload_key_is_derived_when_announced() {
    let network = Arc::new(MemoryNetwork::new());
    let (alice, bob) = connected_pair(&network);
    let mut envelope = send(&network, &alice, &bob, text("with extras"));

    let DecryptionOutcome::RemoteIdentityResolved(plain) = bob.receive(&envelope) else {
        panic!("expected a resolved message");
    };
    assert!(plain.extended_payload_key.is_none());

    envelope.has_extended_payload = true;
    let DecryptionOutcome::RemoteIdentityResolved(extended) = bob.receive(&envelope) else {
        panic!("expected a resolved message");
    };
    let first = extended.extended_payload_key.clone().unwrap();
    let DecryptionOutcome::RemoteIdentityResolved(again) = bob.receive(&envelope) else {
        panic!("expected a resolved message");
    };
    assert_eq!(again.extended_payload_key, Some(first));
}

#[test]
fn revoked_contact_is_reported() {
    let network = Arc::new(MemoryNetwork::new());
    let (alice, bob) = connected_pair(&network);
    let envelope = send(&network, &alice, &bob, text("still there?"));

    bob.directory.set_active(&bob.identity, &alice.identity, false);
    assert_eq!(bob.receive(&envelope), DecryptionOutcome::ContactRevoked);
}

#[test]
fn removed_contact_is_unknown() {
    let network = Arc::new(MemoryNetwork::new());
    let (alice, bob) = connected_pair(&network);
    let envelope = send(&network, &alice, &bob, text("who am i"));

    bob.directory.remove_contact(&bob.identity, &alice.identity);
    assert_eq!(
        bob.receive(&envelope),
        DecryptionOutcome::UnwrapSucceededButRemoteUnknown {
            remote_identity: alice.identity
        }
    );
}

#[test]
fn envelope_for_a_foreign_device_is_not_unwrapped() {
    let network = Arc::new(MemoryNetwork::new());
    let (alice, bob) = connected_pair(&network);
    let mut envelope = send(&network, &alice, &bob, text("misrouted"));
    envelope.to_device = alice.uid;
    assert_eq!(bob.receive(&envelope), DecryptionOutcome::NoKeyCouldUnwrap);
}

#[test]
fn prekey_message_reaches_a_contact_without_channel() {
    let network = Arc::new(MemoryNetwork::new());
    let alice = Device::new(&network, 1);
    let bob = Device::new(&network, 2);
    introduce(&alice, &bob);

    let prekey = bob.manager.current_prekey(bob.identity).unwrap();
    assert_eq!(bob.manager.current_prekey(bob.identity).unwrap(), prekey);

    alice
        .manager
        .send_application_message_with_prekey(
            alice.identity,
            bob.identity,
            bob.uid,
            prekey,
            text("before any channel"),
        )
        .unwrap();
    let envelope = network.pop_for(&bob.uid).unwrap();

    match bob.receive(&envelope) {
        DecryptionOutcome::RemoteIdentityResolved(resolved) => {
            assert_eq!(resolved.remote_identity, alice.identity);
            assert_eq!(resolved.remote_device, alice.uid);
            assert_eq!(resolved.payload, b"before any channel");
        }
        other => panic!("expected a resolved message, got {:?}", other),
    }

    // Anything uploaded once the pre-key expired is refused.
    let mut late = envelope.clone();
    late.upload_timestamp = prekey.expires_at;
    assert_eq!(bob.receive(&late), DecryptionOutcome::NoKeyCouldUnwrap);

    // And once pruned, the pre-key is gone for good.
    let (_, removed) = bob.manager.prune_expired(prekey.expires_at).unwrap();
    assert_eq!(removed, 1);
    assert_eq!(bob.receive(&envelope), DecryptionOutcome::NoKeyCouldUnwrap);
}

#[test]
fn application_messages_never_travel_asymmetrically() {
    let network = Arc::new(MemoryNetwork::new());
    let alice = Device::new(&network, 1);
    let bob = Device::new(&network, 2);
    introduce(&alice, &bob);

    // Asymmetric keys carry protocol messages only.
    let store = alice.manager.store();
    let mut ctx = store.begin().unwrap();
    let result = crate::outbox::post(
        &mut ctx,
        &*alice.directory,
        ChannelMessage::Application(text("not allowed")),
        crate::SendChannel::AsymmetricBroadcast {
            to: bob.identity,
            device_uids: vec![bob.uid],
        },
    );
    assert!(result.is_err());
}

/// Records the order unwrappers are consulted in and answers with a fixed attempt.
struct Scripted {
    kind: UnwrapKind,
    key: Option<UnwrappedKeyTemplate>,
    calls: Arc<Mutex<Vec<UnwrapKind>>>,
}

#[derive(Clone, Copy)]
struct UnwrappedKeyTemplate {
    key: [u8; 32],
    remote_identity: CryptoIdentity,
    remote_device: Uid,
    confirmed: bool,
}

impl UnwrappedKeyTemplate {
    fn confirmed_from(key: [u8; 32], device: &Device) -> Self {
        Self {
            key,
            remote_identity: device.identity,
            remote_device: device.uid,
            confirmed: true,
        }
    }
}

impl KeyUnwrapper for Scripted {
    fn kind(&self) -> UnwrapKind {
        self.kind
    }

    fn try_unwrap(
        &self,
        _db: &Database,
        _identity: &dyn IdentityDelegate,
        _owner: &CryptoIdentity,
        _envelope: &Envelope,
    ) -> Result<UnwrapAttempt, EngineError> {
        self.calls.lock().unwrap().push(self.kind);
        Ok(match self.key {
            Some(template) => UnwrapAttempt::Unwrapped(UnwrappedKey {
                message_key: Secret::from_bytes(template.key),
                origin: ReceptionChannelInfo::ObliviousChannel {
                    remote_identity: template.remote_identity,
                    remote_device: template.remote_device,
                    confirmed: template.confirmed,
                },
            }),
            None => UnwrapAttempt::NotForThisKey,
        })
    }
}

fn scripted_manager(
    network: &Arc<MemoryNetwork>,
    device: &Device,
    unwrappers: Vec<Box<dyn KeyUnwrapper>>,
) -> ProtocolManager {
    ProtocolManager::builder()
        .identity(device.directory.clone())
        .transport(network.clone())
        .decryptor(Decryptor::with_unwrappers(unwrappers))
        .build()
        .unwrap()
}

fn sealed_for(device: &Device, key: &[u8; 32], message: &ChannelMessage) -> Envelope {
    Envelope {
        to_device: device.uid,
        wrapped_key: vec![1, 2, 3],
        encrypted_content: aead::seal(key, CONTENT_AAD, &encode_channel_message(message).unwrap())
            .unwrap(),
        upload_timestamp: 10,
        download_timestamp: 20,
        known_attachment_count: 0,
        has_extended_payload: false,
    }
}

#[test]
fn first_successful_unwrapper_wins() {
    let network = Arc::new(MemoryNetwork::new());
    let alice = Device::new(&network, 1);
    let bob = Device::new(&network, 2);
    introduce(&alice, &bob);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let template = UnwrappedKeyTemplate::confirmed_from([7u8; 32], &alice);
    let scripted = |kind, key| -> Box<dyn KeyUnwrapper> {
        Box::new(Scripted {
            kind,
            key,
            calls: calls.clone(),
        })
    };
    let manager = scripted_manager(
        &network,
        &bob,
        vec![
            scripted(UnwrapKind::Asymmetric, Some(template)),
            scripted(UnwrapKind::PreKey, Some(template)),
            scripted(UnwrapKind::RatchetChannel, None),
        ],
    );

    let envelope = sealed_for(
        &bob,
        &template.key,
        &ChannelMessage::Application(text("scripted")),
    );
    let outcome = manager.receive_envelope(&envelope).unwrap();
    assert!(matches!(outcome, DecryptionOutcome::RemoteIdentityResolved(_)));
    assert_eq!(
        *calls.lock().unwrap(),
        vec![UnwrapKind::RatchetChannel, UnwrapKind::PreKey]
    );
}

#[test]
fn ratchet_channel_beats_a_valid_prekey() {
    let network = Arc::new(MemoryNetwork::new());
    let alice = Device::new(&network, 1);
    let bob = Device::new(&network, 2);
    let carol = Device::new(&network, 3);
    introduce(&alice, &bob);
    introduce(&carol, &bob);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let from_alice = UnwrappedKeyTemplate::confirmed_from([7u8; 32], &alice);
    let from_carol = UnwrappedKeyTemplate::confirmed_from([7u8; 32], &carol);
    let manager = scripted_manager(
        &network,
        &bob,
        vec![
            Box::new(Scripted {
                kind: UnwrapKind::PreKey,
                key: Some(from_carol),
                calls: calls.clone(),
            }),
            Box::new(Scripted {
                kind: UnwrapKind::RatchetChannel,
                key: Some(from_alice),
                calls: calls.clone(),
            }),
        ],
    );

    let envelope = sealed_for(
        &bob,
        &from_alice.key,
        &ChannelMessage::Application(text("both keys open this")),
    );
    match manager.receive_envelope(&envelope).unwrap() {
        DecryptionOutcome::RemoteIdentityResolved(resolved) => {
            assert_eq!(resolved.remote_identity, alice.identity);
            assert_eq!(resolved.remote_device, alice.uid);
        }
        other => panic!("expected a resolved message, got {:?}", other),
    }
    assert_eq!(*calls.lock().unwrap(), vec![UnwrapKind::RatchetChannel]);
}

#[test]
fn non_network_content_is_unexpected() {
    let network = Arc::new(MemoryNetwork::new());
    let alice = Device::new(&network, 1);
    let bob = Device::new(&network, 2);
    introduce(&alice, &bob);

    let template = UnwrappedKeyTemplate::confirmed_from([5u8; 32], &alice);
    let manager = scripted_manager(
        &network,
        &bob,
        vec![Box::new(Scripted {
            kind: UnwrapKind::RatchetChannel,
            key: Some(template),
            calls: Arc::new(Mutex::new(Vec::new())),
        })],
    );

    let instance_id = InstanceId::random();
    let contents = [
        ChannelMessage::Dialog(DialogMessage {
            protocol: ProtocolKind::OneToOneInvitation,
            instance_id,
            category: DialogCategory::AcceptOneToOneInvitation {
                contact: alice.identity,
            },
        }),
        ChannelMessage::ServerQuery(ServerQuery {
            protocol: ProtocolKind::OneToOneInvitation,
            instance_id,
            query: vec![1],
        }),
        ChannelMessage::ServerResponse(ServerResponse {
            protocol: ProtocolKind::OneToOneInvitation,
            instance_id,
            response: vec![2],
        }),
    ];
    for content in &contents {
        let envelope = sealed_for(&bob, &template.key, content);
        assert_eq!(
            manager.receive_envelope(&envelope).unwrap(),
            DecryptionOutcome::UnexpectedMessageType,
            "{:?}",
            content
        );
    }
    assert_eq!(network.dialogs_for(&bob.identity).len(), 0);
}

#[test]
fn application_message_on_a_pending_channel_is_unexpected() {
    let network = Arc::new(MemoryNetwork::new());
    let alice = Device::new(&network, 1);
    let bob = Device::new(&network, 2);
    introduce(&alice, &bob);

    let pending = UnwrappedKeyTemplate {
        confirmed: false,
        ..UnwrappedKeyTemplate::confirmed_from([6u8; 32], &alice)
    };
    let manager = scripted_manager(
        &network,
        &bob,
        vec![Box::new(Scripted {
            kind: UnwrapKind::RatchetChannel,
            key: Some(pending),
            calls: Arc::new(Mutex::new(Vec::new())),
        })],
    );

    let envelope = sealed_for(&bob, &pending.key, &ChannelMessage::Application(text("too early")));
    assert_eq!(
        manager.receive_envelope(&envelope).unwrap(),
        DecryptionOutcome::UnexpectedMessageType
    );
    assert!(matches!(
        manager.decrypt_application_message(&envelope),
        Err(EngineError::NotAnApplicationMessage)
    ));
}

#[test]
fn wrong_message_key_cannot_be_parsed() {
    let network = Arc::new(MemoryNetwork::new());
    let bob = Device::new(&network, 2);
    let alice = Device::new(&network, 1);
    introduce(&alice, &bob);
    let manager = scripted_manager(
        &network,
        &bob,
        vec![Box::new(Scripted {
            kind: UnwrapKind::RatchetChannel,
            key: Some(UnwrappedKeyTemplate::confirmed_from([1u8; 32], &alice)),
            calls: Arc::new(Mutex::new(Vec::new())),
        })],
    );

    let envelope = Envelope {
        to_device: bob.uid,
        wrapped_key: vec![0],
        encrypted_content: aead::seal(&[2u8; 32], CONTENT_AAD, b"junk").unwrap(),
        upload_timestamp: 0,
        download_timestamp: 0,
        known_attachment_count: 0,
        has_extended_payload: false,
    };
    assert_eq!(
        manager.receive_envelope(&envelope).unwrap(),
        DecryptionOutcome::CouldNotParse
    );
}
