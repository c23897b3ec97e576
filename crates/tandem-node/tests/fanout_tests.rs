//! Integration tests for destination resolution and multi-device
//! fanout, observed from a sending device that shares a directory with
//! the recipient's devices.

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use support::{count_by_identity, link_devices, signed_link, Device, FakeDirectory, RejectAll};
use tandem_crypto::Keypair;
use tandem_protocol::{
    DeviceLinkMessage, LinkingAuthorization, MessageKind, OutgoingMessage, Recipient,
};
use tandem_node::Directory;
use tandem_storage::LinkStoreExt;
use tandem_types::{
    Destination, DeviceLink, DeviceRole, FriendRequestStatus, GroupId, IdentityKey, Signature, TandemError,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn befriend(device: &Device, peers: &[IdentityKey]) -> tandem_types::Result<()> {
    device.store.atomically(|txn| {
        for peer in peers {
            txn.set_friend_request_status(peer, FriendRequestStatus::Friends)?;
        }
        Ok(())
    })
}

fn status_of(device: &Device, peer: &IdentityKey) -> tandem_types::Result<FriendRequestStatus> {
    device.store.atomically(|txn| txn.friend_request_status(peer))
}

// ===========================================================================
// Resolution
// ===========================================================================

#[tokio::test]
async fn unlinked_identity_resolves_to_itself() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();

    let destinations = alice.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(destinations, HashSet::from([Destination::master(bob.identity())]));
    Ok(())
}

#[tokio::test]
async fn master_and_slave_resolve_to_the_same_set() -> TestResult {
    let directory = FakeDirectory::new();
    let bob = Keypair::generate();
    let slaves: Vec<Keypair> = (0..3).map(|_| Keypair::generate()).collect();
    for slave in &slaves {
        directory.insert(signed_link(&bob, slave));
    }

    let mut expected = HashSet::from([Destination::master(bob.identity())]);
    expected.extend(slaves.iter().map(|s| Destination::slave(s.identity())));

    let from_master = Device::new(&directory)?;
    let destinations = from_master.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(destinations, expected);

    // A fresh observer that only knows a slave still finds the whole set.
    let from_slave = Device::new(&directory)?;
    let destinations = from_slave.service.resolve_destinations(&slaves[1].identity()).await?;
    assert_eq!(destinations, expected);

    let counts = count_by_identity(destinations.iter().map(|d| &d.identity));
    assert!(counts.values().all(|&n| n == 1));
    let masters = destinations.iter().filter(|d| d.role == DeviceRole::Master).count();
    assert_eq!(masters, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn directory_is_consulted_once_per_refresh_interval() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();

    alice.service.resolve_destinations(&bob.identity()).await?;
    alice.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(directory.fetch_count(), 1);

    tokio::time::advance(Duration::from_secs(19)).await;
    alice.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(directory.fetch_count(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    alice.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(directory.fetch_count(), 2);
    Ok(())
}

#[tokio::test]
async fn unparseable_directory_answer_falls_back_to_stored_links() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();
    let slave = Keypair::generate();
    let known = signed_link(&bob, &slave);
    alice.store.atomically(|txn| txn.put_device_link(&known))?;

    directory.fail_with(Some(TandemError::DirectoryParse {
        reason: "truncated record".into(),
    }));
    let expected = HashSet::from([Destination::master(bob.identity()), Destination::slave(slave.identity())]);
    assert_eq!(alice.service.resolve_destinations(&bob.identity()).await?, expected);

    // Treated as fresh: no second fetch inside the interval.
    assert_eq!(alice.service.resolve_destinations(&bob.identity()).await?, expected);
    assert_eq!(directory.fetch_count(), 1);
    Ok(())
}

#[tokio::test]
async fn network_failure_propagates_and_is_retried() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();

    directory.fail_with(Some(TandemError::NetworkError {
        reason: "connection reset".into(),
    }));
    let res = alice.service.resolve_destinations(&bob.identity()).await;
    assert!(matches!(res, Err(TandemError::NetworkError { .. })));
    let res = alice.service.resolve_destinations(&bob.identity()).await;
    assert!(matches!(res, Err(TandemError::NetworkError { .. })));
    assert_eq!(directory.fetch_count(), 2);

    directory.fail_with(None);
    let destinations = alice.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(destinations, HashSet::from([Destination::master(bob.identity())]));
    assert_eq!(directory.fetch_count(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn link_dropped_from_directory_stops_receiving() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();
    let kept = Keypair::generate();
    let revoked = Keypair::generate();
    let revoked_link = signed_link(&bob, &revoked);
    directory.insert(signed_link(&bob, &kept));
    directory.insert(revoked_link.clone());

    let destinations = alice.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(destinations.len(), 3);

    directory.unpublish_device_link(&revoked_link).await?;
    tokio::time::advance(Duration::from_secs(21)).await;

    let destinations = alice.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(directory.fetch_count(), 2);
    assert_eq!(
        destinations,
        HashSet::from([Destination::master(bob.identity()), Destination::slave(kept.identity())])
    );
    assert_eq!(alice.store.atomically(|txn| txn.master_of(&revoked.identity()))?, None);
    Ok(())
}

#[tokio::test]
async fn own_link_survives_until_published() -> TestResult {
    let directory = FakeDirectory::new();
    let bob = Device::new(&directory)?;
    let phone = Device::new(&directory)?;
    let link = link_devices(&bob, &phone).await?;

    // Directory has not caught up yet: neither side loses the link.
    directory.unpublish_device_link(&link).await?;
    let expected = HashSet::from([Destination::master(bob.id()), Destination::slave(phone.id())]);
    assert_eq!(bob.service.resolve_destinations(&bob.id()).await?, expected);
    assert_eq!(phone.service.resolve_destinations(&bob.id()).await?, expected);
    assert!(directory.fetch_count() >= 2);
    Ok(())
}

#[tokio::test]
async fn badly_signed_directory_links_are_ignored() -> TestResult {
    let directory = FakeDirectory::new();
    let bob = Keypair::generate();
    let honest = Keypair::generate();
    let forged = Keypair::generate();
    directory.insert(signed_link(&bob, &honest));
    directory.insert(DeviceLink {
        master: bob.identity(),
        slave: forged.identity(),
        master_signature: Signature::from_bytes([3; 64]),
        slave_signature: Signature::from_bytes([4; 64]),
    });

    let alice = Device::new(&directory)?;
    let destinations = alice.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(
        destinations,
        HashSet::from([Destination::master(bob.identity()), Destination::slave(honest.identity())])
    );
    let stored = alice.store.atomically(|txn| txn.device_links(&bob.identity()))?;
    assert!(stored.iter().all(|l| l.slave != forged.identity()));

    // With a verifier that rejects everything nothing is stored at all.
    let skeptic = Device::with_verifier(&directory, Arc::new(RejectAll))?;
    let destinations = skeptic.service.resolve_destinations(&bob.identity()).await?;
    assert_eq!(destinations, HashSet::from([Destination::master(bob.identity())]));
    Ok(())
}

// ===========================================================================
// Fanout
// ===========================================================================

#[tokio::test]
async fn untrusted_slave_gets_friend_request_and_failure_is_swallowed() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();
    let phone = Keypair::generate();
    directory.insert(signed_link(&bob, &phone));

    befriend(&alice, &[bob.identity()])?;
    alice.transport.fail_for(phone.identity());

    let message = OutgoingMessage::text(alice.id(), bob.identity(), "hello")?;
    let report = alice.service.dispatch(message, bob.identity()).await?;

    let primary = report.primary.ok_or("master was not sent to")?;
    assert_eq!(primary.destination, Destination::master(bob.identity()));
    assert!(!primary.substituted);
    assert!(report.slaves.is_empty());
    assert_eq!(report.slave_failures, 1);
    assert!(!report.fell_back);

    assert_eq!(alice.transport.kinds_to(&bob.identity()), vec![MessageKind::Text]);
    assert!(alice.transport.kinds_to(&phone.identity()).is_empty());
    assert_eq!(status_of(&alice, &phone.identity())?, FriendRequestStatus::RequestSent);
    assert_eq!(status_of(&alice, &bob.identity())?, FriendRequestStatus::Friends);
    Ok(())
}

#[tokio::test]
async fn master_is_sent_before_slaves() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();
    let slaves: Vec<Keypair> = (0..4).map(|_| Keypair::generate()).collect();
    for slave in &slaves {
        directory.insert(signed_link(&bob, slave));
    }
    let mut trusted: Vec<IdentityKey> = slaves.iter().map(|s| s.identity()).collect();
    trusted.push(bob.identity());
    befriend(&alice, &trusted)?;

    let message = OutgoingMessage::text(alice.id(), bob.identity(), "hello")?;
    let report = alice.service.dispatch(message, bob.identity()).await?;
    assert_eq!(report.slaves.len(), slaves.len());
    assert!(report.slaves.iter().all(|d| !d.substituted));

    let sent = alice.transport.sent();
    assert_eq!(sent.len(), 1 + slaves.len());
    assert_eq!(sent[0].1, Recipient::Device(bob.identity()));

    // Every copy keeps the original identifier and names its own device.
    let id = sent[0].0.id;
    assert!(sent.iter().all(|(m, r)| m.id == id && m.recipient == *r));
    Ok(())
}

#[tokio::test]
async fn pending_friend_request_withholds_content() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();

    let first = OutgoingMessage::text(alice.id(), bob.identity(), "hello")?;
    let report = alice.service.dispatch(first, bob.identity()).await?;
    assert!(report.primary.as_ref().is_some_and(|d| d.substituted));
    assert_eq!(status_of(&alice, &bob.identity())?, FriendRequestStatus::RequestSent);

    // Still pending: the content is withheld again, status unchanged.
    let second = OutgoingMessage::text(alice.id(), bob.identity(), "are you there?")?;
    alice.service.dispatch(second, bob.identity()).await?;
    assert_eq!(
        alice.transport.kinds_to(&bob.identity()),
        vec![MessageKind::FriendRequest, MessageKind::FriendRequest]
    );
    assert_eq!(status_of(&alice, &bob.identity())?, FriendRequestStatus::RequestSent);
    Ok(())
}

#[tokio::test]
async fn master_failure_fails_dispatch_after_slaves_are_tried() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();
    let phone = Keypair::generate();
    directory.insert(signed_link(&bob, &phone));
    befriend(&alice, &[bob.identity(), phone.identity()])?;
    alice.transport.fail_for(bob.identity());

    let message = OutgoingMessage::text(alice.id(), bob.identity(), "hello")?;
    let res = alice.service.dispatch(message, bob.identity()).await;
    assert!(matches!(res, Err(TandemError::DeliveryFailed { .. })));

    // The unreachable master does not cost the other device its copy.
    assert_eq!(alice.transport.kinds_to(&phone.identity()), vec![MessageKind::Text]);
    Ok(())
}

#[tokio::test]
async fn sending_device_is_skipped_in_its_own_set() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();
    let sibling = Keypair::generate();
    directory.insert(signed_link(&bob, &alice.keys));
    directory.insert(signed_link(&bob, &sibling));
    befriend(&alice, &[bob.identity(), sibling.identity()])?;

    let message = OutgoingMessage::text(alice.id(), bob.identity(), "note to self")?;
    let report = alice.service.dispatch(message, bob.identity()).await?;
    assert_eq!(report.slaves.len(), 1);

    let recipients: HashSet<Recipient> = alice.transport.sent().into_iter().map(|(_, r)| r).collect();
    assert_eq!(
        recipients,
        HashSet::from([Recipient::Device(bob.identity()), Recipient::Device(sibling.identity())])
    );
    Ok(())
}

#[tokio::test]
async fn link_protocol_messages_bypass_fanout() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();
    let phone = Keypair::generate();
    directory.insert(signed_link(&bob, &phone));

    let unlink = OutgoingMessage::unlink(alice.id(), bob.identity())?;
    alice.service.dispatch(unlink, bob.identity()).await?;

    let authorization = DeviceLinkMessage::Authorization(LinkingAuthorization {
        link: signed_link(&bob, &phone),
        profile: None,
    });
    let link_message = OutgoingMessage::device_link(alice.id(), bob.identity(), &authorization)?;
    let report = alice.service.dispatch(link_message, bob.identity()).await?;
    assert!(report.primary.is_none());
    assert_eq!(
        report.literal.map(|r| r.recipient),
        Some(Recipient::Device(bob.identity()))
    );

    assert_eq!(
        alice.transport.kinds_to(&bob.identity()),
        vec![MessageKind::Unlink, MessageKind::DeviceLink]
    );
    assert!(alice.transport.kinds_to(&phone.identity()).is_empty());
    assert_eq!(directory.fetch_count(), 0);
    Ok(())
}

#[tokio::test]
async fn group_message_goes_to_literal_recipient() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let group = GroupId::new([7; 32]);

    let message = OutgoingMessage::new(alice.id(), Recipient::Group(group), MessageKind::Text, b"hi all".to_vec())?;
    let report = alice.service.dispatch(message, alice.id()).await?;
    assert!(report.primary.is_none());
    assert_eq!(report.literal.map(|r| r.recipient), Some(Recipient::Group(group)));

    let sent = alice.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, Recipient::Group(group));
    assert_eq!(sent[0].0.kind, MessageKind::Text);
    assert_eq!(directory.fetch_count(), 0);
    Ok(())
}

#[tokio::test]
async fn directory_outage_delivers_to_literal_target() -> TestResult {
    let directory = FakeDirectory::new();
    let alice = Device::new(&directory)?;
    let bob = Keypair::generate();
    befriend(&alice, &[bob.identity()])?;
    directory.fail_with(Some(TandemError::NetworkError {
        reason: "unreachable".into(),
    }));

    let message = OutgoingMessage::text(alice.id(), bob.identity(), "hello")?;
    let report = alice.service.dispatch(message, bob.identity()).await?;
    assert!(report.fell_back);
    assert_eq!(
        report.literal.map(|r| r.recipient),
        Some(Recipient::Device(bob.identity()))
    );
    assert_eq!(alice.transport.kinds_to(&bob.identity()), vec![MessageKind::Text]);
    Ok(())
}
