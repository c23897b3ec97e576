//! Test doubles shared by the tandem-node integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tandem_crypto::{Ed25519Verifier, Keypair};
use tandem_node::{Collaborators, DataWipe, Directory, MultiDeviceService, SendReceipt, Transport};
use tandem_protocol::pairing::pairing_payload;
use tandem_protocol::{MessageKind, OutgoingMessage, Recipient};
use tandem_storage::MemoryLinkStore;
use tandem_types::config::MultiDeviceConfig;
use tandem_types::{DeviceLink, IdentityKey, LinkEvent, Result, Signature, TandemError, Verifier};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// FakeDirectory
// ---------------------------------------------------------------------------

/// In-memory directory with a fetch counter and failure injection.
#[derive(Default)]
pub struct FakeDirectory {
    links: Mutex<HashSet<DeviceLink>>,
    fetches: AtomicUsize,
    failure: Mutex<Option<TandemError>>,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, link: DeviceLink) {
        if let Ok(mut links) = self.links.lock() {
            links.replace(link);
        }
    }

    pub fn contains(&self, master: &IdentityKey, slave: &IdentityKey) -> bool {
        self.links
            .lock()
            .map(|links| links.iter().any(|l| l.pairs(master, slave)))
            .unwrap_or(false)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, error: Option<TandemError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn fetch_device_links(&self, identity: &IdentityKey) -> Result<HashSet<DeviceLink>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(e);
        }
        Ok(self
            .links
            .lock()
            .map(|links| links.iter().filter(|l| l.involves(identity)).cloned().collect())
            .unwrap_or_default())
    }

    async fn publish_device_link(&self, link: &DeviceLink) -> Result<()> {
        self.insert(link.clone());
        Ok(())
    }

    async fn unpublish_device_link(&self, link: &DeviceLink) -> Result<()> {
        if let Ok(mut links) = self.links.lock() {
            links.remove(link);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

/// Records every send; sends to identities in the failing set error.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(OutgoingMessage, Recipient)>>,
    failing: Mutex<HashSet<IdentityKey>>,
}

impl RecordingTransport {
    pub fn fail_for(&self, identity: IdentityKey) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(identity);
        }
    }

    pub fn sent(&self) -> Vec<(OutgoingMessage, Recipient)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Kinds of the messages delivered to `identity`, in send order.
    pub fn kinds_to(&self, identity: &IdentityKey) -> Vec<MessageKind> {
        self.sent()
            .into_iter()
            .filter(|(_, r)| *r == Recipient::Device(*identity))
            .map(|(m, _)| m.kind)
            .collect()
    }

    /// Body of the last device-link message sent.
    pub fn last_link_payload(&self) -> Option<Vec<u8>> {
        self.sent()
            .into_iter()
            .rev()
            .find(|(m, _)| m.kind == MessageKind::DeviceLink)
            .map(|(m, _)| m.body)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: OutgoingMessage, recipient: Recipient) -> Result<SendReceipt> {
        let blocked = match recipient {
            Recipient::Device(id) => self.failing.lock().map(|f| f.contains(&id)).unwrap_or(false),
            Recipient::Group(_) => false,
        };
        if blocked {
            return Err(TandemError::DeliveryFailed {
                reason: "peer unreachable".into(),
            });
        }
        let receipt = SendReceipt {
            message_id: message.id,
            recipient,
        };
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((message, recipient));
        }
        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// RecordingWipe
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingWipe(AtomicUsize);

impl RecordingWipe {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataWipe for RecordingWipe {
    async fn wipe_local_data(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Verifiers
// ---------------------------------------------------------------------------

/// Rejects every signature.
pub struct RejectAll;

impl Verifier for RejectAll {
    fn verify(&self, _: &[u8], _: &Signature, _: &IdentityKey) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// One simulated device: its keys, collaborators and service.
pub struct Device {
    pub keys: Arc<Keypair>,
    pub store: Arc<MemoryLinkStore>,
    pub transport: Arc<RecordingTransport>,
    pub wipe: Arc<RecordingWipe>,
    pub service: MultiDeviceService,
    pub events: mpsc::Receiver<LinkEvent>,
}

impl Device {
    pub fn new(directory: &Arc<FakeDirectory>) -> Result<Self> {
        Self::with_verifier(directory, Arc::new(Ed25519Verifier))
    }

    pub fn with_verifier(directory: &Arc<FakeDirectory>, verifier: Arc<dyn Verifier>) -> Result<Self> {
        let keys = Arc::new(Keypair::generate());
        let store = Arc::new(MemoryLinkStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let wipe = Arc::new(RecordingWipe::default());

        let service = MultiDeviceService::new(
            &MultiDeviceConfig::default(),
            Collaborators {
                signer: keys.clone(),
                verifier,
                store: store.clone(),
                directory: directory.clone(),
                transport: transport.clone(),
                wipe: wipe.clone(),
            },
        )?;
        let events = service.take_event_receiver().ok_or_else(|| TandemError::ProtocolState {
            reason: "event receiver already taken".into(),
        })?;

        Ok(Self {
            keys,
            store,
            transport,
            wipe,
            service,
            events,
        })
    }

    pub fn id(&self) -> IdentityKey {
        self.keys.identity()
    }

    /// Drains every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// A link between two real keypairs with valid signatures.
pub fn signed_link(master: &Keypair, slave: &Keypair) -> DeviceLink {
    let payload = pairing_payload(&master.identity(), &slave.identity());
    DeviceLink {
        master: master.identity(),
        slave: slave.identity(),
        master_signature: master.sign(&payload),
        slave_signature: slave.sign(&payload),
    }
}

/// Runs the full handshake: `slave` requests, `master` authorizes.
pub async fn link_devices(master: &Device, slave: &Device) -> Result<DeviceLink> {
    master.service.start_awaiting_request()?;
    slave.service.start_linking_request(master.id()).await?;

    let request = slave.transport.last_link_payload().ok_or_else(|| TandemError::ProtocolState {
        reason: "no request sent".into(),
    })?;
    master
        .service
        .handle_incoming_device_link_message(&request, slave.id())
        .await?;
    let link = master.service.authorize_linking_request(None).await?;

    let authorization = master.transport.last_link_payload().ok_or_else(|| TandemError::ProtocolState {
        reason: "no authorization sent".into(),
    })?;
    slave
        .service
        .handle_incoming_device_link_message(&authorization, master.id())
        .await?;
    Ok(link)
}

/// Per-identity counts of the given destinations, for duplicate checks.
pub fn count_by_identity<'a>(ids: impl Iterator<Item = &'a IdentityKey>) -> HashMap<IdentityKey, usize> {
    let mut counts = HashMap::new();
    for id in ids {
        *counts.entry(*id).or_insert(0) += 1;
    }
    counts
}
