//! Master-side peer bookkeeping.
//!
//! The registry is owned by the master's event loop, so mutations are
//! applied one at a time in arrival order. Consumers only ever see copies
//! taken between two mutations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{ConfigurationError, ProtocolError, SessionError, StateError};
use crate::media::MediaStream;
use crate::rtc::PeerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    PendingMedia,
    Active,
    Inactive,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::PendingMedia => "PENDING_MEDIA",
            PeerStatus::Active => "ACTIVE",
            PeerStatus::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs once when its record leaves the registry.
pub type PeerDisposer = Box<dyn FnOnce(&PeerRecord) + Send>;

pub struct PeerRecord {
    id: String,
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    media: Option<MediaStream>,
    status: PeerStatus,
    disposer: Option<PeerDisposer>,
}

impl PeerRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn media(&self) -> Option<&MediaStream> {
        self.media.as_ref()
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    fn snapshot(&self) -> Peer {
        Peer {
            id: self.id.clone(),
            connection: self.connection.clone(),
            media: self.media.clone(),
            status: self.status,
        }
    }
}

impl fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("status", &self.status)
            .field("has_media", &self.media.is_some())
            .finish()
    }
}

/// Consumer view of a peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub connection: Arc<dyn PeerConnection>,
    pub media: Option<MediaStream>,
    pub status: PeerStatus,
}

#[derive(Default)]
pub struct PeerRegistry {
    records: BTreeMap<u64, PeerRecord>,
    index: HashMap<String, u64>,
    next_generation: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection in `PENDING_MEDIA` and returns the record's
    /// generation. Generations are never reused.
    pub fn add_connection(
        &mut self,
        id: &str,
        connection: Option<Arc<dyn PeerConnection>>,
    ) -> Result<u64, SessionError> {
        let connection = connection.ok_or(ConfigurationError::ConnectionMissing)?;
        if id.is_empty() {
            return Err(ConfigurationError::PeerIdMissing.into());
        }
        if self.index.contains_key(id) {
            return Err(StateError::DuplicatePeer(id.to_string()).into());
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.records.insert(
            generation,
            PeerRecord {
                id: id.to_string(),
                generation,
                connection,
                media: None,
                status: PeerStatus::PendingMedia,
                disposer: None,
            },
        );
        self.index.insert(id.to_string(), generation);
        Ok(generation)
    }

    pub fn set_disposer(&mut self, id: &str, disposer: PeerDisposer) -> Result<(), ProtocolError> {
        self.record_mut(id)?.disposer = Some(disposer);
        Ok(())
    }

    /// Stores the remote stream and moves the peer to `ACTIVE`.
    pub fn attach_media(&mut self, id: &str, stream: MediaStream) -> Result<(), SessionError> {
        let record = self.record_mut(id)?;
        if record.status == PeerStatus::Inactive {
            return Err(invalid(id, record.status, PeerStatus::Active));
        }
        record.media = Some(stream);
        record.status = PeerStatus::Active;
        Ok(())
    }

    /// Clears `PENDING_MEDIA` once local tracks have been added.
    pub fn activate(&mut self, id: &str) -> Result<(), SessionError> {
        let record = self.record_mut(id)?;
        match record.status {
            PeerStatus::PendingMedia | PeerStatus::Active => {
                record.status = PeerStatus::Active;
                Ok(())
            }
            PeerStatus::Inactive => Err(invalid(id, record.status, PeerStatus::Active)),
        }
    }

    pub fn mark_inactive(&mut self, id: &str) -> Result<(), ProtocolError> {
        self.record_mut(id)?.status = PeerStatus::Inactive;
        Ok(())
    }

    /// Runs the disposer and drops the record. Removing an unknown id does
    /// nothing.
    pub fn remove(&mut self, id: &str) -> Option<PeerRecord> {
        let generation = self.index.remove(id)?;
        let mut record = self.records.remove(&generation)?;
        if let Some(disposer) = record.disposer.take() {
            disposer(&record);
        }
        Some(record)
    }

    /// Tears down every peer in insertion order.
    pub fn drain(&mut self) -> usize {
        let ids: Vec<String> = self.records.values().map(|r| r.id.clone()).collect();
        ids.iter().filter(|id| self.remove(id).is_some()).count()
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.index.get(id).and_then(|generation| self.records.get(generation))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// True when `id` is registered under exactly this generation.
    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.index.get(id) == Some(&generation)
    }

    /// `(id, generation, connection)` of every peer still waiting for media.
    pub fn pending_media(&self) -> Vec<(String, u64, Arc<dyn PeerConnection>)> {
        self.records
            .values()
            .filter(|record| record.status == PeerStatus::PendingMedia)
            .map(|record| (record.id.clone(), record.generation, record.connection.clone()))
            .collect()
    }

    pub fn active_peers(&self) -> Vec<Peer> {
        self.records
            .values()
            .filter(|record| record.status == PeerStatus::Active)
            .map(PeerRecord::snapshot)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record_mut(&mut self, id: &str) -> Result<&mut PeerRecord, ProtocolError> {
        self.index
            .get(id)
            .and_then(|generation| self.records.get_mut(generation))
            .ok_or_else(|| ProtocolError::PeerNotFound(id.to_string()))
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        self.drain();
    }
}

fn invalid(id: &str, from: PeerStatus, to: PeerStatus) -> SessionError {
    StateError::InvalidTransition {
        id: id.to_string(),
        from: from.as_str(),
        to: to.as_str(),
    }
    .into()
}
