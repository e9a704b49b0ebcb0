//! In-process datalink.
//!
//! Every [`MemoryDataLink`] attached to the same [`MemoryNetwork`] sees the
//! others as stations. Unicast frames to an unknown address are lost without
//! error, the way a UDP datagram would be. Broadcasts reach every other
//! station.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use log::trace;

use super::{DataLink, DataLinkAddress, DataLinkError, DataLinkType, Result};
use crate::network::{NpciData, Route};

/// A frame as it left a station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub from: DataLinkAddress,
    pub to: DataLinkAddress,
    pub data: Bytes,
}

#[derive(Debug, Default)]
struct NetworkState {
    inboxes: BTreeMap<DataLinkAddress, VecDeque<(Bytes, DataLinkAddress)>>,
    failing_sends: BTreeMap<DataLinkAddress, usize>,
    transmissions: Vec<Transmission>,
}

/// Shared medium for [`MemoryDataLink`]s. Cloning yields another handle to the
/// same medium.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a station; re-attaching an address clears its inbox.
    pub fn attach(&self, address: DataLinkAddress) -> MemoryDataLink {
        self.lock().inboxes.insert(address, VecDeque::new());
        MemoryDataLink {
            network: self.clone(),
            address,
        }
    }

    /// Make the next `count` sends from `station` fail.
    pub fn fail_next_sends(&self, station: DataLinkAddress, count: usize) {
        self.lock().failing_sends.insert(station, count);
    }

    /// Frames waiting for `station`
    pub fn pending(&self, station: DataLinkAddress) -> usize {
        self.lock().inboxes.get(&station).map_or(0, VecDeque::len)
    }

    /// Drain the log of every frame sent on the medium
    pub fn take_transmissions(&self) -> Vec<Transmission> {
        std::mem::take(&mut self.lock().transmissions)
    }

    /// Inject a frame as if `from` had sent it to `to`.
    pub fn inject(&self, from: DataLinkAddress, to: DataLinkAddress, data: &[u8]) {
        let mut state = self.lock();
        if let Some(inbox) = state.inboxes.get_mut(&to) {
            inbox.push_back((Bytes::copy_from_slice(data), from));
        }
    }

    fn deliver(&self, from: DataLinkAddress, to: DataLinkAddress, pdu: &[u8]) -> Result<usize> {
        let mut state = self.lock();

        if let Some(remaining) = state.failing_sends.get_mut(&from) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DataLinkError::SendFailed {
                    destination: to,
                    reason: "injected failure".to_string(),
                });
            }
        }

        let data = Bytes::copy_from_slice(pdu);
        state.transmissions.push(Transmission {
            from,
            to,
            data: data.clone(),
        });

        if to.is_broadcast() {
            for (station, inbox) in state.inboxes.iter_mut() {
                if *station != from {
                    inbox.push_back((data.clone(), from));
                }
            }
        } else if let Some(inbox) = state.inboxes.get_mut(&to) {
            inbox.push_back((data, from));
        } else {
            trace!("memory link: no station at {}, frame lost", to);
        }

        Ok(pdu.len())
    }
}

/// One station on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryDataLink {
    network: MemoryNetwork,
    address: DataLinkAddress,
}

impl MemoryDataLink {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl DataLink for MemoryDataLink {
    fn send_pdu(&mut self, route: &Route, _npci: &NpciData, pdu: &[u8]) -> Result<usize> {
        self.network.deliver(self.address, route.next_hop, pdu)
    }

    fn receive(&mut self) -> Result<Option<(Vec<u8>, DataLinkAddress)>> {
        let mut state = self.network.lock();
        let frame = state
            .inboxes
            .get_mut(&self.address)
            .and_then(VecDeque::pop_front);
        Ok(frame.map(|(data, source)| (data.to_vec(), source)))
    }

    fn link_type(&self) -> DataLinkType {
        DataLinkType::Memory
    }

    fn local_address(&self) -> DataLinkAddress {
        self.address
    }
}
