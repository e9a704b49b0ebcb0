//! Address/Route Binding Table
//!
//! Maps device instances to the [`Route`] that reaches them, together with the
//! largest APDU the device accepts and the segmentation it supports.
//!
//! Entries are either static (configured, never expire) or learned from I-Am
//! announcements and valid for a bounded time. Expired learned entries are
//! hidden from lookups at once but only removed by
//! [`AddressBindingTable::unbind_expired`], which the owner schedules.
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use bacnet_tsm::address::{AddressBindingTable, Resolution};
//! use bacnet_tsm::datalink::DataLinkAddress;
//! use bacnet_tsm::network::Route;
//! use bacnet_tsm::service::Segmentation;
//!
//! let mut table = AddressBindingTable::new(16, Duration::from_secs(60));
//! let now = Instant::now();
//! let route = Route::unicast(DataLinkAddress::MsTP(12));
//! table.bind_learned(1234, route, 480, Segmentation::NoSegmentation, now).unwrap();
//!
//! match table.get_route(1234, now) {
//!     Resolution::Bound(binding) => assert_eq!(binding.route, route),
//!     Resolution::Unresolved(_) => unreachable!(),
//! }
//! assert!(table.get_route(1234, now + Duration::from_secs(61)).is_unresolved());
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, trace};
use thiserror::Error;

use crate::config::StackConfig;
use crate::network::{MacAddress, NetworkAddress, Route};
use crate::service::{IAmRequest, Segmentation, MAX_DEVICE_INSTANCE};

/// Result type for binding table operations
pub type Result<T> = std::result::Result<T, BindingError>;

/// Errors from the binding table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("device instance {0} out of range")]
    InvalidDevice(u32),
    #[error("binding table full of static entries ({capacity})")]
    TableFull { capacity: usize },
    #[error("invalid remote station address of {0} octets")]
    InvalidStationAddress(usize),
    #[error("a device cannot be bound to a broadcast route")]
    BroadcastRoute,
}

/// How a binding was created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Static,
    /// Learned, valid until the contained instant
    Learned { expires: Instant },
}

/// What the table knows about one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub route: Route,
    pub max_apdu: usize,
    pub segmentation: Segmentation,
    pub kind: BindingKind,
}

impl Binding {
    pub fn is_static(&self) -> bool {
        self.kind == BindingKind::Static
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.kind {
            BindingKind::Static => false,
            BindingKind::Learned { expires } => expires <= now,
        }
    }

    fn expires(&self) -> Option<Instant> {
        match self.kind {
            BindingKind::Static => None,
            BindingKind::Learned { expires } => Some(expires),
        }
    }
}

/// Result of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Bound(Binding),
    /// No usable binding; the caller resolves the address
    Unresolved(u32),
}

impl Resolution {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Resolution::Unresolved(_))
    }
}

/// Broadcast reach for [`AddressBindingTable::broadcast_route`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastScope {
    Local,
    Global,
    Remote(u16),
}

/// Device instance to route table with bounded capacity
#[derive(Debug, Clone)]
pub struct AddressBindingTable {
    entries: BTreeMap<u32, Binding>,
    capacity: usize,
    ttl: Duration,
}

impl AddressBindingTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
            ttl,
        }
    }

    /// Build a table holding the configured static bindings
    pub fn from_config(config: &StackConfig) -> Result<Self> {
        let mut table = Self::new(config.max_bindings, config.binding_ttl);
        for binding in &config.static_bindings {
            let route = match &binding.network {
                Some((network, station)) => {
                    let mac = MacAddress::from_slice(station)
                        .filter(|mac| !mac.is_empty())
                        .ok_or(BindingError::InvalidStationAddress(station.len()))?;
                    Route::routed(binding.address, NetworkAddress::new(*network, mac))
                }
                None => Route::unicast(binding.address),
            };
            table.bind_static(binding.device_instance, route, binding.max_apdu, binding.segmentation)?;
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add or overwrite a binding that never expires
    pub fn bind_static(
        &mut self,
        device_instance: u32,
        route: Route,
        max_apdu: usize,
        segmentation: Segmentation,
    ) -> Result<()> {
        self.bind(
            device_instance,
            Binding {
                route,
                max_apdu,
                segmentation,
                kind: BindingKind::Static,
            },
        )
    }

    /// Add or overwrite a binding valid for the table's TTL from `now`.
    ///
    /// A static binding for the same device is left alone.
    pub fn bind_learned(
        &mut self,
        device_instance: u32,
        route: Route,
        max_apdu: usize,
        segmentation: Segmentation,
        now: Instant,
    ) -> Result<()> {
        if self
            .entries
            .get(&device_instance)
            .is_some_and(Binding::is_static)
        {
            trace!("keeping static binding of device {}", device_instance);
            return Ok(());
        }

        self.bind(
            device_instance,
            Binding {
                route,
                max_apdu,
                segmentation,
                kind: BindingKind::Learned {
                    expires: now + self.ttl,
                },
            },
        )
    }

    /// Learn the sender of an I-Am
    pub fn learn(&mut self, i_am: &IAmRequest, source: Route, now: Instant) -> Result<()> {
        self.bind_learned(
            i_am.device_instance,
            source,
            i_am.max_apdu_length_accepted as usize,
            i_am.segmentation_supported,
            now,
        )
    }

    fn bind(&mut self, device_instance: u32, binding: Binding) -> Result<()> {
        if device_instance > MAX_DEVICE_INSTANCE {
            return Err(BindingError::InvalidDevice(device_instance));
        }
        if binding.route.is_broadcast() {
            return Err(BindingError::BroadcastRoute);
        }

        if !self.entries.contains_key(&device_instance) && self.entries.len() >= self.capacity {
            self.evict()?;
        }

        debug!(
            "bound device {} to {} (max-APDU {}, {:?})",
            device_instance, binding.route, binding.max_apdu, binding.kind
        );
        self.entries.insert(device_instance, binding);
        Ok(())
    }

    /// Drop the learned entry closest to expiry
    fn evict(&mut self) -> Result<()> {
        let victim = self
            .entries
            .iter()
            .filter_map(|(device, binding)| binding.expires().map(|expires| (expires, *device)))
            .min()
            .map(|(_, device)| device);

        match victim {
            Some(device) => {
                debug!("binding table full, evicting device {}", device);
                self.entries.remove(&device);
                Ok(())
            }
            None => Err(BindingError::TableFull {
                capacity: self.capacity,
            }),
        }
    }

    /// Look up the route to a device.
    ///
    /// A learned entry past its expiry reads as unresolved even before
    /// [`unbind_expired`](Self::unbind_expired) removes it.
    pub fn get_route(&self, device_instance: u32, now: Instant) -> Resolution {
        match self.entries.get(&device_instance) {
            Some(binding) if !binding.is_expired(now) => Resolution::Bound(*binding),
            _ => Resolution::Unresolved(device_instance),
        }
    }

    /// Remove a binding of either kind
    pub fn unbind(&mut self, device_instance: u32) -> Option<Binding> {
        self.entries.remove(&device_instance)
    }

    /// Remove learned entries expired at `now`, returning how many went
    pub fn unbind_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|device, binding| {
            let keep = !binding.is_expired(now);
            if !keep {
                trace!("binding of device {} expired", device);
            }
            keep
        });
        before - self.entries.len()
    }

    /// Device instances currently bound to `route`
    #[cfg(test)]
    pub fn devices_at(&self, route: &Route) -> impl Iterator<Item = u32> + '_ {
        let route = *route;
        self.entries
            .iter()
            .filter(move |(_, binding)| binding.route == route)
            .map(|(device, _)| *device)
    }

    pub fn broadcast_route(scope: BroadcastScope) -> Route {
        match scope {
            BroadcastScope::Local => Route::local_broadcast(),
            BroadcastScope::Global => Route::global_broadcast(),
            BroadcastScope::Remote(network) => Route::remote_broadcast(network),
        }
    }
}
