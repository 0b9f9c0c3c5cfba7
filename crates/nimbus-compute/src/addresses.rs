use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use ipnet::Ipv4Net;

use crate::{Error, Result};

/// Fixed IPv4 addresses handed to servers for their lifetime.
///
/// The first host address of the network is reserved for the gateway.
pub struct AddressPool {
    network: Ipv4Net,
    allocated: Mutex<BTreeSet<Ipv4Addr>>,
}

impl AddressPool {
    pub fn new(network: Ipv4Net) -> Self {
        Self {
            network,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.network.hosts().next()
    }

    /// Hand out the lowest free address.
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let gateway = self.gateway();
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        let addr = self
            .network
            .hosts()
            .find(|addr| Some(*addr) != gateway && !allocated.contains(addr))
            .ok_or(Error::AddressPoolExhausted)?;
        allocated.insert(addr);
        Ok(addr)
    }

    pub fn release(&self, addr: Ipv4Addr) {
        self.allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr);
    }
}
