//! # Route Handle Registry
//!
//! Bidirectional bookkeeping between local socket handles and what they reach: a
//! network address, or an in-process route multiplexed over one.
//!
//! ## Invariants
//! - Every in-process route has exactly one owning address, and appears in that
//!   address's route set.
//! - `unregister_address` removes the address and every route under it in one step.
//! - The registry is confined to the single loop that owns it. It is `Send` so the loop
//!   can be spawned, and deliberately `!Sync`.

use std::cell::Cell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;

use uuid::Uuid;

use crate::error::ClusterError;
use crate::error::Result;

/// A loop-local handle for one socket or in-process route.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SocketHandle(pub u32);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

/// Everything removed by a group teardown.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Teardown {
    pub address: Option<SocketHandle>,
    pub routes: Vec<(Uuid, SocketHandle)>,
    /// Control address that was paired with the removed address, if any.
    pub control: Option<String>,
}

#[derive(Default)]
pub struct RouteHandleRegistry {
    address_by_handle: HashMap<SocketHandle, String>,
    handle_by_address: HashMap<String, SocketHandle>,
    route_by_handle: HashMap<SocketHandle, Uuid>,
    handle_by_route: HashMap<Uuid, SocketHandle>,
    owner_by_route: HashMap<Uuid, String>,
    routes_by_address: HashMap<String, HashSet<Uuid>>,
    invoker_by_control: HashMap<String, String>,
    control_by_invoker: HashMap<String, String>,
    next_handle: u32,
    _confined: PhantomData<Cell<()>>,
}

impl RouteHandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a handle that no live address or route uses.
    pub fn allocate(&mut self) -> SocketHandle {
        loop {
            self.next_handle = self.next_handle.wrapping_add(1).max(1);
            let handle = SocketHandle(self.next_handle);
            if !self.address_by_handle.contains_key(&handle) && !self.route_by_handle.contains_key(&handle) {
                return handle;
            }
        }
    }

    pub fn register_address(&mut self, handle: SocketHandle, address: &str) -> Result<()> {
        if self.handle_by_address.contains_key(address) {
            return Err(ClusterError::illegal_state(format!("Address already registered: {}", address)));
        }
        if self.address_by_handle.contains_key(&handle) || self.route_by_handle.contains_key(&handle) {
            return Err(ClusterError::illegal_state(format!("Handle already registered: {}", handle)));
        }
        self.address_by_handle.insert(handle, address.to_string());
        self.handle_by_address.insert(address.to_string(), handle);
        self.routes_by_address.entry(address.to_string()).or_default();
        Ok(())
    }

    pub fn handle_for_address(&self, address: &str) -> Option<SocketHandle> {
        self.handle_by_address.get(address).copied()
    }

    pub fn address_for_handle(&self, handle: SocketHandle) -> Option<&str> {
        self.address_by_handle.get(&handle).map(String::as_str)
    }

    /// Registers an in-process route under an already registered address.
    pub fn register_route(&mut self, handle: SocketHandle, route: Uuid, owner: &str) -> Result<()> {
        if !self.handle_by_address.contains_key(owner) {
            return Err(ClusterError::not_found(format!("No connection to {}", owner)));
        }
        if self.handle_by_route.contains_key(&route) {
            return Err(ClusterError::illegal_state(format!("Route already registered: {}", route)));
        }
        if self.address_by_handle.contains_key(&handle) || self.route_by_handle.contains_key(&handle) {
            return Err(ClusterError::illegal_state(format!("Handle already registered: {}", handle)));
        }
        self.route_by_handle.insert(handle, route);
        self.handle_by_route.insert(route, handle);
        self.owner_by_route.insert(route, owner.to_string());
        self.routes_by_address.entry(owner.to_string()).or_default().insert(route);
        Ok(())
    }

    pub fn handle_for_route(&self, route: &Uuid) -> Option<SocketHandle> {
        self.handle_by_route.get(route).copied()
    }

    pub fn route_for_handle(&self, handle: SocketHandle) -> Option<Uuid> {
        self.route_by_handle.get(&handle).copied()
    }

    pub fn owner_of(&self, route: &Uuid) -> Option<&str> {
        self.owner_by_route.get(route).map(String::as_str)
    }

    pub fn routes_under(&self, address: &str) -> Vec<Uuid> {
        let mut routes: Vec<Uuid> = self
            .routes_by_address
            .get(address)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        routes.sort();
        routes
    }

    pub fn unregister_route(&mut self, route: &Uuid) -> Option<SocketHandle> {
        let handle = self.handle_by_route.remove(route)?;
        self.route_by_handle.remove(&handle);
        if let Some(owner) = self.owner_by_route.remove(route) {
            if let Some(set) = self.routes_by_address.get_mut(&owner) {
                set.remove(route);
            }
        }
        Some(handle)
    }

    /// Removes the address, every route under it, and its control pairing.
    pub fn unregister_address(&mut self, address: &str) -> Teardown {
        let mut teardown = Teardown::default();

        if let Some(routes) = self.routes_by_address.remove(address) {
            let mut routes: Vec<Uuid> = routes.into_iter().collect();
            routes.sort();
            for route in routes {
                self.owner_by_route.remove(&route);
                if let Some(handle) = self.handle_by_route.remove(&route) {
                    self.route_by_handle.remove(&handle);
                    teardown.routes.push((route, handle));
                }
            }
        }

        if let Some(handle) = self.handle_by_address.remove(address) {
            self.address_by_handle.remove(&handle);
            teardown.address = Some(handle);
        }

        if let Some(control) = self.control_by_invoker.remove(address) {
            self.invoker_by_control.remove(&control);
            teardown.control = Some(control);
        }

        teardown
    }

    /// Records that `control` and `invoker` are the two planes of one instance.
    pub fn pair_instance(&mut self, control: &str, invoker: &str) {
        if let Some(previous) = self.invoker_by_control.insert(control.to_string(), invoker.to_string()) {
            self.control_by_invoker.remove(&previous);
        }
        if let Some(previous) = self.control_by_invoker.insert(invoker.to_string(), control.to_string()) {
            if previous != control {
                self.invoker_by_control.remove(&previous);
            }
        }
    }

    /// Forgets the pairing of `control` and returns its data-plane address.
    pub fn unpair_instance(&mut self, control: &str) -> Option<String> {
        let invoker = self.invoker_by_control.remove(control)?;
        self.control_by_invoker.remove(&invoker);
        Some(invoker)
    }

    pub fn invoker_for_control(&self, control: &str) -> Option<&str> {
        self.invoker_by_control.get(control).map(String::as_str)
    }

    pub fn control_for_invoker(&self, invoker: &str) -> Option<&str> {
        self.control_by_invoker.get(invoker).map(String::as_str)
    }

    pub fn address_count(&self) -> usize {
        self.handle_by_address.len()
    }

    pub fn route_count(&self) -> usize {
        self.handle_by_route.len()
    }
}
