//! Endpoint bookkeeping shared by both transport backends.
//!
//! An [`EndpointSet`] owns every endpoint of one worker. The scheduler only
//! ever refers to endpoints by index; replacing or appending goes through the
//! set so that superseded handles are closed exactly once.

use super::config::AddressFamily;

/// Why an endpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Primary,
    MigrationCandidate,
}

/// A bound transport handle (kernel socket or NIC queue port).
pub trait Endpoint {
    fn family(&self) -> AddressFamily;

    /// Port actually bound (never 0 once opened).
    fn local_port(&self) -> u16;

    fn role(&self) -> EndpointRole;

    fn set_role(&mut self, role: EndpointRole);

    fn is_open(&self) -> bool;

    /// Release the handle. Closing an already closed endpoint is a no-op.
    fn close(&mut self);
}

/// Fixed-capacity list of endpoints owned by one worker.
#[derive(Debug)]
pub struct EndpointSet<E: Endpoint> {
    endpoints: Vec<E>,
    max: usize,
}

impl<E: Endpoint> EndpointSet<E> {
    pub fn new(endpoints: Vec<E>, max: usize) -> Self {
        debug_assert!(endpoints.len() <= max);
        Self { endpoints, max }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.endpoints.len() >= self.max
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&E> {
        self.endpoints.get(index)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut E> {
        self.endpoints.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.endpoints.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, E> {
        self.endpoints.iter_mut()
    }

    /// Family of the primary endpoint (index 0).
    pub fn primary_family(&self) -> Option<AddressFamily> {
        self.endpoints.first().map(Endpoint::family)
    }

    /// First open endpoint whose family matches `family`.
    pub fn find_family(&self, family: AddressFamily) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|ep| ep.is_open() && ep.family() == family)
    }

    /// Replace the endpoint at `index`, closing the old one.
    ///
    /// Returns the superseded (closed) endpoint.
    pub fn replace(&mut self, index: usize, mut new: E) -> Option<E> {
        let slot = self.endpoints.get_mut(index)?;
        new.set_role(slot.role());
        let mut old = std::mem::replace(slot, new);
        old.close();
        Some(old)
    }

    /// Append a candidate endpoint.
    ///
    /// When the set is full the candidate is handed back untouched so the
    /// caller decides what to do with it.
    pub fn push(&mut self, endpoint: E) -> Result<usize, E> {
        if self.is_full() {
            return Err(endpoint);
        }
        self.endpoints.push(endpoint);
        Ok(self.endpoints.len() - 1)
    }

    /// Close every endpoint. Safe to call repeatedly.
    pub fn close_all(&mut self) {
        for ep in &mut self.endpoints {
            ep.close();
        }
    }

    /// Number of endpoints still holding a live handle.
    pub fn open_count(&self) -> usize {
        self.endpoints.iter().filter(|ep| ep.is_open()).count()
    }
}

impl<E: Endpoint> Drop for EndpointSet<E> {
    fn drop(&mut self) {
        self.close_all();
    }
}
