//! Share accumulation with a sealing barrier

use crate::shares::sum_shares;
use crate::{Address, Error, Result};
use std::collections::BTreeMap;

/// Shares collected by one participant
///
/// Holds the participant's own retained share plus at most one share per
/// sender. The collection seals itself on the insertion that brings it to
/// exactly `capacity` entries; that insertion alone returns the aggregate,
/// and every later insertion is refused.
#[derive(Debug)]
pub struct ReceivedShares {
    capacity: usize,
    own: Option<i64>,
    inbound: BTreeMap<Address, i64>,
    sealed: Option<i64>,
}

impl ReceivedShares {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            own: None,
            inbound: BTreeMap::new(),
            sealed: None,
        }
    }

    pub fn len(&self) -> usize {
        self.inbound.len() + usize::from(self.own.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The participant's own retained share
    pub fn own_share(&self) -> Option<i64> {
        self.own
    }

    /// Aggregate, once sealed
    pub fn aggregate(&self) -> Option<i64> {
        self.sealed
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Record the participant's own share
    ///
    /// Returns the aggregate if this insertion sealed the collection.
    pub fn retain_own(&mut self, share: i64) -> Result<Option<i64>> {
        if self.own.is_some() {
            return Err(Error::violation("Own share already retained"));
        }
        self.own = Some(share);
        let sealed = self.seal_if_complete();
        if sealed.is_err() {
            self.own = None;
        }
        sealed
    }

    /// Record a share delivered by `from`
    ///
    /// Returns the aggregate if this insertion sealed the collection. A resend
    /// of the share already held from `from` is acknowledged without effect,
    /// also after sealing; a different share from the same sender is refused.
    pub fn insert(&mut self, from: Address, share: i64) -> Result<Option<i64>> {
        match self.inbound.get(&from) {
            Some(held) if *held == share => return Ok(None),
            Some(_) => {
                return Err(Error::violation(format!(
                    "Conflicting share from {}",
                    from
                )));
            }
            None => {}
        }
        if self.is_sealed() {
            return Err(Error::violation(format!(
                "Share from {} arrived after all {} shares were collected",
                from, self.capacity
            )));
        }
        if self.inbound.len() + 1 >= self.capacity {
            return Err(Error::violation(format!(
                "Share from {} exceeds the {} expected from peers",
                from,
                self.capacity.saturating_sub(1)
            )));
        }

        self.inbound.insert(from.clone(), share);
        let sealed = self.seal_if_complete();
        if sealed.is_err() {
            self.inbound.remove(&from);
        }
        sealed
    }

    /// Drop buffered shares whose sender is not in `peers`
    pub fn retain_senders(&mut self, peers: &[Address]) -> Vec<Address> {
        let discarded: Vec<Address> = self
            .inbound
            .keys()
            .filter(|sender| !peers.contains(sender))
            .cloned()
            .collect();
        for sender in &discarded {
            self.inbound.remove(sender);
        }
        discarded
    }

    fn seal_if_complete(&mut self) -> Result<Option<i64>> {
        if self.sealed.is_some() || self.len() != self.capacity {
            return Ok(None);
        }
        let total = sum_shares(self.own.iter().chain(self.inbound.values()))?;
        self.sealed = Some(total);
        Ok(Some(total))
    }
}
