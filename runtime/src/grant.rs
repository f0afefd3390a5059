// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Counted resource claims drawn from an [`Issuer`] pool, built atop
//! [`Watch<u64>`](crate::watch::Watch).
//!
//! Unlike the non-owning-pointer-plus-runtime-assert design this is
//! grounded on, a [`Grant`] here holds a real `Arc<Issuer>`: Rust's
//! ownership model makes "destroyed the pool while a claim was still
//! outstanding" unrepresentable rather than something to detect at runtime.
//! See `DESIGN.md` for the tradeoff.

use crate::status::{Status, StatusCode, StatusOr};
use crate::watch::{Observed, Watch};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A pool of counted resources that [`Grant`]s are issued from.
pub struct Issuer {
    available: Watch<u64>,
    total_size: AtomicU64,
}

impl Issuer {
    #[must_use]
    pub fn new(initial_count: u64) -> Arc<Self> {
        Arc::new(Issuer {
            available: Watch::new(initial_count),
            total_size: AtomicU64::new(initial_count),
        })
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.available.get_value()
    }

    /// Increases the pool by `count`, waking anyone blocked in
    /// `issue_grant(.., wait = true)`.
    pub fn grow(&self, count: u64) {
        self.total_size.fetch_add(count, Ordering::AcqRel);
        self.available.fetch_add(count);
    }

    /// Shuts the pool down: all pending and future `issue_grant` calls fail
    /// with [`StatusCode::Closed`].
    pub fn close(&self) {
        self.available.close(Status::new(StatusCode::Closed));
    }

    /// Allocates `count` units from the pool. `issue_grant(0, _)` always
    /// succeeds with an empty grant regardless of pool state (short of an
    /// already-closed pool).
    pub fn issue_grant(self: &Arc<Self>, count: u64, wait: bool) -> StatusOr<Grant> {
        transfer(self.clone(), &self.available, count, wait, StatusCode::Closed)
    }

    fn recycle(&self, count: u64) {
        if count > 0 {
            self.available.fetch_add(count);
        }
    }
}

impl Drop for Issuer {
    fn drop(&mut self) {
        let available = self.available.get_value();
        let total = self.total_size.load(Ordering::Acquire);
        debug_assert_eq!(
            available, total,
            "Issuer dropped with outstanding grants (available={available}, total={total})"
        );
    }
}

/// A claim on some portion of an [`Issuer`]'s pool.
///
/// `Grant`s are move-only by ordinary Rust ownership; there is no
/// "moved-from but still alive" state to model, since consuming a `Grant` by
/// value (as [`subsume`](Grant::subsume) does) is exactly a move.
pub struct Grant {
    issuer: Option<Arc<Issuer>>,
    size: Watch<u64>,
}

impl Grant {
    fn new_raw(issuer: Option<Arc<Issuer>>, size: u64) -> Self {
        Grant {
            issuer,
            size: Watch::new(size),
        }
    }

    /// An empty grant detached from any issuer.
    #[must_use]
    pub fn empty() -> Self {
        Grant::new_raw(None, 0)
    }

    #[must_use]
    pub fn issuer(&self) -> Option<&Arc<Issuer>> {
        self.issuer.as_ref()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.get_value()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.size() != 0 && self.issuer.is_some()
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.size.is_closed()
    }

    /// Spends `count` from this grant, returning a new sub-grant on the same
    /// issuer. Fails with [`StatusCode::GrantUnavailable`] if insufficient
    /// and not waiting, or [`StatusCode::GrantRevoked`] if this grant has
    /// been revoked.
    pub fn spend(&self, count: u64, wait: bool) -> StatusOr<Grant> {
        let issuer = self
            .issuer
            .clone()
            .ok_or_else(|| Status::new(StatusCode::FailedPrecondition))?;
        transfer(issuer, &self.size, count, wait, StatusCode::GrantRevoked)
    }

    /// Spends the entire grant at once, recycling its size back to the
    /// issuer and returning the amount spent.
    pub fn spend_all(&self) -> u64 {
        let previous = self.size.modify(|_| 0);
        if let Some(issuer) = &self.issuer {
            issuer.recycle(previous);
        }
        previous
    }

    /// Permanently invalidates this grant: recycles its size back to the
    /// issuer and closes the size watch, waking any blocked `spend` calls
    /// with [`StatusCode::GrantRevoked`].
    pub fn revoke(&self) {
        self.spend_all();
        self.size.close(Status::new(StatusCode::GrantRevoked));
    }

    /// Folds `that` into `self`: increases `self`'s size by `that`'s size
    /// and empties `that`. Subsuming an empty, detached `that` is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `self` has no issuer, or if the two grants reference
    /// different issuers.
    pub fn subsume(&mut self, that: Grant) {
        let Some(that_issuer) = &that.issuer else {
            return;
        };
        let self_issuer = self
            .issuer
            .as_ref()
            .expect("Grant::subsume called on a grant with no issuer");
        assert!(
            Arc::ptr_eq(self_issuer, that_issuer),
            "Grant::subsume requires both grants reference the same issuer"
        );
        let taken = that.size.modify(|_| 0);
        self.size.fetch_add(taken);
    }

    /// Exchanges issuer references and sizes with `other`. The two grants
    /// may belong to different issuers.
    pub fn swap(&mut self, other: &mut Grant) {
        std::mem::swap(&mut self.issuer, &mut other.issuer);
        let self_size = self.size.modify(|_| other.size.get_value());
        other.size.set_value(self_size);
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        if let Some(issuer) = &self.issuer {
            let amount = self.size.get_value();
            issuer.recycle(amount);
        }
    }
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grant").field("size", &self.size()).finish()
    }
}

/// Shared algorithm behind `Issuer::issue_grant` and `Grant::spend`: CAS a
/// counted subtraction off `source` until it succeeds, the caller declines
/// to wait, or `source` closes.
fn transfer(
    issuer: Arc<Issuer>,
    source: &Watch<u64>,
    count: u64,
    wait: bool,
    closed_code: StatusCode,
) -> StatusOr<Grant> {
    if count == 0 {
        return Ok(Grant::new_raw(Some(issuer), 0));
    }
    loop {
        if source.is_closed() {
            return Err(Status::new(closed_code));
        }
        if source.modify_if(|v| v.checked_sub(count)).is_some() {
            return Ok(Grant::new_raw(Some(issuer), count));
        }
        if !wait {
            return Err(Status::new(StatusCode::GrantUnavailable));
        }
        match source.await_true(|v| *v >= count) {
            Observed::Value(_) => continue,
            Observed::Closed(_) => return Err(Status::new(closed_code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_round_trip() {
        let issuer = Issuer::new(10);
        {
            let g = issuer.issue_grant(3, false).unwrap();
            assert_eq!(issuer.available(), 7);
            assert_eq!(g.size(), 3);
        }
        assert_eq!(issuer.available(), 10);
    }

    #[test]
    fn issue_grant_zero_always_succeeds() {
        let issuer = Issuer::new(0);
        let g = issuer.issue_grant(0, false).unwrap();
        assert!(g.is_empty());
        assert!(!g.is_valid());
    }

    #[test]
    fn issue_grant_fails_without_waiting() {
        let issuer = Issuer::new(1);
        let err = issuer.issue_grant(5, false).unwrap_err();
        assert_eq!(err.code(), StatusCode::GrantUnavailable);
    }

    #[test]
    fn spend_and_subsume() {
        let issuer = Issuer::new(10);
        let mut g1 = issuer.issue_grant(6, false).unwrap();
        let g2 = g1.spend(4, false).unwrap();
        assert_eq!(g1.size(), 2);
        assert_eq!(g2.size(), 4);
        g1.subsume(g2);
        assert_eq!(g1.size(), 6);
        drop(g1);
        assert_eq!(issuer.available(), 10);
    }

    #[test]
    fn revoke_unblocks_spend_waiter_with_closed_status() {
        let issuer = Issuer::new(4);
        let g1 = issuer.issue_grant(3, false).unwrap();
        assert_eq!(g1.spend(5, false).unwrap_err().code(), StatusCode::GrantUnavailable);
        g1.revoke();
        assert!(g1.is_revoked());
        let err = g1.spend(1, false).unwrap_err();
        assert_eq!(err.code(), StatusCode::GrantRevoked);
    }

    #[test]
    fn subsume_empty_other_is_a_no_op() {
        let issuer = Issuer::new(5);
        let mut g1 = issuer.issue_grant(2, false).unwrap();
        g1.subsume(Grant::empty());
        assert_eq!(g1.size(), 2);
    }

    #[test]
    fn swap_exchanges_issuer_and_size() {
        let a = Issuer::new(5);
        let b = Issuer::new(5);
        let mut g1 = a.issue_grant(2, false).unwrap();
        let mut g2 = b.issue_grant(3, false).unwrap();
        g1.swap(&mut g2);
        assert_eq!(g1.size(), 3);
        assert_eq!(g2.size(), 2);
        assert!(Arc::ptr_eq(g1.issuer().unwrap(), &b));
        assert!(Arc::ptr_eq(g2.issuer().unwrap(), &a));
    }

    #[test]
    fn grow_increases_availability() {
        let issuer = Issuer::new(4);
        let _g1 = issuer.issue_grant(3, false).unwrap();
        issuer.grow(1);
        let g2 = issuer.issue_grant(2, false).unwrap();
        assert_eq!(g2.size(), 2);
        assert_eq!(issuer.available(), 0);
    }
}
