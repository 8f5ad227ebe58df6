//! Low-privilege identity lookup and the ordered privilege drop.
//!
//! Dropping root must happen in a fixed order: supplementary groups, then
//! the primary group, then the user. Once the uid changes the process can
//! no longer change its groups, so any other order leaves it half-dropped.
//! [`PrivilegeDrop`] encodes the order in its type so each step is only
//! reachable from the previous one.

use std::ffi::CString;
use std::marker::PhantomData;

use nix::unistd::{Gid, Uid, User};
use tracing::debug;

use crate::error::{Context, Error, Result};

/// A resolved account from the system identity database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Account name.
    pub name: String,
    /// Numeric user id.
    pub uid: Uid,
    /// Numeric primary group id.
    pub gid: Gid,
}

impl Identity {
    /// Looks up `name` in the identity database.
    ///
    /// A missing account is a configuration error, not a lookup failure.
    pub fn lookup(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .context("getpwnam")?
            .ok_or_else(|| Error::UnknownIdentity(name.to_owned()))?;
        Ok(Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
        })
    }

    /// Identity of the calling process, for tests and unprivileged staging.
    pub fn current() -> Self {
        let uid = Uid::current();
        let name = User::from_uid(uid)
            .ok()
            .flatten()
            .map_or_else(|| uid.to_string(), |u| u.name);
        Self {
            name,
            uid,
            gid: Gid::current(),
        }
    }

    /// Starts the ordered privilege drop towards this identity.
    pub fn drop_privileges(&self) -> Result<PrivilegeDrop<'_, Elevated>> {
        Ok(PrivilegeDrop {
            identity: self,
            name: CString::new(self.name.as_str())?,
            _state: PhantomData,
        })
    }

    /// Runs every step of the privilege drop in order.
    pub fn drop_all(&self) -> Result<Dropped> {
        self.drop_privileges()?.init_groups()?.set_gid()?.set_uid()
    }
}

/// Marker: nothing has been dropped yet.
#[derive(Debug, Clone, Copy)]
pub enum Elevated {}

/// Marker: supplementary groups have been replaced.
#[derive(Debug, Clone, Copy)]
pub enum GroupsSet {}

/// Marker: the primary group has been changed.
#[derive(Debug, Clone, Copy)]
pub enum GidSet {}

/// Proof that the process now runs as the low-privilege identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Dropped {
    /// The uid now in effect.
    pub uid: Uid,
    /// The gid now in effect.
    pub gid: Gid,
}

/// An in-progress privilege drop in state `S`.
#[derive(Debug)]
#[must_use = "privileges are only dropped once every step has run"]
pub struct PrivilegeDrop<'a, S> {
    /// Target identity.
    identity: &'a Identity,
    /// Account name for `initgroups(3)`.
    name: CString,
    /// Current step.
    _state: PhantomData<S>,
}

impl<'a, S> PrivilegeDrop<'a, S> {
    /// Moves to the next state.
    fn advance<T>(self) -> PrivilegeDrop<'a, T> {
        PrivilegeDrop {
            identity: self.identity,
            name: self.name,
            _state: PhantomData,
        }
    }
}

impl<'a> PrivilegeDrop<'a, Elevated> {
    /// Replaces the supplementary group list with the identity's groups.
    pub fn init_groups(self) -> Result<PrivilegeDrop<'a, GroupsSet>> {
        nix::unistd::initgroups(&self.name, self.identity.gid).context("initgroups")?;
        debug!(user = %self.identity.name, "supplementary groups initialized");
        Ok(self.advance())
    }
}

impl<'a> PrivilegeDrop<'a, GroupsSet> {
    /// Sets the real, effective and saved group id.
    pub fn set_gid(self) -> Result<PrivilegeDrop<'a, GidSet>> {
        nix::unistd::setgid(self.identity.gid).context("setgid")?;
        debug!(gid = %self.identity.gid, "group id set");
        Ok(self.advance())
    }
}

impl PrivilegeDrop<'_, GidSet> {
    /// Sets the real, effective and saved user id. Irreversible.
    pub fn set_uid(self) -> Result<Dropped> {
        nix::unistd::setuid(self.identity.uid).context("setuid")?;
        debug!(uid = %self.identity.uid, "user id set");
        Ok(Dropped {
            uid: self.identity.uid,
            gid: self.identity.gid,
        })
    }
}
