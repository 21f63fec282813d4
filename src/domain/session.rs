//! Refcounted client sessions.
//!
//! A client holds at most one session of each kind per adapter. Asking again
//! only bumps the refcount; the session disappears when the count reaches
//! zero or the client goes away.

use crate::domain::models::{ClientId, Mode, ReplyTo};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Client requires the adapter to be at least this visible.
    Mode(Mode),
    /// Client wants discovery kept running.
    Discovery,
}

impl SessionKind {
    fn same_kind(&self, other: &SessionKind) -> bool {
        matches!(
            (self, other),
            (SessionKind::Mode(_), SessionKind::Mode(_))
                | (SessionKind::Discovery, SessionKind::Discovery)
        )
    }

    fn label(&self) -> &'static str {
        match self {
            SessionKind::Mode(_) => "Mode",
            SessionKind::Discovery => "Discovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub client: ClientId,
    pub kind: SessionKind,
    pub refcount: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Created,
    Referenced,
}

#[derive(Debug, Default)]
pub struct Sessions {
    requests: Vec<SessionRequest>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on the client's session of `kind`, creating it if
    /// the client holds none.
    pub fn acquire(&mut self, client: ClientId, kind: SessionKind) -> Acquired {
        if let Some(req) = self.find_mut(client, &kind) {
            req.refcount += 1;
            debug!("{} session of {} ref={}", kind.label(), client, req.refcount);
            return Acquired::Referenced;
        }

        info!("{} session with {} activated", kind.label(), client);
        self.requests.push(SessionRequest {
            client,
            kind,
            refcount: 1,
        });
        Acquired::Created
    }

    /// Drop one reference. Returns the removed request once the count hits
    /// zero, `None` while references remain.
    pub fn release(&mut self, client: ClientId, kind: SessionKind) -> Option<SessionRequest> {
        let pos = self
            .requests
            .iter()
            .position(|r| r.client == client && r.kind.same_kind(&kind))?;

        let req = &mut self.requests[pos];
        req.refcount -= 1;
        debug!("{} session of {} ref={}", kind.label(), client, req.refcount);
        if req.refcount > 0 {
            return None;
        }

        let req = self.requests.remove(pos);
        info!("{} session with {} deactivated", req.kind.label(), client);
        Some(req)
    }

    /// Remove the client's session of `kind` regardless of its refcount.
    pub fn remove(&mut self, client: ClientId, kind: SessionKind) -> Option<SessionRequest> {
        let pos = self
            .requests
            .iter()
            .position(|r| r.client == client && r.kind.same_kind(&kind))?;
        let req = self.requests.remove(pos);
        info!("{} session with {} deactivated", req.kind.label(), client);
        Some(req)
    }

    pub fn find(&self, client: ClientId, kind: SessionKind) -> Option<&SessionRequest> {
        self.requests
            .iter()
            .find(|r| r.client == client && r.kind.same_kind(&kind))
    }

    fn find_mut(&mut self, client: ClientId, kind: &SessionKind) -> Option<&mut SessionRequest> {
        self.requests
            .iter_mut()
            .find(|r| r.client == client && r.kind.same_kind(kind))
    }

    pub fn has_mode_sessions(&self) -> bool {
        self.requests
            .iter()
            .any(|r| matches!(r.kind, SessionKind::Mode(_)))
    }

    pub fn has_discovery_sessions(&self) -> bool {
        self.requests
            .iter()
            .any(|r| r.kind == SessionKind::Discovery)
    }

    /// Most visible mode required by `baseline` and every mode session not
    /// held by an `excluded` client.
    pub fn needed_mode(&self, baseline: Mode, excluded: &[ClientId]) -> Mode {
        self.requests
            .iter()
            .filter(|r| !excluded.contains(&r.client))
            .filter_map(|r| match r.kind {
                SessionKind::Mode(mode) => Some(mode),
                SessionKind::Discovery => None,
            })
            .fold(baseline, Mode::max)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

/// A mode session waiting on the agent's confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub id: u64,
    pub client: ClientId,
    pub reply_to: ReplyTo,
    pub mode: Mode,
}
