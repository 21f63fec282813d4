//! Adapter service.
//!
//! Glue between the management client, the adapters it feeds and the RPC
//! surface. Everything here runs on the event loop; adapters borrow the
//! service's collaborators through a [`Ctx`] for the duration of one call.

use crate::domain::adapter::{Adapter, Completion, Ctx};
use crate::domain::error::{Error, ErrorReply, Result};
use crate::domain::models::{ClientId, Mode, ReplyTo, Signal, INDEX_NONE};
use crate::domain::ops::{ControllerOps, SettingsStore};
use crate::domain::settings::DaemonSettings;
use crate::domain::timer::{TimerKind, TimerQueue};
use crate::infrastructure::mgmt::{MgmtClient, MgmtNotification};
use crate::infrastructure::rpc::RpcCall;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// How an RPC call was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Reply(std::result::Result<Value, ErrorReply>),
    /// Answered later through a `DeferredReply` signal.
    Deferred,
}

pub struct AdapterService {
    mgmt: MgmtClient,
    adapters: BTreeMap<u16, Adapter>,
    store: Box<dyn SettingsStore>,
    timers: TimerQueue,
    config: DaemonSettings,
    signals: UnboundedSender<Signal>,
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Hardware(e.into()))
}

impl AdapterService {
    pub fn new(
        mgmt: MgmtClient,
        store: Box<dyn SettingsStore>,
        config: DaemonSettings,
        signals: UnboundedSender<Signal>,
    ) -> Self {
        Self {
            mgmt,
            adapters: BTreeMap::new(),
            store,
            timers: TimerQueue::new(),
            config,
            signals,
        }
    }

    /// Kick off controller enumeration.
    pub fn start(&mut self) -> Result<()> {
        self.mgmt.start()
    }

    pub fn adapter(&self, index: u16) -> Option<&Adapter> {
        self.adapters.get(&index)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn emit(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }

    fn ctx(&mut self) -> Ctx<'_> {
        Ctx {
            ops: &mut self.mgmt,
            store: self.store.as_mut(),
            signals: &self.signals,
            timers: &mut self.timers,
            config: &self.config,
        }
    }

    fn split(&mut self, index: u16) -> Result<(&mut Adapter, Ctx<'_>)> {
        let adapter = self
            .adapters
            .get_mut(&index)
            .ok_or(Error::NoSuchController(index))?;
        let ctx = Ctx {
            ops: &mut self.mgmt,
            store: self.store.as_mut(),
            signals: &self.signals,
            timers: &mut self.timers,
            config: &self.config,
        };
        Ok((adapter, ctx))
    }

    // ------------------------------------------------------------------
    // Management events
    // ------------------------------------------------------------------

    pub fn handle_mgmt_frame(&mut self, frame: &[u8]) {
        let notifications = match self.mgmt.handle_frame(frame) {
            Ok(notifications) => notifications,
            Err(e) => {
                warn!("Dropping management frame: {}", e);
                return;
            }
        };

        for notification in notifications {
            self.dispatch(notification);
        }
    }

    fn dispatch(&mut self, notification: MgmtNotification) {
        if let MgmtNotification::ControllerReady(index) = notification {
            self.controller_ready(index);
            return;
        }
        if let MgmtNotification::ControllerRemoved(index) = notification {
            self.controller_removed(index);
            return;
        }
        if let MgmtNotification::PoweredChanged(index, powered) = notification {
            self.powered_changed(index, powered);
            return;
        }

        let index = match &notification {
            MgmtNotification::ScanModeChanged(index, _)
            | MgmtNotification::PairableChanged(index, _)
            | MgmtNotification::ClassChanged(index, _)
            | MgmtNotification::Connected(index, _)
            | MgmtNotification::Disconnected(index, _)
            | MgmtNotification::Discovering(index, _)
            | MgmtNotification::DeviceFound { index, .. }
            | MgmtNotification::RemoteName { index, .. }
            | MgmtNotification::CommandFailed { index, .. } => *index,
            _ => return,
        };

        let Ok((adapter, mut ctx)) = self.split(index) else {
            debug!("No adapter for hci{}, dropping {:?}", index, notification);
            return;
        };

        match notification {
            MgmtNotification::ScanModeChanged(_, scan) => adapter.scan_mode_changed(&mut ctx, scan),
            MgmtNotification::PairableChanged(_, pairable) => {
                debug!("hci{} reports pairable {}", index, pairable)
            }
            MgmtNotification::ClassChanged(_, class) => adapter.class_changed(&mut ctx, class),
            MgmtNotification::Connected(_, address) => adapter.connected(&mut ctx, address),
            MgmtNotification::Disconnected(_, address) => adapter.disconnected(&mut ctx, address),
            MgmtNotification::Discovering(_, true) => adapter.inquiry_started(&mut ctx),
            MgmtNotification::Discovering(_, false) => adapter.inquiry_complete(&mut ctx),
            MgmtNotification::DeviceFound {
                address,
                class,
                rssi,
                name,
                ..
            } => {
                if adapter.is_up() {
                    adapter.device_found(&mut ctx, address, class, rssi, name);
                }
            }
            MgmtNotification::RemoteName {
                address,
                status,
                name,
                ..
            } => adapter.remote_name(&mut ctx, address, status, name),
            MgmtNotification::CommandFailed { opcode, status, .. } => {
                debug!(
                    "{} saw opcode {:#06x} fail with {:#04x}",
                    adapter.path(),
                    opcode,
                    status
                )
            }
            _ => {}
        }
    }

    /// Hardware info arrived: create the adapter on first sight and drive
    /// the controller towards its configured state.
    fn controller_ready(&mut self, index: u16) {
        let Some(info) = self.mgmt.controller(index).cloned() else {
            return;
        };

        if !self.adapters.contains_key(&index) {
            let adapter = Adapter::new(index, &info, &self.ctx());
            info!("Adapter {} registered for {}", adapter.path(), info.address);
            self.adapters.insert(index, adapter);
            self.emit(Signal::AdapterAdded { adapter: index });
        }

        let Ok((adapter, ctx)) = self.split(index) else {
            return;
        };
        let (mode, pairable) = adapter.reconcile_target(&ctx);
        let off_requested = adapter.off_requested();

        if mode == Mode::Off || off_requested {
            if info.enabled {
                if let Err(e) = self.mgmt.set_powered(index, false) {
                    error!("Unable to power down hci{}: {}", index, e);
                }
            }
            return;
        }

        let discoverable = mode >= Mode::Discoverable;
        if info.discoverable != discoverable {
            if let Err(e) = self.mgmt.set_discoverable(index, discoverable) {
                warn!("Unable to set discoverable on hci{}: {}", index, e);
            }
        }
        if info.pairable != pairable {
            if let Err(e) = self.mgmt.set_pairable(index, pairable) {
                warn!("Unable to set pairable on hci{}: {}", index, e);
            }
        }

        if info.enabled {
            self.powered_changed(index, true);
        } else if let Err(e) = self.mgmt.set_powered(index, true) {
            error!("Unable to power up hci{}: {}", index, e);
        }
    }

    fn controller_removed(&mut self, index: u16) {
        let Some(mut adapter) = self.adapters.remove(&index) else {
            return;
        };

        adapter.stop(&mut self.ctx());
        self.timers.cancel_all_for(index);
        info!("Adapter {} unregistered", adapter.path());
        self.emit(Signal::AdapterRemoved { adapter: index });
    }

    /// Power events are applied to completion in arrival order.
    fn powered_changed(&mut self, index: u16, powered: bool) {
        let Ok((adapter, mut ctx)) = self.split(index) else {
            debug!("Power change for unknown hci{}", index);
            return;
        };

        if powered {
            if let Err(e) = adapter.start(&mut ctx) {
                error!("Unable to start {}: {}", adapter.path(), e);
            }
        } else {
            adapter.stop(&mut ctx);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn fire_timers(&mut self, now: Instant) {
        for (_, kind) in self.timers.pop_expired(now) {
            let Ok((adapter, mut ctx)) = self.split(kind.index()) else {
                continue;
            };
            match kind {
                TimerKind::DiscoverableTimeout(_) => adapter.discoverable_timeout(&mut ctx),
                TimerKind::PairableTimeout(_) => adapter.pairable_timeout(&mut ctx),
                TimerKind::Reinquiry(_) => adapter.reinquiry_due(&mut ctx),
            }
        }
    }

    // ------------------------------------------------------------------
    // RPC
    // ------------------------------------------------------------------

    pub fn handle_call(&mut self, client: ClientId, serial: u64, call: RpcCall) -> CallOutcome {
        let reply_to = ReplyTo { client, serial };
        match self.call(client, reply_to, call) {
            Ok(Some(value)) => CallOutcome::Reply(Ok(value)),
            Ok(None) => CallOutcome::Deferred,
            Err(e) => {
                debug!("Call from {} failed: {}", client, e);
                CallOutcome::Reply(Err(ErrorReply::from(e)))
            }
        }
    }

    /// `Ok(None)` means the reply is deferred.
    fn call(&mut self, client: ClientId, reply_to: ReplyTo, call: RpcCall) -> Result<Option<Value>> {
        let value = match call {
            RpcCall::ListAdapters => {
                let paths: Vec<String> = self.adapters.values().map(|a| a.path().to_string()).collect();
                Value::from(paths)
            }
            RpcCall::DefaultAdapter => {
                let adapter = self
                    .adapters
                    .values()
                    .next()
                    .ok_or(Error::NoSuchController(INDEX_NONE))?;
                Value::from(adapter.path())
            }
            RpcCall::GetProperties { adapter } => {
                let (adapter, _) = self.split(adapter)?;
                to_json(adapter.get_properties()?)?
            }
            RpcCall::SetProperty {
                adapter,
                name,
                value,
            } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                adapter.set_property(&mut ctx, &name, value)?;
                Value::Null
            }
            RpcCall::RequestSession { adapter, mode } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                match adapter.request_session(&mut ctx, client, mode, reply_to)? {
                    Completion::Done => Value::Null,
                    Completion::Deferred => return Ok(None),
                }
            }
            RpcCall::ReleaseSession { adapter } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                adapter.release_session(&mut ctx, client)?;
                Value::Null
            }
            RpcCall::StartDiscovery { adapter } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                adapter.start_discovery(&mut ctx, client)?;
                Value::Null
            }
            RpcCall::StopDiscovery { adapter } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                adapter.stop_discovery(&mut ctx, client)?;
                Value::Null
            }
            RpcCall::CreateDevice { adapter, address } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                Value::from(adapter.create_device(&mut ctx, address)?)
            }
            RpcCall::RemoveDevice { adapter, path } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                adapter.remove_device(&mut ctx, &path)?;
                Value::Null
            }
            RpcCall::FindDevice { adapter, address } => {
                let (adapter, _) = self.split(adapter)?;
                Value::from(adapter.find_device(address)?)
            }
            RpcCall::ListDevices { adapter } => {
                let (adapter, _) = self.split(adapter)?;
                Value::from(adapter.list_devices())
            }
            RpcCall::RegisterAgent {
                adapter,
                path,
                capability,
            } => {
                let (adapter, _) = self.split(adapter)?;
                adapter.register_agent(client, &path, &capability)?;
                Value::Null
            }
            RpcCall::UnregisterAgent { adapter, path } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                adapter.unregister_agent(&mut ctx, client, &path)?;
                Value::Null
            }
            RpcCall::AgentReply {
                adapter,
                request_id,
                accepted,
            } => {
                let (adapter, mut ctx) = self.split(adapter)?;
                adapter.authorization_result(&mut ctx, client, request_id, accepted)?;
                Value::Null
            }
        };
        Ok(Some(value))
    }

    /// Release everything `client` held on every adapter.
    pub fn client_disconnected(&mut self, client: ClientId) {
        let indices: Vec<u16> = self.adapters.keys().copied().collect();
        for index in indices {
            if let Ok((adapter, mut ctx)) = self.split(index) {
                adapter.client_disconnected(&mut ctx, client);
            }
        }
    }
}
