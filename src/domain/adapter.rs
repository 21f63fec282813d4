//! Per-controller adapter core.
//!
//! Owns the policy state of one controller: its mode and scan mode, the
//! discoverable/pairable timers, client sessions, the discovery engine and
//! the remote device objects. Every operation runs on the event-loop thread
//! and talks to the radio through [`ControllerOps`].

use crate::domain::device::{Agent, IoCapability, RemoteDevice};
use crate::domain::discovery::{DiscoveryState, FoundDevices, Sighting};
use crate::domain::error::{Error, ErrorReply, Result};
use crate::domain::models::{
    class_from_u32, class_to_u32, BdAddr, ClientId, Mode, NameStatus, Properties, PropertyValue,
    ReplyTo, ScanMode, Signal,
};
use crate::domain::ops::{keys, ControllerOps, SettingsStore, GIAC_LAP};
use crate::domain::registry::ControllerInfo;
use crate::domain::session::{Acquired, PendingAuthorization, SessionKind, Sessions};
use crate::domain::settings::{DaemonSettings, InquiryStrategy};
use crate::domain::timer::{TimerId, TimerKind, TimerQueue};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Object path prefix for adapters and their devices.
pub const BASE_PATH: &str = "/btadapterd";

/// Longest local name the radio accepts, in bytes.
const MAX_NAME_LEN: usize = 248;

/// Everything an adapter operation may touch outside the adapter itself.
pub struct Ctx<'a> {
    pub ops: &'a mut dyn ControllerOps,
    pub store: &'a mut dyn SettingsStore,
    pub signals: &'a UnboundedSender<Signal>,
    pub timers: &'a mut TimerQueue,
    pub config: &'a DaemonSettings,
}

impl Ctx<'_> {
    fn emit(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }
}

/// Result of a call that may have to wait for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// The reply is delivered later as a `DeferredReply` signal.
    Deferred,
}

pub struct Adapter {
    index: u16,
    path: String,
    address: BdAddr,
    name: String,
    class: [u8; 3],

    up: bool,
    initialized: bool,
    off_requested: bool,

    mode: Mode,
    scan_mode: ScanMode,
    global_mode: Mode,
    pairable: bool,
    discov_timeout: u32,
    pairable_timeout: u32,
    discov_timer: Option<TimerId>,
    pairable_timer: Option<TimerId>,
    scheduler_timer: Option<TimerId>,

    state: DiscoveryState,
    found: FoundDevices,
    oor: Vec<String>,

    sessions: Sessions,
    pending: Vec<PendingAuthorization>,
    next_request_id: u64,
    agent: Option<Agent>,

    devices: Vec<RemoteDevice>,
    connections: BTreeSet<BdAddr>,
    svc_cache: Option<u8>,
}

impl Adapter {
    pub fn new(index: u16, info: &ControllerInfo, ctx: &Ctx<'_>) -> Self {
        let address = info.address;
        let name = ctx
            .store
            .read(&address, keys::NAME)
            .unwrap_or_else(|| ctx.config.name.clone());

        Self {
            index,
            path: format!("{}/hci{}", BASE_PATH, index),
            address,
            name,
            class: info.class,
            up: false,
            initialized: false,
            off_requested: false,
            mode: Mode::Off,
            scan_mode: ScanMode::DISABLED,
            global_mode: Mode::Off,
            pairable: ctx.store.read_bool(&address, keys::PAIRABLE).unwrap_or(true),
            discov_timeout: ctx
                .store
                .read_u32(&address, keys::DISCOVERABLE_TIMEOUT)
                .unwrap_or(ctx.config.discoverable_timeout_secs),
            pairable_timeout: ctx
                .store
                .read_u32(&address, keys::PAIRABLE_TIMEOUT)
                .unwrap_or(ctx.config.pairable_timeout_secs),
            discov_timer: None,
            pairable_timer: None,
            scheduler_timer: None,
            state: DiscoveryState::default(),
            found: FoundDevices::new(),
            oor: Vec::new(),
            sessions: Sessions::new(),
            pending: Vec::new(),
            next_request_id: 0,
            agent: None,
            devices: Vec::new(),
            connections: BTreeSet::new(),
            svc_cache: None,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn address(&self) -> BdAddr {
        self.address
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn scan_mode(&self) -> ScanMode {
        self.scan_mode
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn off_requested(&self) -> bool {
        self.off_requested
    }

    pub fn pairable(&self) -> bool {
        self.pairable
    }

    pub fn class(&self) -> [u8; 3] {
        self.class
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn found(&self) -> &FoundDevices {
        &self.found
    }

    pub fn out_of_range(&self) -> &[String] {
        &self.oor
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    pub fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }

    pub fn connections(&self) -> &BTreeSet<BdAddr> {
        &self.connections
    }

    pub fn discoverable_timer_pending(&self) -> bool {
        self.discov_timer.is_some()
    }

    fn emit_property(&self, ctx: &Ctx<'_>, name: &str, value: PropertyValue) {
        ctx.emit(Signal::PropertyChanged {
            adapter: self.index,
            name: name.to_string(),
            value,
        });
    }

    /// Class with the cached service-class byte applied.
    fn effective_class(&self) -> [u8; 3] {
        let mut class = self.class;
        if let Some(svc) = self.svc_cache {
            class[2] = svc;
        }
        class
    }

    // ------------------------------------------------------------------
    // Startup / shutdown
    // ------------------------------------------------------------------

    /// Mode label configured for this adapter before any "on" resolution.
    fn configured_mode(&self, ctx: &Ctx<'_>) -> Option<Mode> {
        if !self.initialized && !ctx.config.remember_powered {
            return Some(ctx.config.default_mode);
        }

        if let Some(mode) = ctx
            .store
            .read(&self.address, keys::MODE)
            .and_then(|label| Mode::parse(&label))
        {
            return Some(mode);
        }

        if !self.initialized {
            return Some(ctx.config.default_mode);
        }
        None
    }

    /// Mode and pairable flag the controller should be reconciled to after
    /// its hardware info has been read.
    pub fn reconcile_target(&self, ctx: &Ctx<'_>) -> (Mode, bool) {
        let mode = match self.configured_mode(ctx) {
            Some(Mode::Off) => Mode::Off,
            Some(Mode::Connectable) | None => Mode::Connectable,
            Some(visible) => self.visible_mode(visible),
        };
        (mode, self.pairable)
    }

    /// Discoverability is only restored at startup when it never times out.
    fn visible_mode(&self, mode: Mode) -> Mode {
        if mode < Mode::Discoverable || self.discov_timeout != 0 {
            Mode::Connectable
        } else if self.pairable {
            Mode::LimitedDiscoverable
        } else {
            Mode::Discoverable
        }
    }

    /// Mode to come up in, or `None` if the controller must be powered down.
    fn startup_mode(&self, ctx: &mut Ctx<'_>) -> Option<Mode> {
        match self.configured_mode(ctx) {
            None | Some(Mode::Connectable) => Some(Mode::Connectable),
            Some(Mode::Off) if !self.initialized => None,
            Some(Mode::Off) => {
                // Powered on behind our back: honour it and remember the
                // mode it came up in.
                let on_mode = ctx.store.read_on_mode(&self.address);
                if let Err(e) = ctx.store.write_mode(&self.address, on_mode) {
                    warn!("Unable to store mode for {}: {}", self.path, e);
                }
                Some(match on_mode {
                    Mode::Connectable => Mode::Connectable,
                    visible => self.visible_mode(visible),
                })
            }
            Some(visible) => Some(self.visible_mode(visible)),
        }
    }

    /// React to the controller being powered on.
    pub fn start(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        if self.up {
            debug!("Adapter {} already up", self.path);
            return Ok(());
        }
        self.bring_up(ctx, None)
    }

    fn bring_up(&mut self, ctx: &mut Ctx<'_>, requested: Option<Mode>) -> Result<()> {
        self.off_requested = false;
        self.discov_timeout = ctx
            .store
            .read_u32(&self.address, keys::DISCOVERABLE_TIMEOUT)
            .unwrap_or(ctx.config.discoverable_timeout_secs);
        self.pairable_timeout = ctx
            .store
            .read_u32(&self.address, keys::PAIRABLE_TIMEOUT)
            .unwrap_or(ctx.config.pairable_timeout_secs);
        self.pairable = ctx
            .store
            .read_bool(&self.address, keys::PAIRABLE)
            .unwrap_or(true);
        self.state = DiscoveryState::default();

        let mode = match requested.or_else(|| self.startup_mode(ctx)) {
            Some(mode) => mode,
            None => {
                info!("Adapter {} configured off, powering down", self.path);
                self.finish_first_start(ctx);
                ctx.ops.set_powered(self.index, false)?;
                self.up = false;
                self.mode = Mode::Off;
                self.scan_mode = ScanMode::DISABLED;
                return Ok(());
            }
        };

        let scan = mode.scan_mode();
        ctx.ops.write_scan_enable(self.index, scan)?;

        self.up = true;
        self.emit_property(ctx, "Powered", PropertyValue::Bool(true));

        self.scan_mode = ScanMode::DISABLED;
        self.apply_scan_mode(ctx, scan);
        self.mode = mode;

        if !self.initialized {
            self.finish_first_start(ctx);
        }

        info!("Adapter {} has been enabled ({})", self.path, self.mode);
        Ok(())
    }

    fn finish_first_start(&mut self, ctx: &mut Ctx<'_>) {
        self.load_devices(ctx);
        self.initialized = true;

        let stored_class = ctx
            .store
            .read(&self.address, keys::CLASS)
            .and_then(|s| u32::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok());
        let wanted = stored_class.or(match ctx.config.device_class {
            0 => None,
            class => Some(class),
        });
        if let Some(class) = wanted.map(class_from_u32) {
            if class != self.class {
                match ctx.ops.set_dev_class(self.index, class) {
                    Ok(()) => self.class = class,
                    Err(e) => warn!("Unable to set class of {}: {}", self.path, e),
                }
            }
        }

        let svc = self.svc_cache.take().or(match ctx.config.service_class {
            0 => None,
            svc => Some(svc),
        });
        if let Some(svc) = svc {
            if let Err(e) = self.update_service_class(ctx, svc) {
                warn!("Unable to set service class of {}: {}", self.path, e);
            }
        }
    }

    fn load_devices(&mut self, ctx: &Ctx<'_>) {
        for prefix in [keys::PROFILES, keys::LINK_KEY] {
            for key in ctx.store.keys_with_prefix(&self.address, prefix) {
                let Ok(peer) = key[prefix.len()..].parse::<BdAddr>() else {
                    warn!("Ignoring malformed stored key {}", key);
                    continue;
                };
                if self.devices.iter().any(|d| d.address == peer) {
                    continue;
                }

                let mut device = RemoteDevice::new(&self.path, peer, false);
                device.trusted = ctx
                    .store
                    .read_bool(&self.address, &keys::remote(keys::TRUSTED, &peer))
                    .unwrap_or(false);
                debug!("Loaded stored device {}", device.path);
                self.devices.push(device);
            }
        }
    }

    /// React to the controller being powered off. Every session is dropped
    /// and pending authorizations fail.
    pub fn stop(&mut self, ctx: &mut Ctx<'_>) {
        if !self.up {
            return;
        }

        ctx.timers.cancel(&mut self.discov_timer);
        ctx.timers.cancel(&mut self.pairable_timer);
        ctx.timers.cancel(&mut self.scheduler_timer);

        if self.sessions.has_discovery_sessions() {
            if self.state.std_inquiry {
                if let Err(e) = ctx.ops.cancel_inquiry(self.index) {
                    debug!("Cancel inquiry on {}: {}", self.path, e);
                }
            }
            if self.state.periodic_inquiry {
                if let Err(e) = ctx.ops.exit_periodic_inquiry(self.index) {
                    debug!("Exit periodic inquiry on {}: {}", self.path, e);
                }
            }
        }

        self.fail_pending(ctx, || Error::NotReady);
        self.sessions.clear();
        self.found.clear();
        self.oor.clear();
        self.connections.clear();

        if self.scan_mode == ScanMode::PAGE_INQUIRY {
            self.emit_property(ctx, "Discoverable", PropertyValue::Bool(false));
        }
        if self.scan_mode.page() && self.pairable {
            self.emit_property(ctx, "Pairable", PropertyValue::Bool(false));
        }
        if self.state.is_active() {
            self.emit_property(ctx, "Discovering", PropertyValue::Bool(false));
        }
        self.emit_property(ctx, "Powered", PropertyValue::Bool(false));

        self.up = false;
        self.scan_mode = ScanMode::DISABLED;
        self.mode = Mode::Off;
        self.state = DiscoveryState::default();

        info!("Adapter {} has been disabled", self.path);
    }

    // ------------------------------------------------------------------
    // Mode state machine
    // ------------------------------------------------------------------

    /// Move the adapter to `target`. On error nothing is committed.
    pub fn set_mode(&mut self, ctx: &mut Ctx<'_>, target: Mode) -> Result<()> {
        let scan = target.scan_mode();

        if !self.up && !scan.is_disabled() {
            match ctx.ops.set_powered(self.index, true) {
                Ok(()) => {}
                Err(e) if e.is_already() => debug!("{} already powered", self.path),
                Err(e) => {
                    error!("Can't power on {}: {}", self.path, e);
                    return Err(e);
                }
            }
            self.bring_up(ctx, Some(target))?;
        } else if self.up && scan.is_disabled() {
            ctx.timers.cancel(&mut self.discov_timer);
            if let Err(e) = ctx.ops.write_scan_enable(self.index, ScanMode::DISABLED) {
                debug!("Disabling scan on {}: {}", self.path, e);
            }
            ctx.ops.set_powered(self.index, false)?;
            self.off_requested = true;
            self.stop(ctx);
        } else if !self.up {
            // Already down and staying down.
        } else if self.scan_mode != scan {
            ctx.ops.write_scan_enable(self.index, scan)?;
            self.apply_scan_mode(ctx, scan);
        } else if scan.inquiry() && target != self.mode {
            let limited = target == Mode::LimitedDiscoverable;
            if limited || self.mode == Mode::LimitedDiscoverable {
                self.toggle_limited(ctx, limited)?;
            }
            self.start_discoverable_timer(ctx);
        }

        if let Err(e) = ctx.store.write_mode(&self.address, target) {
            warn!("Unable to store mode for {}: {}", self.path, e);
        }
        self.mode = target;
        Ok(())
    }

    fn toggle_limited(&mut self, ctx: &mut Ctx<'_>, limited: bool) -> Result<()> {
        match ctx
            .ops
            .set_limited_discoverable(self.index, self.effective_class(), limited)
        {
            Err(Error::Unsupported(what)) => {
                debug!("{} not supported on {}", what, self.path);
                Ok(())
            }
            other => other,
        }
    }

    fn start_discoverable_timer(&mut self, ctx: &mut Ctx<'_>) {
        ctx.timers.cancel(&mut self.discov_timer);
        if self.discov_timeout != 0 {
            self.discov_timer = Some(ctx.timers.schedule(
                Duration::from_secs(self.discov_timeout as u64),
                TimerKind::DiscoverableTimeout(self.index),
            ));
        }
    }

    fn start_pairable_timer(&mut self, ctx: &mut Ctx<'_>) {
        ctx.timers.cancel(&mut self.pairable_timer);
        if self.pairable_timeout != 0 {
            self.pairable_timer = Some(ctx.timers.schedule(
                Duration::from_secs(self.pairable_timeout as u64),
                TimerKind::PairableTimeout(self.index),
            ));
        }
    }

    /// The radio reported a new scan-enable value.
    pub fn scan_mode_changed(&mut self, ctx: &mut Ctx<'_>, scan: ScanMode) {
        if !self.up {
            debug!("Ignoring scan mode change on {} while down", self.path);
            return;
        }
        self.apply_scan_mode(ctx, scan);
    }

    fn apply_scan_mode(&mut self, ctx: &mut Ctx<'_>, scan: ScanMode) {
        if self.scan_mode == scan {
            return;
        }

        ctx.timers.cancel(&mut self.discov_timer);

        let (powered, discoverable, pairable) = match scan {
            ScanMode::DISABLED => {
                self.mode = Mode::Off;
                (false, false, false)
            }
            ScanMode::PAGE => {
                self.mode = Mode::Connectable;
                (true, false, self.pairable)
            }
            ScanMode::PAGE_INQUIRY => {
                self.mode = Mode::Discoverable;
                self.start_discoverable_timer(ctx);
                (true, true, self.pairable)
            }
            ScanMode::INQUIRY => {
                // Inquiry scan without page scan; only the timer applies.
                self.start_discoverable_timer(ctx);
                return;
            }
            _ => return,
        };

        if !powered {
            self.emit_property(ctx, "Powered", PropertyValue::Bool(false));
        }

        if self.scan_mode.page() != scan.page() {
            self.emit_property(ctx, "Pairable", PropertyValue::Bool(pairable));
        }

        let limited = if discoverable && self.pairable {
            Some(true)
        } else if !discoverable {
            Some(false)
        } else {
            None
        };
        if let Some(limited) = limited {
            if let Err(e) = self.toggle_limited(ctx, limited) {
                error!("Unable to update inquiry access code on {}: {}", self.path, e);
            }
        }

        self.emit_property(ctx, "Discoverable", PropertyValue::Bool(discoverable));
        self.scan_mode = scan;
    }

    /// Discoverable timer expiry: drop inquiry scan, keep paging.
    pub fn discoverable_timeout(&mut self, ctx: &mut Ctx<'_>) {
        self.discov_timer = None;
        if !self.up {
            return;
        }

        let scan = self.scan_mode.without_inquiry();
        if let Err(e) = ctx.ops.write_scan_enable(self.index, scan) {
            error!("Unable to end discoverability on {}: {}", self.path, e);
            return;
        }
        self.apply_scan_mode(ctx, scan);
    }

    pub fn pairable_timeout(&mut self, ctx: &mut Ctx<'_>) {
        self.pairable_timer = None;
        if let Err(e) = self.set_pairable(ctx, false) {
            warn!("Unable to clear pairable on {}: {}", self.path, e);
        }
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn set_powered(&mut self, ctx: &mut Ctx<'_>, powered: bool) -> Result<()> {
        let mode = if powered {
            ctx.store.read_on_mode(&self.address)
        } else {
            Mode::Off
        };

        if mode == self.mode {
            return Ok(());
        }
        self.set_mode(ctx, mode)
    }

    pub fn set_discoverable(&mut self, ctx: &mut Ctx<'_>, discoverable: bool) -> Result<()> {
        let mode = match (discoverable, self.pairable) {
            (false, _) => Mode::Connectable,
            (true, true) => Mode::LimitedDiscoverable,
            (true, false) => Mode::Discoverable,
        };

        if mode == self.mode {
            return Ok(());
        }
        self.set_mode(ctx, mode)
    }

    pub fn set_pairable(&mut self, ctx: &mut Ctx<'_>, pairable: bool) -> Result<()> {
        if self.scan_mode.is_disabled() {
            return Err(Error::NotReady);
        }

        if pairable == self.pairable {
            return Ok(());
        }

        match ctx.ops.set_pairable(self.index, pairable) {
            Ok(()) | Err(Error::Unsupported(_)) => {}
            Err(e) => return Err(e),
        }

        self.pairable = pairable;
        if let Err(e) = ctx.store.write_bool(&self.address, keys::PAIRABLE, pairable) {
            warn!("Unable to store pairable for {}: {}", self.path, e);
        }
        self.emit_property(ctx, "Pairable", PropertyValue::Bool(pairable));

        if pairable {
            self.start_pairable_timer(ctx);
        } else {
            ctx.timers.cancel(&mut self.pairable_timer);
        }

        if !self.scan_mode.inquiry() {
            return Ok(());
        }

        let mode = if pairable {
            Mode::LimitedDiscoverable
        } else {
            Mode::Discoverable
        };
        self.set_mode(ctx, mode)
    }

    pub fn set_discoverable_timeout(&mut self, ctx: &mut Ctx<'_>, timeout: u32) -> Result<()> {
        if self.discov_timeout == timeout && timeout == 0 {
            return Ok(());
        }

        self.discov_timeout = timeout;
        if self.scan_mode.inquiry() {
            self.start_discoverable_timer(ctx);
        }

        if let Err(e) = ctx.store.write(
            &self.address,
            keys::DISCOVERABLE_TIMEOUT,
            &timeout.to_string(),
        ) {
            warn!("Unable to store discoverable timeout: {}", e);
        }
        self.emit_property(ctx, "DiscoverableTimeout", PropertyValue::U32(timeout));
        Ok(())
    }

    pub fn set_pairable_timeout(&mut self, ctx: &mut Ctx<'_>, timeout: u32) -> Result<()> {
        if self.pairable_timeout == timeout && timeout == 0 {
            return Ok(());
        }

        self.pairable_timeout = timeout;
        if self.pairable {
            self.start_pairable_timer(ctx);
        }

        if let Err(e) = ctx
            .store
            .write(&self.address, keys::PAIRABLE_TIMEOUT, &timeout.to_string())
        {
            warn!("Unable to store pairable timeout: {}", e);
        }
        self.emit_property(ctx, "PairableTimeout", PropertyValue::U32(timeout));
        Ok(())
    }

    pub fn set_name(&mut self, ctx: &mut Ctx<'_>, name: &str) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidArguments(format!(
                "name longer than {} bytes",
                MAX_NAME_LEN
            )));
        }
        if name == self.name {
            return Ok(());
        }

        if self.up {
            ctx.ops.set_local_name(self.index, name)?;
        }

        if let Err(e) = ctx.store.write(&self.address, keys::NAME, name) {
            warn!("Unable to store name for {}: {}", self.path, e);
        }
        self.name = name.to_string();
        self.emit_property(ctx, "Name", PropertyValue::Str(self.name.clone()));
        Ok(())
    }

    pub fn set_property(
        &mut self,
        ctx: &mut Ctx<'_>,
        name: &str,
        value: PropertyValue,
    ) -> Result<()> {
        match (name, value) {
            ("Name", PropertyValue::Str(s)) => self.set_name(ctx, &s),
            ("Powered", PropertyValue::Bool(b)) => self.set_powered(ctx, b),
            ("Discoverable", PropertyValue::Bool(b)) => self.set_discoverable(ctx, b),
            ("DiscoverableTimeout", PropertyValue::U32(t)) => {
                self.set_discoverable_timeout(ctx, t)
            }
            ("Pairable", PropertyValue::Bool(b)) => self.set_pairable(ctx, b),
            ("PairableTimeout", PropertyValue::U32(t)) => self.set_pairable_timeout(ctx, t),
            (name, value) => Err(Error::InvalidArguments(format!(
                "cannot set {} to {:?}",
                name, value
            ))),
        }
    }

    pub fn get_properties(&self) -> Result<Properties> {
        if self.address.is_any() {
            return Err(Error::NotReady);
        }

        let mut props = Properties::new();
        props.insert(
            "Address".to_string(),
            PropertyValue::Str(self.address.to_string()),
        );
        props.insert("Name".to_string(), PropertyValue::Str(self.name.clone()));
        props.insert(
            "Class".to_string(),
            PropertyValue::U32(class_to_u32(self.class)),
        );
        props.insert(
            "Powered".to_string(),
            PropertyValue::Bool(self.mode != Mode::Off),
        );
        props.insert(
            "Discoverable".to_string(),
            PropertyValue::Bool(self.scan_mode.inquiry()),
        );
        props.insert("Pairable".to_string(), PropertyValue::Bool(self.pairable));
        props.insert(
            "DiscoverableTimeout".to_string(),
            PropertyValue::U32(self.discov_timeout),
        );
        props.insert(
            "PairableTimeout".to_string(),
            PropertyValue::U32(self.pairable_timeout),
        );
        props.insert(
            "Discovering".to_string(),
            PropertyValue::Bool(self.state.is_active()),
        );
        props.insert("Devices".to_string(), PropertyValue::List(self.list_devices()));
        Ok(props)
    }

    // ------------------------------------------------------------------
    // Mode sessions
    // ------------------------------------------------------------------

    /// Ask for the adapter to be at least `wanted` (the stored "on" mode when
    /// unspecified). Raising the mode needs the agent's confirmation, in
    /// which case the reply to `reply_to` is deferred.
    pub fn request_session(
        &mut self,
        ctx: &mut Ctx<'_>,
        client: ClientId,
        wanted: Option<Mode>,
        reply_to: ReplyTo,
    ) -> Result<Completion> {
        let agent = self
            .agent
            .as_ref()
            .map(|a| a.client)
            .ok_or_else(|| Error::DoesNotExist("agent".to_string()))?;

        if !self.sessions.has_mode_sessions() {
            self.global_mode = self.mode;
        }

        let wanted = wanted.unwrap_or_else(|| ctx.store.read_on_mode(&self.address));
        if self.sessions.acquire(client, SessionKind::Mode(wanted)) == Acquired::Referenced {
            return Ok(Completion::Done);
        }

        if self.mode >= wanted {
            return Ok(Completion::Done);
        }

        self.next_request_id += 1;
        let id = self.next_request_id;
        self.pending.push(PendingAuthorization {
            id,
            client,
            reply_to,
            mode: wanted,
        });

        info!(
            "Asking agent to confirm '{}' mode on {} for {}",
            wanted, self.path, client
        );
        ctx.emit(Signal::AgentRequest {
            agent,
            request_id: id,
            adapter: self.index,
            mode: wanted,
        });
        Ok(Completion::Deferred)
    }

    /// The agent answered authorization request `request_id`.
    pub fn authorization_result(
        &mut self,
        ctx: &mut Ctx<'_>,
        from: ClientId,
        request_id: u64,
        accepted: bool,
    ) -> Result<()> {
        match &self.agent {
            Some(agent) if agent.client == from => {}
            Some(_) => return Err(Error::NotAuthorized),
            None => return Err(Error::DoesNotExist("agent".to_string())),
        }

        let pos = self
            .pending
            .iter()
            .position(|p| p.id == request_id)
            .ok_or_else(|| Error::DoesNotExist(format!("authorization request {}", request_id)))?;
        let auth = self.pending.remove(pos);

        if !accepted {
            info!("Agent refused '{}' mode for {}", auth.mode, auth.client);
            self.sessions.remove(auth.client, SessionKind::Mode(auth.mode));
            ctx.emit(Signal::DeferredReply {
                reply_to: auth.reply_to,
                result: Err(ErrorReply::from(Error::NotAuthorized)),
            });
            self.mode_session_removed(ctx);
            return Ok(());
        }

        if self
            .sessions
            .find(auth.client, SessionKind::Mode(auth.mode))
            .is_none()
        {
            debug!("Session of {} ended before authorization", auth.client);
            return Ok(());
        }

        let needed = self.granted_mode();
        let result = if needed > self.mode {
            self.set_mode(ctx, needed)
        } else {
            Ok(())
        };

        if result.is_err() {
            self.sessions.remove(auth.client, SessionKind::Mode(auth.mode));
        }
        ctx.emit(Signal::DeferredReply {
            reply_to: auth.reply_to,
            result: result.map_err(ErrorReply::from),
        });
        Ok(())
    }

    pub fn release_session(&mut self, ctx: &mut Ctx<'_>, client: ClientId) -> Result<()> {
        let kind = SessionKind::Mode(Mode::Off);
        if self.sessions.find(client, kind).is_none() {
            return Err(Error::DoesNotExist("mode session".to_string()));
        }

        if self.sessions.release(client, kind).is_some() {
            self.mode_session_removed(ctx);
        }
        Ok(())
    }

    /// Mode required by the sessions the agent has already approved.
    fn granted_mode(&self) -> Mode {
        let provisional: Vec<ClientId> = self.pending.iter().map(|p| p.client).collect();
        self.sessions.needed_mode(self.global_mode, &provisional)
    }

    /// Step down once no approved session needs the current mode.
    fn mode_session_removed(&mut self, ctx: &mut Ctx<'_>) {
        let needed = self.granted_mode();
        if needed >= self.mode {
            return;
        }

        debug!("Switching to '{}' mode", needed);
        if let Err(e) = self.set_mode(ctx, needed) {
            error!("Unable to switch {} to '{}': {}", self.path, needed, e);
        }
    }

    fn fail_pending(&mut self, ctx: &Ctx<'_>, err: impl Fn() -> Error) {
        for auth in std::mem::take(&mut self.pending) {
            self.sessions.remove(auth.client, SessionKind::Mode(auth.mode));
            ctx.emit(Signal::DeferredReply {
                reply_to: auth.reply_to,
                result: Err(ErrorReply::from(err())),
            });
        }
    }

    /// Drop everything `client` holds on this adapter. Safe to repeat.
    pub fn client_disconnected(&mut self, ctx: &mut Ctx<'_>, client: ClientId) {
        self.pending.retain(|p| p.client != client);

        if self
            .sessions
            .remove(client, SessionKind::Mode(Mode::Off))
            .is_some()
        {
            self.mode_session_removed(ctx);
        }

        if self.sessions.remove(client, SessionKind::Discovery).is_some()
            && !self.sessions.has_discovery_sessions()
        {
            self.discovery_sessions_ended(ctx);
        }

        if self.agent.as_ref().is_some_and(|a| a.client == client) {
            info!("Agent of {} exited", self.path);
            self.agent = None;
            self.fail_pending(ctx, || Error::NotAuthorized);
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    pub fn start_discovery(&mut self, ctx: &mut Ctx<'_>, client: ClientId) -> Result<()> {
        if !self.up {
            return Err(Error::NotReady);
        }

        if self.sessions.find(client, SessionKind::Discovery).is_none()
            && !self.sessions.has_discovery_sessions()
        {
            self.start_inquiry_round(ctx)?;
        }

        self.sessions.acquire(client, SessionKind::Discovery);
        Ok(())
    }

    pub fn stop_discovery(&mut self, ctx: &mut Ctx<'_>, client: ClientId) -> Result<()> {
        if !self.up {
            return Err(Error::NotReady);
        }

        if self.sessions.find(client, SessionKind::Discovery).is_none() {
            return Err(Error::NotInProgress("discovery session".to_string()));
        }

        if self
            .sessions
            .release(client, SessionKind::Discovery)
            .is_some()
            && !self.sessions.has_discovery_sessions()
        {
            self.discovery_sessions_ended(ctx);
        }
        Ok(())
    }

    fn start_inquiry_round(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        ctx.timers.cancel(&mut self.scheduler_timer);
        self.cancel_name_request(ctx);

        let mut next = self.state;
        next.resolving_names = false;
        match ctx.config.inquiry {
            InquiryStrategy::Standard { .. } => {
                ctx.ops
                    .start_inquiry(self.index, GIAC_LAP, ctx.config.inquiry_length)?;
                next.std_inquiry = true;
            }
            InquiryStrategy::Periodic {
                min_period,
                max_period,
            } => {
                ctx.ops.start_periodic_inquiry(
                    self.index,
                    GIAC_LAP,
                    min_period,
                    max_period,
                    ctx.config.inquiry_length,
                )?;
                next.periodic_inquiry = true;
            }
        }

        self.set_state(ctx, next);
        Ok(())
    }

    fn discovery_sessions_ended(&mut self, ctx: &mut Ctx<'_>) {
        debug!("Stopping discovery on {}", self.path);

        self.cancel_name_request(ctx);
        self.found.clear();

        if self.state.std_inquiry {
            if let Err(e) = ctx.ops.cancel_inquiry(self.index) {
                warn!("Unable to cancel inquiry on {}: {}", self.path, e);
            }
        } else if self.scheduler_timer.is_some() {
            ctx.timers.cancel(&mut self.scheduler_timer);
        } else if matches!(ctx.config.inquiry, InquiryStrategy::Periodic { .. }) {
            if let Err(e) = ctx.ops.exit_periodic_inquiry(self.index) {
                debug!("Exit periodic inquiry on {}: {}", self.path, e);
            }
        }

        self.set_state(ctx, DiscoveryState::default());
    }

    fn set_state(&mut self, ctx: &mut Ctx<'_>, next: DiscoveryState) {
        if self.state == next {
            return;
        }

        let was_active = self.state.is_active();
        let active = next.is_active();

        if was_active && !active {
            if let InquiryStrategy::Standard {
                reinquiry_interval_secs,
            } = ctx.config.inquiry
            {
                if reinquiry_interval_secs != 0
                    && self.sessions.has_discovery_sessions()
                    && self.scheduler_timer.is_none()
                {
                    self.scheduler_timer = Some(ctx.timers.schedule(
                        Duration::from_secs(reinquiry_interval_secs as u64),
                        TimerKind::Reinquiry(self.index),
                    ));
                }
            }
            self.update_oor_devices(ctx);
        }

        if was_active != active {
            self.emit_property(ctx, "Discovering", PropertyValue::Bool(active));
        }
        self.state = next;
    }

    /// Report devices missing since the previous pass and remember the
    /// current set for the next one.
    fn update_oor_devices(&mut self, ctx: &Ctx<'_>) {
        for address in std::mem::take(&mut self.oor) {
            ctx.emit(Signal::DeviceDisappeared {
                adapter: self.index,
                address: address.clone(),
            });
            if let Ok(addr) = address.parse::<BdAddr>() {
                self.found.remove(&addr);
            }
        }

        self.oor = self.found.iter().map(|d| d.address.to_string()).collect();
    }

    /// The radio reported that inquiry is running.
    pub fn inquiry_started(&mut self, ctx: &mut Ctx<'_>) {
        let mut next = self.state;
        match ctx.config.inquiry {
            InquiryStrategy::Standard { .. } => next.std_inquiry = true,
            InquiryStrategy::Periodic { .. } => next.periodic_inquiry = true,
        }
        self.set_state(ctx, next);
    }

    /// An inquiry round finished.
    pub fn inquiry_complete(&mut self, ctx: &mut Ctx<'_>) {
        let mut next = self.state;
        next.std_inquiry = false;
        next.periodic_inquiry = false;

        if self.sessions.has_discovery_sessions() && !self.state.resolving_names {
            next.resolving_names = self.resolve_next_name(ctx);
        }
        self.set_state(ctx, next);
    }

    pub fn reinquiry_due(&mut self, ctx: &mut Ctx<'_>) {
        self.scheduler_timer = None;
        if !self.up || !self.sessions.has_discovery_sessions() {
            return;
        }
        if let Err(e) = self.start_inquiry_round(ctx) {
            error!("Unable to restart inquiry on {}: {}", self.path, e);
        }
    }

    pub fn device_found(
        &mut self,
        ctx: &mut Ctx<'_>,
        address: BdAddr,
        class: u32,
        rssi: i8,
        name: Option<String>,
    ) {
        // There is no event for the start of a periodic inquiry window.
        if !self.state.is_active() {
            let mut next = self.state;
            next.periodic_inquiry = true;
            self.set_state(ctx, next);
        }

        let mut name_status = if self.sessions.has_discovery_sessions() {
            NameStatus::Any
        } else {
            NameStatus::NotRequired
        };

        let alias = ctx
            .store
            .read(&self.address, &keys::remote(keys::ALIAS, &address));
        let name = match name {
            Some(name) => {
                if let Err(e) = ctx.store.write(
                    &self.address,
                    &keys::remote(keys::REMOTE_NAME, &address),
                    &name,
                ) {
                    warn!("Unable to store name of {}: {}", address, e);
                }
                name_status = NameStatus::NotRequired;
                Some(name)
            }
            None => ctx
                .store
                .read(&self.address, &keys::remote(keys::REMOTE_NAME, &address)),
        };

        self.found.upsert(Sighting {
            address,
            rssi,
            class,
            alias,
            name,
            name_status,
        });

        let seen = address.to_string();
        self.oor.retain(|a| *a != seen);

        if let Some(dev) = self.found.get(&address) {
            ctx.emit(Signal::DeviceFound {
                adapter: self.index,
                address,
                properties: dev.properties(),
            });
        }
    }

    fn resolve_next_name(&mut self, ctx: &mut Ctx<'_>) -> bool {
        while let Some(address) = self.found.next_unresolved() {
            match ctx.ops.resolve_name(self.index, address) {
                Ok(()) => {
                    if let Some(dev) = self.found.get_mut(&address) {
                        dev.name_status = NameStatus::Requested;
                    }
                    return true;
                }
                Err(e) => {
                    debug!("Name request for {} failed: {}", address, e);
                    self.found.name_resolved(&address);
                }
            }
        }
        false
    }

    fn cancel_name_request(&mut self, ctx: &mut Ctx<'_>) {
        let Some(address) = self.found.pending_request() else {
            return;
        };
        if let Err(e) = ctx.ops.cancel_resolve_name(self.index, address) {
            debug!("Cancel name request for {}: {}", address, e);
        }
        if let Some(dev) = self.found.get_mut(&address) {
            dev.name_status = NameStatus::Any;
        }
    }

    pub fn remote_name(
        &mut self,
        ctx: &mut Ctx<'_>,
        address: BdAddr,
        status: u8,
        name: Option<String>,
    ) {
        if let (0, Some(name)) = (status, name) {
            if let Err(e) = ctx.store.write(
                &self.address,
                &keys::remote(keys::REMOTE_NAME, &address),
                &name,
            ) {
                warn!("Unable to store name of {}: {}", address, e);
            }
            if let Some(dev) = self.found.get_mut(&address) {
                dev.name = Some(name);
                ctx.emit(Signal::DeviceFound {
                    adapter: self.index,
                    address,
                    properties: dev.properties(),
                });
            }
        }

        self.found.name_resolved(&address);
        if !self.state.resolving_names || self.resolve_next_name(ctx) {
            return;
        }

        let mut next = self.state;
        next.resolving_names = false;
        self.set_state(ctx, next);
    }

    // ------------------------------------------------------------------
    // Devices, agent, connections, class
    // ------------------------------------------------------------------

    pub fn create_device(&mut self, ctx: &mut Ctx<'_>, address: BdAddr) -> Result<String> {
        if self.address.is_any() {
            return Err(Error::NotReady);
        }
        if self.devices.iter().any(|d| d.address == address) {
            return Err(Error::AlreadyExists(address.to_string()));
        }

        let device = RemoteDevice::new(&self.path, address, false);
        if let Err(e) = ctx
            .store
            .write(&self.address, &keys::remote(keys::PROFILES, &address), "")
        {
            warn!("Unable to store device {}: {}", address, e);
        }

        let path = device.path.clone();
        self.devices.push(device);
        ctx.emit(Signal::DeviceCreated {
            adapter: self.index,
            path: path.clone(),
        });
        Ok(path)
    }

    pub fn remove_device(&mut self, ctx: &mut Ctx<'_>, path: &str) -> Result<()> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.path == path && !d.temporary)
            .ok_or_else(|| Error::DoesNotExist(path.to_string()))?;
        let device = self.devices.remove(pos);

        for prefix in [keys::TRUSTED, keys::PROFILES, keys::LINK_KEY] {
            if let Err(e) = ctx
                .store
                .delete(&self.address, &keys::remote(prefix, &device.address))
            {
                warn!("Unable to delete stored {}{}: {}", prefix, device.address, e);
            }
        }

        self.connections.remove(&device.address);
        ctx.emit(Signal::DeviceRemoved {
            adapter: self.index,
            path: device.path,
        });
        Ok(())
    }

    pub fn find_device(&self, address: BdAddr) -> Result<String> {
        self.devices
            .iter()
            .find(|d| d.address == address)
            .map(|d| d.path.clone())
            .ok_or_else(|| Error::DoesNotExist(address.to_string()))
    }

    pub fn list_devices(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.path.clone()).collect()
    }

    pub fn register_agent(&mut self, client: ClientId, path: &str, capability: &str) -> Result<()> {
        if self.agent.is_some() {
            return Err(Error::AlreadyExists("agent".to_string()));
        }

        let capability: IoCapability = capability.parse()?;
        info!("Agent {} ({:?}) registered on {}", path, capability, self.path);
        self.agent = Some(Agent {
            client,
            path: path.to_string(),
            capability,
        });
        Ok(())
    }

    pub fn unregister_agent(&mut self, ctx: &mut Ctx<'_>, client: ClientId, path: &str) -> Result<()> {
        match &self.agent {
            Some(agent) if agent.client == client && agent.path == path => {}
            _ => return Err(Error::DoesNotExist("agent".to_string())),
        }

        self.agent = None;
        self.fail_pending(ctx, || Error::NotAuthorized);
        Ok(())
    }

    pub fn connected(&mut self, ctx: &mut Ctx<'_>, address: BdAddr) {
        if !self.connections.insert(address) {
            error!("Connection to {} already tracked", address);
            return;
        }

        if !self.devices.iter().any(|d| d.address == address) {
            let device = RemoteDevice::new(&self.path, address, true);
            ctx.emit(Signal::DeviceCreated {
                adapter: self.index,
                path: device.path.clone(),
            });
            self.devices.push(device);
        }
    }

    pub fn disconnected(&mut self, ctx: &mut Ctx<'_>, address: BdAddr) {
        if !self.connections.remove(&address) {
            error!("No matching connection for {}", address);
            return;
        }

        if let Some(pos) = self
            .devices
            .iter()
            .position(|d| d.address == address && d.temporary)
        {
            let device = self.devices.remove(pos);
            debug!("Removing temporary device {}", device.path);
            ctx.emit(Signal::DeviceRemoved {
                adapter: self.index,
                path: device.path,
            });
        }
    }

    pub fn class_changed(&mut self, ctx: &mut Ctx<'_>, class: [u8; 3]) {
        if class == self.class {
            return;
        }

        self.class = class;
        let value = class_to_u32(class);
        if let Err(e) = ctx
            .store
            .write(&self.address, keys::CLASS, &format!("0x{:06x}", value))
        {
            warn!("Unable to store class for {}: {}", self.path, e);
        }
        self.emit_property(ctx, "Class", PropertyValue::U32(value));
    }

    /// Set the major service class byte. Cached until the adapter has been
    /// initialised.
    pub fn update_service_class(&mut self, ctx: &mut Ctx<'_>, svc: u8) -> Result<()> {
        if !self.initialized {
            self.svc_cache = Some(svc);
            return Ok(());
        }

        let mut class = self.class;
        class[2] = svc;
        if class == self.class {
            return Ok(());
        }

        ctx.ops.set_dev_class(self.index, class)?;
        self.class_changed(ctx, class);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::{property_values, Harness, OpCall};
    use nix::libc;

    fn peer(last: u8) -> BdAddr {
        BdAddr([last, 0x44, 0x33, 0x22, 0x11, 0x00])
    }

    fn up_adapter(h: &mut Harness) -> Adapter {
        let mut adapter = h.adapter(0);
        adapter.start(&mut h.ctx()).unwrap();
        h.ops.calls.clear();
        h.signals();
        adapter
    }

    fn scan_writes(h: &Harness) -> Vec<ScanMode> {
        h.ops
            .calls
            .iter()
            .filter_map(|c| match c {
                OpCall::WriteScanEnable(_, scan) => Some(*scan),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_comes_up_connectable() {
        let mut h = Harness::new();
        let mut adapter = h.adapter(0);
        adapter.start(&mut h.ctx()).unwrap();

        assert!(adapter.is_up());
        assert_eq!(adapter.mode(), Mode::Connectable);
        assert_eq!(adapter.scan_mode(), ScanMode::PAGE);
        assert_eq!(scan_writes(&h), vec![ScanMode::PAGE]);

        let signals = h.signals();
        assert_eq!(
            property_values(&signals, "Powered"),
            vec![PropertyValue::Bool(true)]
        );

        // A second power event changes nothing.
        adapter.start(&mut h.ctx()).unwrap();
        assert!(property_values(&h.signals(), "Powered").is_empty());
    }

    #[test]
    fn test_first_start_configured_off_stays_down() {
        let mut h = Harness::new();
        h.config.default_mode = Mode::Off;
        let mut adapter = h.adapter(0);
        adapter.start(&mut h.ctx()).unwrap();

        assert!(!adapter.is_up());
        assert_eq!(adapter.mode(), Mode::Off);
        assert!(h.ops.calls.contains(&OpCall::SetPowered(0, false)));
        assert!(property_values(&h.signals(), "Powered").is_empty());
    }

    #[test]
    fn test_scan_mode_follows_mode_after_every_step() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        for target in [
            Mode::Discoverable,
            Mode::LimitedDiscoverable,
            Mode::Connectable,
            Mode::LimitedDiscoverable,
            Mode::Off,
            Mode::Connectable,
            Mode::Discoverable,
        ] {
            adapter.set_mode(&mut h.ctx(), target).unwrap();
            assert_eq!(adapter.mode(), target);
            assert_eq!(adapter.scan_mode(), target.scan_mode());
        }
    }

    #[test]
    fn test_failed_write_commits_nothing() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        h.ops.fail("write_scan_enable", libc::EIO);

        let err = adapter
            .set_mode(&mut h.ctx(), Mode::Discoverable)
            .unwrap_err();
        assert_eq!(err.errno(), -libc::EIO);
        assert_eq!(adapter.mode(), Mode::Connectable);
        assert_eq!(adapter.scan_mode(), ScanMode::PAGE);
        assert_eq!(
            h.store.read(&adapter.address(), keys::MODE),
            None,
            "mode must not be persisted on failure"
        );
        assert!(property_values(&h.signals(), "Discoverable").is_empty());
    }

    #[test]
    fn test_power_on_when_already_on_is_success() {
        let mut h = Harness::new();
        let mut adapter = h.adapter(0);
        h.ops.fail("set_powered", libc::EALREADY);

        adapter.set_mode(&mut h.ctx(), Mode::Connectable).unwrap();
        assert!(adapter.is_up());
        assert_eq!(adapter.scan_mode(), ScanMode::PAGE);
    }

    #[test]
    fn test_power_off_marks_request_and_stops() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        adapter.set_powered(&mut h.ctx(), false).unwrap();
        assert!(!adapter.is_up());
        assert!(adapter.off_requested());
        assert_eq!(adapter.mode(), Mode::Off);
        assert_eq!(
            h.ops.calls,
            vec![
                OpCall::WriteScanEnable(0, ScanMode::DISABLED),
                OpCall::SetPowered(0, false)
            ]
        );
        assert_eq!(
            property_values(&h.signals(), "Powered"),
            vec![PropertyValue::Bool(false)]
        );
        assert_eq!(h.store.read(&adapter.address(), keys::MODE).as_deref(), Some("off"));
    }

    #[test]
    fn test_discoverable_timeout_drops_only_inquiry_scan() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        adapter.set_mode(&mut h.ctx(), Mode::Discoverable).unwrap();
        assert!(adapter.discoverable_timer_pending());
        assert_eq!(h.timers.len(), 1);

        adapter.discoverable_timeout(&mut h.ctx());
        assert_eq!(adapter.scan_mode(), ScanMode::PAGE);
        assert_eq!(adapter.mode(), Mode::Connectable);
        assert_eq!(scan_writes(&h).last(), Some(&ScanMode::PAGE));
        assert_eq!(
            property_values(&h.signals(), "Discoverable"),
            vec![PropertyValue::Bool(true), PropertyValue::Bool(false)]
        );
    }

    #[test]
    fn test_limited_toggle_within_discoverable() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        adapter.set_mode(&mut h.ctx(), Mode::Discoverable).unwrap();
        h.ops.calls.clear();

        adapter
            .set_mode(&mut h.ctx(), Mode::LimitedDiscoverable)
            .unwrap();
        assert_eq!(h.ops.calls, vec![OpCall::SetLimited(0, true)]);

        h.ops.calls.clear();
        h.ops.fail("set_limited_discoverable", libc::ENOSYS);
        adapter.set_mode(&mut h.ctx(), Mode::Discoverable).unwrap();
        assert_eq!(adapter.mode(), Mode::Discoverable);
    }

    #[test]
    fn test_reported_inquiry_scan_is_plain_discoverable() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        assert!(adapter.pairable());

        adapter.scan_mode_changed(&mut h.ctx(), ScanMode::PAGE_INQUIRY);
        assert_eq!(adapter.mode(), Mode::Discoverable);
        assert_eq!(adapter.scan_mode(), ScanMode::PAGE_INQUIRY);
        assert_eq!(h.ops.calls, vec![OpCall::SetLimited(0, true)]);
    }

    #[test]
    fn test_discoverable_property_honours_pairable() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        adapter
            .set_property(&mut h.ctx(), "Discoverable", PropertyValue::Bool(true))
            .unwrap();
        assert_eq!(adapter.mode(), Mode::LimitedDiscoverable);

        adapter
            .set_property(&mut h.ctx(), "Pairable", PropertyValue::Bool(false))
            .unwrap();
        assert_eq!(adapter.mode(), Mode::Discoverable);
        assert!(!adapter.pairable());

        assert!(matches!(
            adapter.set_property(&mut h.ctx(), "Pairable", PropertyValue::U32(1)),
            Err(Error::InvalidArguments(_))
        ));
        assert!(matches!(
            adapter.set_property(&mut h.ctx(), "Address", PropertyValue::Str("x".into())),
            Err(Error::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_pairable_requires_scan() {
        let mut h = Harness::new();
        let mut adapter = h.adapter(0);
        assert!(matches!(
            adapter.set_pairable(&mut h.ctx(), false),
            Err(Error::NotReady)
        ));
    }

    #[test]
    fn test_timeouts_are_persisted_and_signalled() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        adapter
            .set_property(&mut h.ctx(), "DiscoverableTimeout", PropertyValue::U32(0))
            .unwrap();
        adapter
            .set_property(&mut h.ctx(), "PairableTimeout", PropertyValue::U32(30))
            .unwrap();

        assert_eq!(
            h.store.read_u32(&adapter.address(), keys::DISCOVERABLE_TIMEOUT),
            Some(0)
        );
        assert_eq!(h.timers.len(), 1, "pairable timer armed");

        let signals = h.signals();
        assert_eq!(
            property_values(&signals, "PairableTimeout"),
            vec![PropertyValue::U32(30)]
        );

        adapter.pairable_timeout(&mut h.ctx());
        assert!(!adapter.pairable());
    }

    #[test]
    fn test_name_change() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        adapter.set_name(&mut h.ctx(), "workbench").unwrap();
        assert!(h
            .ops
            .calls
            .contains(&OpCall::SetLocalName(0, "workbench".to_string())));
        assert_eq!(
            adapter.get_properties().unwrap().get("Name"),
            Some(&PropertyValue::Str("workbench".to_string()))
        );

        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(adapter.set_name(&mut h.ctx(), &long).is_err());
    }

    #[test]
    fn test_session_without_agent_fails() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        let reply_to = ReplyTo {
            client: ClientId(1),
            serial: 1,
        };

        assert!(matches!(
            adapter.request_session(&mut h.ctx(), ClientId(1), None, reply_to),
            Err(Error::DoesNotExist(_))
        ));
    }

    #[test]
    fn test_session_arbitration() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        let agent = ClientId(9);
        let a = ClientId(1);
        let b = ClientId(2);
        adapter.register_agent(agent, "/agent", "").unwrap();

        let done = adapter
            .request_session(
                &mut h.ctx(),
                a,
                Some(Mode::Connectable),
                ReplyTo { client: a, serial: 1 },
            )
            .unwrap();
        assert_eq!(done, Completion::Done);

        let deferred = adapter
            .request_session(
                &mut h.ctx(),
                b,
                Some(Mode::Discoverable),
                ReplyTo { client: b, serial: 7 },
            )
            .unwrap();
        assert_eq!(deferred, Completion::Deferred);
        assert_eq!(adapter.mode(), Mode::Connectable, "waits for the agent");

        let request_id = h
            .signals()
            .into_iter()
            .find_map(|s| match s {
                Signal::AgentRequest {
                    agent: to,
                    request_id,
                    mode,
                    ..
                } => {
                    assert_eq!(to, agent);
                    assert_eq!(mode, Mode::Discoverable);
                    Some(request_id)
                }
                _ => None,
            })
            .unwrap();

        adapter
            .authorization_result(&mut h.ctx(), agent, request_id, true)
            .unwrap();
        assert_eq!(adapter.mode(), Mode::Discoverable);
        assert!(h.signals().contains(&Signal::DeferredReply {
            reply_to: ReplyTo { client: b, serial: 7 },
            result: Ok(()),
        }));

        h.ops.calls.clear();
        adapter.release_session(&mut h.ctx(), b).unwrap();
        assert_eq!(adapter.mode(), Mode::Connectable);
        assert_eq!(scan_writes(&h), vec![ScanMode::PAGE]);

        assert!(matches!(
            adapter.release_session(&mut h.ctx(), b),
            Err(Error::DoesNotExist(_))
        ));
    }

    #[test]
    fn test_refused_authorization_changes_nothing() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        let agent = ClientId(9);
        adapter.register_agent(agent, "/agent", "DisplayOnly").unwrap();

        let reply_to = ReplyTo {
            client: ClientId(3),
            serial: 4,
        };
        adapter
            .request_session(&mut h.ctx(), ClientId(3), Some(Mode::Discoverable), reply_to)
            .unwrap();
        h.signals();

        // Only the agent may answer.
        assert!(matches!(
            adapter.authorization_result(&mut h.ctx(), ClientId(3), 1, true),
            Err(Error::NotAuthorized)
        ));

        adapter
            .authorization_result(&mut h.ctx(), agent, 1, false)
            .unwrap();
        assert!(h.ops.calls.is_empty());
        assert_eq!(adapter.mode(), Mode::Connectable);
        assert_eq!(adapter.sessions().len(), 0);

        let signals = h.signals();
        assert!(matches!(
            &signals[..],
            [Signal::DeferredReply { reply_to: r, result: Err(e) }]
                if *r == reply_to && e.name == "NotAuthorized"
        ));
    }

    #[test]
    fn test_release_never_raises_past_pending_authorization() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        let agent = ClientId(9);
        let a = ClientId(1);
        let b = ClientId(2);
        adapter.register_agent(agent, "/agent", "").unwrap();

        adapter
            .request_session(
                &mut h.ctx(),
                a,
                Some(Mode::Connectable),
                ReplyTo { client: a, serial: 1 },
            )
            .unwrap();
        let deferred = adapter
            .request_session(
                &mut h.ctx(),
                b,
                Some(Mode::Discoverable),
                ReplyTo { client: b, serial: 2 },
            )
            .unwrap();
        assert_eq!(deferred, Completion::Deferred);
        let request_id = h
            .signals()
            .into_iter()
            .find_map(|s| match s {
                Signal::AgentRequest { request_id, .. } => Some(request_id),
                _ => None,
            })
            .unwrap();

        adapter.release_session(&mut h.ctx(), a).unwrap();
        assert_eq!(adapter.mode(), Mode::Connectable);
        assert!(h.ops.calls.is_empty());

        adapter
            .authorization_result(&mut h.ctx(), agent, request_id, false)
            .unwrap();
        assert_eq!(adapter.mode(), Mode::Connectable);
        assert_eq!(adapter.scan_mode(), ScanMode::PAGE);
        assert_eq!(adapter.sessions().len(), 0);
        assert!(h.ops.calls.is_empty());
    }

    #[test]
    fn test_discovery_refcount() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        let client = ClientId(5);

        for _ in 0..3 {
            adapter.start_discovery(&mut h.ctx(), client).unwrap();
        }
        let starts = h
            .ops
            .calls
            .iter()
            .filter(|c| matches!(c, OpCall::StartInquiry(..)))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(adapter.sessions().len(), 1);
        assert!(adapter.state().std_inquiry);

        adapter.device_found(&mut h.ctx(), peer(1), 0x5a020c, -40, None);

        adapter.stop_discovery(&mut h.ctx(), client).unwrap();
        adapter.stop_discovery(&mut h.ctx(), client).unwrap();
        assert_eq!(adapter.found().len(), 1);
        assert!(!h.ops.calls.contains(&OpCall::CancelInquiry(0)));

        adapter.stop_discovery(&mut h.ctx(), client).unwrap();
        assert!(adapter.found().is_empty());
        assert!(h.ops.calls.contains(&OpCall::CancelInquiry(0)));
        assert!(!adapter.state().is_active());

        assert!(matches!(
            adapter.stop_discovery(&mut h.ctx(), client),
            Err(Error::NotInProgress(_))
        ));
    }

    #[test]
    fn test_discovery_needs_powered_adapter() {
        let mut h = Harness::new();
        let mut adapter = h.adapter(0);
        assert!(matches!(
            adapter.start_discovery(&mut h.ctx(), ClientId(1)),
            Err(Error::NotReady)
        ));
    }

    #[test]
    fn test_out_of_range_devices_disappear() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        adapter.start_discovery(&mut h.ctx(), ClientId(1)).unwrap();

        adapter.device_found(&mut h.ctx(), peer(1), 0, -40, Some("one".into()));
        adapter.device_found(&mut h.ctx(), peer(2), 0, -60, Some("two".into()));
        assert!(adapter.out_of_range().is_empty());

        adapter.inquiry_complete(&mut h.ctx());
        assert_eq!(
            adapter.out_of_range(),
            &[peer(1).to_string(), peer(2).to_string()]
        );

        adapter.inquiry_started(&mut h.ctx());
        adapter.device_found(&mut h.ctx(), peer(1), 0, -45, None);
        assert_eq!(adapter.out_of_range(), &[peer(2).to_string()]);
        h.signals();

        adapter.inquiry_complete(&mut h.ctx());
        let signals = h.signals();
        assert!(signals.contains(&Signal::DeviceDisappeared {
            adapter: 0,
            address: "00:11:22:33:44:02".to_string(),
        }));
        assert!(adapter.found().get(&peer(2)).is_none());
        assert!(adapter.found().get(&peer(1)).is_some());
    }

    #[test]
    fn test_names_resolved_one_at_a_time() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        adapter.start_discovery(&mut h.ctx(), ClientId(1)).unwrap();

        adapter.device_found(&mut h.ctx(), peer(1), 0, -70, None);
        adapter.device_found(&mut h.ctx(), peer(2), 0, -30, None);
        h.ops.calls.clear();

        adapter.inquiry_complete(&mut h.ctx());
        assert_eq!(h.ops.calls, vec![OpCall::ResolveName(0, peer(2))]);
        assert!(adapter.state().resolving_names);
        assert_eq!(
            adapter.found().get(&peer(2)).unwrap().name_status,
            NameStatus::Requested
        );

        h.signals();
        adapter.remote_name(&mut h.ctx(), peer(2), 0, Some("Headset".into()));
        let signals = h.signals();
        assert!(signals.iter().any(|s| matches!(
            s,
            Signal::DeviceFound { properties, .. }
                if properties.get("Name") == Some(&PropertyValue::Str("Headset".into()))
        )));
        assert_eq!(h.ops.calls.last(), Some(&OpCall::ResolveName(0, peer(1))));

        adapter.remote_name(&mut h.ctx(), peer(1), 0x04, None);
        assert!(!adapter.state().resolving_names);
        assert_eq!(
            h.store.read(&adapter.address(), &keys::remote(keys::REMOTE_NAME, &peer(2))).as_deref(),
            Some("Headset")
        );
    }

    #[test]
    fn test_unsupported_name_requests_are_skipped() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        adapter.start_discovery(&mut h.ctx(), ClientId(1)).unwrap();
        adapter.device_found(&mut h.ctx(), peer(1), 0, -70, None);
        h.ops.fail("resolve_name", libc::ENOSYS);

        adapter.inquiry_complete(&mut h.ctx());
        assert!(!adapter.state().resolving_names);
        assert_eq!(
            adapter.found().get(&peer(1)).unwrap().name_status,
            NameStatus::NotRequired
        );
    }

    #[test]
    fn test_sighting_without_inquiry_marks_periodic_window() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        adapter.device_found(&mut h.ctx(), peer(1), 0, -50, None);
        assert!(adapter.state().periodic_inquiry);
        assert_eq!(
            adapter.found().get(&peer(1)).unwrap().name_status,
            NameStatus::NotRequired
        );
        assert_eq!(
            property_values(&h.signals(), "Discovering"),
            vec![PropertyValue::Bool(true)]
        );
    }

    #[test]
    fn test_reinquiry_timer_restarts_rounds() {
        let mut h = Harness::new();
        h.config.inquiry = InquiryStrategy::Standard {
            reinquiry_interval_secs: 5,
        };
        let mut adapter = up_adapter(&mut h);
        adapter.start_discovery(&mut h.ctx(), ClientId(1)).unwrap();

        adapter.inquiry_complete(&mut h.ctx());
        assert_eq!(h.timers.len(), 1);

        adapter.reinquiry_due(&mut h.ctx());
        let starts = h
            .ops
            .calls
            .iter()
            .filter(|c| matches!(c, OpCall::StartInquiry(..)))
            .count();
        assert_eq!(starts, 2);
        assert!(adapter.state().std_inquiry);
    }

    #[test]
    fn test_periodic_strategy() {
        let mut h = Harness::new();
        h.config.inquiry = InquiryStrategy::Periodic {
            min_period: 16,
            max_period: 24,
        };
        let mut adapter = up_adapter(&mut h);
        adapter.start_discovery(&mut h.ctx(), ClientId(1)).unwrap();
        assert_eq!(
            h.ops.calls,
            vec![OpCall::StartPeriodicInquiry(0, 16, 24, 8)]
        );

        adapter.inquiry_complete(&mut h.ctx());
        adapter.stop_discovery(&mut h.ctx(), ClientId(1)).unwrap();
        assert!(h.ops.calls.contains(&OpCall::ExitPeriodicInquiry(0)));
    }

    #[test]
    fn test_stop_clears_every_session() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        adapter.register_agent(ClientId(9), "/agent", "").unwrap();
        adapter.start_discovery(&mut h.ctx(), ClientId(1)).unwrap();
        adapter.device_found(&mut h.ctx(), peer(1), 0, -40, None);
        adapter
            .request_session(
                &mut h.ctx(),
                ClientId(2),
                Some(Mode::Discoverable),
                ReplyTo {
                    client: ClientId(2),
                    serial: 3,
                },
            )
            .unwrap();
        h.signals();

        adapter.stop(&mut h.ctx());
        assert_eq!(adapter.sessions().len(), 0);
        assert!(adapter.found().is_empty());
        assert_eq!(adapter.mode(), Mode::Off);

        let signals = h.signals();
        assert!(signals.iter().any(|s| matches!(
            s,
            Signal::DeferredReply { result: Err(e), .. } if e.name == "NotReady"
        )));
        assert_eq!(
            property_values(&signals, "Powered"),
            vec![PropertyValue::Bool(false)]
        );
    }

    #[test]
    fn test_client_disconnect_is_idempotent() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        let client = ClientId(4);
        adapter.start_discovery(&mut h.ctx(), client).unwrap();
        adapter.start_discovery(&mut h.ctx(), client).unwrap();

        adapter.client_disconnected(&mut h.ctx(), client);
        adapter.client_disconnected(&mut h.ctx(), client);

        assert_eq!(adapter.sessions().len(), 0);
        let cancels = h
            .ops
            .calls
            .iter()
            .filter(|c| matches!(c, OpCall::CancelInquiry(_)))
            .count();
        assert_eq!(cancels, 1);
    }

    #[test]
    fn test_agent_exit_fails_pending_requests() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);
        let agent = ClientId(9);
        adapter.register_agent(agent, "/agent", "").unwrap();
        assert!(matches!(
            adapter.register_agent(ClientId(10), "/other", ""),
            Err(Error::AlreadyExists(_))
        ));

        adapter
            .request_session(
                &mut h.ctx(),
                ClientId(1),
                Some(Mode::Discoverable),
                ReplyTo {
                    client: ClientId(1),
                    serial: 2,
                },
            )
            .unwrap();
        h.signals();

        adapter.client_disconnected(&mut h.ctx(), agent);
        assert!(adapter.agent().is_none());
        assert!(h.signals().iter().any(|s| matches!(
            s,
            Signal::DeferredReply { result: Err(e), .. } if e.name == "NotAuthorized"
        )));
    }

    #[test]
    fn test_unregister_agent_must_match() {
        let mut h = Harness::new();
        let mut adapter = h.adapter(0);
        adapter.register_agent(ClientId(9), "/agent", "").unwrap();

        assert!(adapter
            .unregister_agent(&mut h.ctx(), ClientId(9), "/wrong")
            .is_err());
        assert!(adapter
            .unregister_agent(&mut h.ctx(), ClientId(8), "/agent")
            .is_err());
        adapter
            .unregister_agent(&mut h.ctx(), ClientId(9), "/agent")
            .unwrap();
        assert!(adapter.agent().is_none());
    }

    #[test]
    fn test_device_objects() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        let path = adapter.create_device(&mut h.ctx(), peer(1)).unwrap();
        assert_eq!(path, "/btadapterd/hci0/dev_00_11_22_33_44_01");
        assert!(matches!(
            adapter.create_device(&mut h.ctx(), peer(1)),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(adapter.find_device(peer(1)).unwrap(), path);
        assert!(adapter.find_device(peer(2)).is_err());

        h.store
            .write(&adapter.address(), &keys::remote(keys::LINK_KEY, &peer(1)), "00")
            .unwrap();
        adapter.remove_device(&mut h.ctx(), &path).unwrap();
        assert!(adapter.list_devices().is_empty());
        assert!(h
            .store
            .read(&adapter.address(), &keys::remote(keys::LINK_KEY, &peer(1)))
            .is_none());
        assert!(matches!(
            adapter.remove_device(&mut h.ctx(), &path),
            Err(Error::DoesNotExist(_))
        ));

        let signals = h.signals();
        assert!(signals.contains(&Signal::DeviceCreated {
            adapter: 0,
            path: path.clone()
        }));
        assert!(signals.contains(&Signal::DeviceRemoved { adapter: 0, path }));
    }

    #[test]
    fn test_stored_devices_load_on_first_start() {
        let mut h = Harness::new();
        let controller = Harness::controller_address();
        h.store
            .write(&controller, &keys::remote(keys::LINK_KEY, &peer(7)), "00")
            .unwrap();
        h.store
            .write_bool(&controller, &keys::remote(keys::TRUSTED, &peer(7)), true)
            .unwrap();

        let adapter = up_adapter(&mut h);
        assert_eq!(
            adapter.list_devices(),
            vec!["/btadapterd/hci0/dev_00_11_22_33_44_07".to_string()]
        );
    }

    #[test]
    fn test_temporary_device_follows_connection() {
        let mut h = Harness::new();
        let mut adapter = up_adapter(&mut h);

        adapter.connected(&mut h.ctx(), peer(3));
        let devices = adapter.list_devices();
        assert_eq!(devices.len(), 1);
        assert!(matches!(
            adapter.remove_device(&mut h.ctx(), &devices[0]),
            Err(Error::DoesNotExist(_))
        ));

        adapter.disconnected(&mut h.ctx(), peer(3));
        assert!(adapter.list_devices().is_empty());
        assert!(adapter.connections().is_empty());

        // Unknown disconnect is logged and ignored.
        adapter.disconnected(&mut h.ctx(), peer(3));
    }

    #[test]
    fn test_service_class_cached_until_initialised() {
        let mut h = Harness::new();
        let mut adapter = h.adapter(0);

        adapter.update_service_class(&mut h.ctx(), 0x20).unwrap();
        assert!(h.ops.calls.is_empty());

        adapter.start(&mut h.ctx()).unwrap();
        assert!(h.ops.calls.contains(&OpCall::SetDevClass(0, [0x0c, 0x01, 0x20])));
        assert_eq!(adapter.class(), [0x0c, 0x01, 0x20]);
        assert_eq!(
            property_values(&h.signals(), "Class"),
            vec![PropertyValue::U32(0x20010c)]
        );
    }

    #[test]
    fn test_reconcile_target_uses_stored_mode() {
        let mut h = Harness::new();
        let adapter = h.adapter(0);
        assert_eq!(adapter.reconcile_target(&h.ctx()), (Mode::Connectable, true));

        h.store
            .write_mode(&Harness::controller_address(), Mode::Off)
            .unwrap();
        assert_eq!(adapter.reconcile_target(&h.ctx()).0, Mode::Off);
    }
}
