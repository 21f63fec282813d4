//! Test doubles for the adapter core.

use crate::domain::adapter::{Adapter, Ctx};
use crate::domain::error::{Error, Result};
use crate::domain::models::{BdAddr, PropertyValue, ScanMode, Signal};
use crate::domain::ops::ControllerOps;
use crate::domain::registry::ControllerInfo;
use crate::domain::settings::{DaemonSettings, InquiryStrategy};
use crate::domain::timer::TimerQueue;
use crate::infrastructure::storage::MemoryStore;
use nix::libc;
use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpCall {
    SetPowered(u16, bool),
    SetDiscoverable(u16, bool),
    SetPairable(u16, bool),
    WriteScanEnable(u16, ScanMode),
    SetLimited(u16, bool),
    SetDevClass(u16, [u8; 3]),
    SetLocalName(u16, String),
    StartInquiry(u16, u8),
    StartPeriodicInquiry(u16, u16, u16, u8),
    CancelInquiry(u16),
    ExitPeriodicInquiry(u16),
    ResolveName(u16, BdAddr),
    CancelResolveName(u16, BdAddr),
}

/// Records every call; individual operations can be made to fail.
#[derive(Debug, Default)]
pub struct FakeOps {
    pub calls: Vec<OpCall>,
    failures: BTreeMap<&'static str, i32>,
}

impl FakeOps {
    /// Make `op` fail with `errno`. `ENOSYS` fails as unsupported.
    pub fn fail(&mut self, op: &'static str, errno: i32) {
        self.failures.insert(op, errno);
    }

    fn record(&mut self, op: &'static str, call: OpCall) -> Result<()> {
        self.calls.push(call);
        match self.failures.get(op) {
            Some(&libc::ENOSYS) => Err(Error::Unsupported(op)),
            Some(&errno) => Err(Error::hardware(errno)),
            None => Ok(()),
        }
    }
}

impl ControllerOps for FakeOps {
    fn set_powered(&mut self, index: u16, powered: bool) -> Result<()> {
        self.record("set_powered", OpCall::SetPowered(index, powered))
    }

    fn set_discoverable(&mut self, index: u16, discoverable: bool) -> Result<()> {
        self.record("set_discoverable", OpCall::SetDiscoverable(index, discoverable))
    }

    fn set_pairable(&mut self, index: u16, pairable: bool) -> Result<()> {
        self.record("set_pairable", OpCall::SetPairable(index, pairable))
    }

    fn write_scan_enable(&mut self, index: u16, scan: ScanMode) -> Result<()> {
        self.record("write_scan_enable", OpCall::WriteScanEnable(index, scan))
    }

    fn set_limited_discoverable(
        &mut self,
        index: u16,
        _class: [u8; 3],
        limited: bool,
    ) -> Result<()> {
        self.record("set_limited_discoverable", OpCall::SetLimited(index, limited))
    }

    fn set_dev_class(&mut self, index: u16, class: [u8; 3]) -> Result<()> {
        self.record("set_dev_class", OpCall::SetDevClass(index, class))
    }

    fn set_local_name(&mut self, index: u16, name: &str) -> Result<()> {
        self.record("set_local_name", OpCall::SetLocalName(index, name.to_string()))
    }

    fn start_inquiry(&mut self, index: u16, _lap: [u8; 3], length: u8) -> Result<()> {
        self.record("start_inquiry", OpCall::StartInquiry(index, length))
    }

    fn start_periodic_inquiry(
        &mut self,
        index: u16,
        _lap: [u8; 3],
        min_period: u16,
        max_period: u16,
        length: u8,
    ) -> Result<()> {
        self.record(
            "start_periodic_inquiry",
            OpCall::StartPeriodicInquiry(index, min_period, max_period, length),
        )
    }

    fn cancel_inquiry(&mut self, index: u16) -> Result<()> {
        self.record("cancel_inquiry", OpCall::CancelInquiry(index))
    }

    fn exit_periodic_inquiry(&mut self, index: u16) -> Result<()> {
        self.record("exit_periodic_inquiry", OpCall::ExitPeriodicInquiry(index))
    }

    fn resolve_name(&mut self, index: u16, address: BdAddr) -> Result<()> {
        self.record("resolve_name", OpCall::ResolveName(index, address))
    }

    fn cancel_resolve_name(&mut self, index: u16, address: BdAddr) -> Result<()> {
        self.record("cancel_resolve_name", OpCall::CancelResolveName(index, address))
    }
}

/// Owns everything an adapter operation borrows through [`Ctx`].
pub struct Harness {
    pub ops: FakeOps,
    pub store: MemoryStore,
    pub timers: TimerQueue,
    pub config: DaemonSettings,
    tx: UnboundedSender<Signal>,
    rx: UnboundedReceiver<Signal>,
}

impl Harness {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = DaemonSettings {
            inquiry: InquiryStrategy::Standard {
                reinquiry_interval_secs: 0,
            },
            ..DaemonSettings::default()
        };
        Self {
            ops: FakeOps::default(),
            store: MemoryStore::new(),
            timers: TimerQueue::new(),
            config,
            tx,
            rx,
        }
    }

    pub fn controller_address() -> BdAddr {
        "00:1A:7D:DA:71:13".parse().unwrap()
    }

    pub fn ctx(&mut self) -> Ctx<'_> {
        Ctx {
            ops: &mut self.ops,
            store: &mut self.store,
            signals: &self.tx,
            timers: &mut self.timers,
            config: &self.config,
        }
    }

    pub fn adapter(&mut self, index: u16) -> Adapter {
        let info = ControllerInfo {
            valid: true,
            info_read: true,
            address: Self::controller_address(),
            class: [0x0c, 0x01, 0x00],
            ..ControllerInfo::default()
        };
        Adapter::new(index, &info, &self.ctx())
    }

    /// Drain every signal emitted so far.
    pub fn signals(&mut self) -> Vec<Signal> {
        let mut out = Vec::new();
        while let Ok(signal) = self.rx.try_recv() {
            out.push(signal);
        }
        out
    }
}

/// Values of every `PropertyChanged` for `name`, in emission order.
pub fn property_values(signals: &[Signal], name: &str) -> Vec<PropertyValue> {
    signals
        .iter()
        .filter_map(|s| match s {
            Signal::PropertyChanged {
                name: changed,
                value,
                ..
            } if changed == name => Some(value.clone()),
            _ => None,
        })
        .collect()
}
