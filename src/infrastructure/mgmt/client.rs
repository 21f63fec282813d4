//! Management Client
//!
//! Owns the controller registry and turns raw management frames into
//! [`MgmtNotification`]s for the service layer. Outgoing commands are
//! tracked per (opcode, index) until the kernel answers them.

use crate::domain::error::{Error, Result};
use crate::domain::models::{class_to_u32, BdAddr, ScanMode, INDEX_NONE};
use crate::domain::ops::ControllerOps;
use crate::domain::registry::{ControllerInfo, ControllerRegistry};
use crate::infrastructure::mgmt::codec::{self, opcode, CodecError, Command, Event};
use std::io;
use tracing::{debug, error, info, warn};

/// Where encoded frames go.
pub trait FrameSink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Lifecycle of an issued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Sent,
    CompleteOk,
    CompleteError(u8),
    StatusOnly(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCommand {
    opcode: u16,
    index: u16,
    state: CommandState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtNotification {
    /// A read-info reply populated the registry slot.
    ControllerReady(u16),
    ControllerRemoved(u16),
    PoweredChanged(u16, bool),
    ScanModeChanged(u16, ScanMode),
    PairableChanged(u16, bool),
    ClassChanged(u16, [u8; 3]),
    Connected(u16, BdAddr),
    Disconnected(u16, BdAddr),
    DeviceFound {
        index: u16,
        address: BdAddr,
        class: u32,
        rssi: i8,
        name: Option<String>,
    },
    RemoteName {
        index: u16,
        address: BdAddr,
        status: u8,
        name: Option<String>,
    },
    Discovering(u16, bool),
    CommandFailed {
        index: u16,
        opcode: u16,
        status: u8,
    },
}

pub struct MgmtClient {
    registry: ControllerRegistry,
    sink: Box<dyn FrameSink>,
    pending: Vec<PendingCommand>,
    version: Option<(u8, u16)>,
}

impl MgmtClient {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            registry: ControllerRegistry::new(),
            sink,
            pending: Vec::new(),
            version: None,
        }
    }

    /// Begin the startup handshake: version, then index list, then info
    /// for each controller.
    pub fn start(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            debug!("Dropping {} unanswered commands", self.pending.len());
            self.pending.clear();
        }
        self.send(INDEX_NONE, Command::ReadVersion)
    }

    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    pub fn controller(&self, index: u16) -> Option<&ControllerInfo> {
        self.registry.get(index)
    }

    pub fn version(&self) -> Option<(u8, u16)> {
        self.version
    }

    /// Number of commands still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn send(&mut self, index: u16, command: Command) -> Result<()> {
        let frame = command
            .encode(index)
            .map_err(|e| Error::InvalidArguments(e.to_string()))?;
        debug!("Sending opcode {:#06x} to index {:#06x}", command.opcode(), index);
        self.sink.send_frame(&frame)?;
        self.pending.push(PendingCommand {
            opcode: command.opcode(),
            index,
            state: CommandState::Sent,
        });
        Ok(())
    }

    fn send_to_controller(&mut self, index: u16, command: Command) -> Result<()> {
        self.registry.require(index)?;
        self.send(index, command)
    }

    fn resolve(&mut self, index: u16, opcode: u16, state: CommandState) {
        match self
            .pending
            .iter()
            .position(|p| p.opcode == opcode && p.index == index)
        {
            Some(pos) => {
                let cmd = self.pending.remove(pos);
                debug!(
                    "Opcode {:#06x} on index {:#06x}: {:?} -> {:?}",
                    cmd.opcode, cmd.index, cmd.state, state
                );
            }
            None => debug!(
                "Reply for opcode {:#06x} on index {:#06x} with nothing pending",
                opcode, index
            ),
        }
    }

    fn read_info(&mut self, index: u16) {
        if let Err(e) = self.send(index, Command::ReadInfo) {
            error!("Unable to read info of hci{}: {}", index, e);
        }
    }

    /// Decode one inbound frame and apply it to the registry.
    pub fn handle_frame(
        &mut self,
        bytes: &[u8],
    ) -> std::result::Result<Vec<MgmtNotification>, CodecError> {
        let frame = codec::decode(bytes)?;
        let index = frame.index;
        let event = codec::parse_event(&frame)?;

        let notification = match event {
            Event::CommandComplete {
                opcode,
                status,
                data,
            } => return self.command_complete(index, opcode, status, &data),
            Event::CommandStatus { opcode, status } => {
                self.resolve(index, opcode, CommandState::StatusOnly(status));
                if status == 0 {
                    return Ok(Vec::new());
                }
                warn!(
                    "Opcode {:#06x} on index {:#06x} failed with status {:#04x}",
                    opcode, index, status
                );
                MgmtNotification::CommandFailed {
                    index,
                    opcode,
                    status,
                }
            }
            Event::ControllerError(code) => {
                error!("Controller hci{} reported error {:#04x}", index, code);
                return Ok(Vec::new());
            }
            Event::IndexAdded => {
                info!("Controller hci{} added", index);
                self.registry.add(index);
                self.read_info(index);
                return Ok(Vec::new());
            }
            Event::IndexRemoved => {
                if !self.registry.remove(index) {
                    debug!("Ignoring removal of unknown hci{}", index);
                    return Ok(Vec::new());
                }
                info!("Controller hci{} removed", index);
                self.pending.retain(|p| p.index != index);
                MgmtNotification::ControllerRemoved(index)
            }
            Event::Powered(powered) => {
                let updated = self.registry.set_powered(index, powered);
                if !self.registry_updated("Powered", updated) {
                    return Ok(Vec::new());
                }
                MgmtNotification::PoweredChanged(index, powered)
            }
            Event::Discoverable(discoverable) => {
                let updated = self.registry.set_discoverable(index, discoverable);
                if !self.registry_updated("Discoverable", updated) {
                    return Ok(Vec::new());
                }
                self.scan_mode_of(index)
            }
            Event::Connectable(connectable) => {
                let updated = self.registry.set_connectable(index, connectable);
                if !self.registry_updated("Connectable", updated) {
                    return Ok(Vec::new());
                }
                self.scan_mode_of(index)
            }
            Event::Pairable(pairable) => {
                let updated = self.registry.set_pairable(index, pairable);
                if !self.registry_updated("Pairable", updated) {
                    return Ok(Vec::new());
                }
                MgmtNotification::PairableChanged(index, pairable)
            }
            Event::ClassChanged(class) => {
                let updated = self.registry.set_class(index, class);
                if !self.registry_updated("Class", updated) {
                    return Ok(Vec::new());
                }
                MgmtNotification::ClassChanged(index, class)
            }
            Event::Connected(address) => MgmtNotification::Connected(index, address),
            Event::Disconnected(address) => MgmtNotification::Disconnected(index, address),
            Event::DeviceFound {
                address,
                class,
                rssi,
                name,
            } => MgmtNotification::DeviceFound {
                index,
                address,
                class: class_to_u32(class),
                rssi,
                name,
            },
            Event::RemoteName {
                address,
                status,
                name,
            } => MgmtNotification::RemoteName {
                index,
                address,
                status,
                name,
            },
            Event::Discovering(discovering) => MgmtNotification::Discovering(index, discovering),
            Event::Unknown(opcode) => {
                warn!("Dropping unknown event {:#06x} for index {:#06x}", opcode, index);
                return Ok(Vec::new());
            }
        };

        if index != INDEX_NONE && self.registry.get(index).is_none() {
            match notification {
                MgmtNotification::ControllerRemoved(_) | MgmtNotification::CommandFailed { .. } => {}
                _ => {
                    debug!("Dropping event for unknown hci{}", index);
                    return Ok(Vec::new());
                }
            }
        }

        Ok(vec![notification])
    }

    fn registry_updated(&self, what: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{} event dropped: {}", what, e);
                false
            }
        }
    }

    fn scan_mode_of(&self, index: u16) -> MgmtNotification {
        let scan = match self.registry.get(index) {
            Some(info) => {
                let mut bits = 0;
                if info.connectable {
                    bits |= ScanMode::PAGE.0;
                }
                if info.discoverable {
                    bits |= ScanMode::INQUIRY.0;
                }
                ScanMode(bits)
            }
            None => ScanMode::DISABLED,
        };
        MgmtNotification::ScanModeChanged(index, scan)
    }

    fn command_complete(
        &mut self,
        index: u16,
        opcode: u16,
        status: u8,
        data: &[u8],
    ) -> std::result::Result<Vec<MgmtNotification>, CodecError> {
        if status != 0 {
            self.resolve(index, opcode, CommandState::CompleteError(status));
            warn!(
                "Opcode {:#06x} on index {:#06x} completed with status {:#04x}",
                opcode, index, status
            );
            return Ok(vec![MgmtNotification::CommandFailed {
                index,
                opcode,
                status,
            }]);
        }
        self.resolve(index, opcode, CommandState::CompleteOk);

        match opcode {
            opcode::READ_VERSION => {
                let (version, revision) = codec::parse_version(data)?;
                info!(
                    "Bluetooth management interface {}.{} initialized",
                    version, revision
                );
                self.version = Some((version, revision));
                if let Err(e) = self.send(INDEX_NONE, Command::ReadIndexList) {
                    error!("Unable to read controller index list: {}", e);
                }
                Ok(Vec::new())
            }
            opcode::READ_INDEX_LIST => {
                let indices = codec::parse_index_list(data)?;
                debug!("Controller index list: {:?}", indices);
                for index in indices {
                    self.registry.add(index);
                    self.read_info(index);
                }
                Ok(Vec::new())
            }
            opcode::READ_INFO => {
                let snapshot = codec::parse_info(data)?;
                match self.registry.update_info(index, &snapshot) {
                    Ok(()) => {
                        info!(
                            "hci{} type {} addr {} class {:02x}{:02x}{:02x} manufacturer {} powered {}",
                            index,
                            snapshot.controller_type,
                            snapshot.address,
                            snapshot.class[2],
                            snapshot.class[1],
                            snapshot.class[0],
                            snapshot.manufacturer,
                            snapshot.powered
                        );
                        Ok(vec![MgmtNotification::ControllerReady(index)])
                    }
                    Err(e) => {
                        warn!("Info reply dropped: {}", e);
                        Ok(Vec::new())
                    }
                }
            }
            _ => Ok(Vec::new()),
        }
    }
}

impl ControllerOps for MgmtClient {
    fn set_powered(&mut self, index: u16, powered: bool) -> Result<()> {
        self.send_to_controller(index, Command::SetPowered(powered))
    }

    fn set_discoverable(&mut self, index: u16, discoverable: bool) -> Result<()> {
        self.send_to_controller(index, Command::SetDiscoverable(discoverable))
    }

    fn set_pairable(&mut self, index: u16, pairable: bool) -> Result<()> {
        self.send_to_controller(index, Command::SetPairable(pairable))
    }

    fn write_scan_enable(&mut self, index: u16, scan: ScanMode) -> Result<()> {
        self.send_to_controller(index, Command::WriteScanEnable(scan))
    }

    fn set_limited_discoverable(
        &mut self,
        _index: u16,
        _class: [u8; 3],
        _limited: bool,
    ) -> Result<()> {
        Err(Error::Unsupported("limited discoverable"))
    }

    fn set_dev_class(&mut self, index: u16, class: [u8; 3]) -> Result<()> {
        self.send_to_controller(index, Command::SetDevClass(class))
    }

    fn set_local_name(&mut self, index: u16, name: &str) -> Result<()> {
        self.send_to_controller(index, Command::SetLocalName(name.to_string()))
    }

    fn start_inquiry(&mut self, index: u16, lap: [u8; 3], length: u8) -> Result<()> {
        self.send_to_controller(index, Command::StartDiscovery { lap, length })
    }

    fn start_periodic_inquiry(
        &mut self,
        _index: u16,
        _lap: [u8; 3],
        _min_period: u16,
        _max_period: u16,
        _length: u8,
    ) -> Result<()> {
        Err(Error::Unsupported("periodic inquiry"))
    }

    fn cancel_inquiry(&mut self, index: u16) -> Result<()> {
        self.send_to_controller(index, Command::StopDiscovery)
    }

    fn exit_periodic_inquiry(&mut self, _index: u16) -> Result<()> {
        Err(Error::Unsupported("periodic inquiry"))
    }

    fn resolve_name(&mut self, _index: u16, _address: BdAddr) -> Result<()> {
        Err(Error::Unsupported("resolve name"))
    }

    fn cancel_resolve_name(&mut self, _index: u16, _address: BdAddr) -> Result<()> {
        Err(Error::Unsupported("cancel resolve name"))
    }
}
