mod cli;
mod domain;
mod infrastructure;
mod service;

use crate::cli::Cli;
use crate::domain::models::{ClientId, Signal};
use crate::domain::ops::SettingsStore;
use crate::domain::settings::{DaemonSettings, SettingsService};
use crate::infrastructure::logging::init_logger;
use crate::infrastructure::mgmt::socket::{is_transient, MAX_FRAME};
use crate::infrastructure::mgmt::{MgmtClient, MgmtSocket};
use crate::infrastructure::rpc::{spawn_server, RpcCall, RpcClient, RpcInbound, ServerMessage};
use crate::infrastructure::storage::{FileStore, MemoryStore};
use crate::service::{AdapterService, CallOutcome};
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, info, warn};

type Outboxes = HashMap<ClientId, UnboundedSender<ServerMessage>>;

fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = SettingsService::new(args.config)?;
    let _guard = init_logger(&settings.get().log_settings)?;
    if settings.path().exists() {
        info!("Settings loaded from {}", settings.path().display());
    } else if let Err(e) = settings.save() {
        warn!("Unable to write default settings to {}: {}", settings.path().display(), e);
    }

    let daemon = settings.get().daemon.clone();

    if let Some(call) = args.call {
        return run_call(&daemon, &call);
    }

    info!("Starting btadapterd");
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run(daemon))
}

/// One-shot client mode: send a single call to the running daemon.
fn run_call(config: &DaemonSettings, call: &str) -> Result<()> {
    let call: RpcCall = serde_json::from_str(call).context("Malformed call")?;
    let mut client = RpcClient::connect(&config.rpc_socket_name)?;
    let result = client.call(call)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run(config: DaemonSettings) -> Result<()> {
    let socket = MgmtSocket::open().context("Failed to open the Bluetooth management socket")?;

    let store: Box<dyn SettingsStore> = if config.persist_storage {
        info!("Persisting controller settings under {}", config.storage_dir);
        Box::new(FileStore::new(&config.storage_dir))
    } else {
        Box::new(MemoryStore::new())
    };

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

    let mut service = AdapterService::new(
        MgmtClient::new(Box::new(socket.sink())),
        store,
        config.clone(),
        signal_tx,
    );

    spawn_server(&config.rpc_socket_name, inbound_tx)?;
    service.start()?;

    let mut clients = Outboxes::new();
    let mut buf = vec![0u8; MAX_FRAME];
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let deadline = service.next_deadline();

        tokio::select! {
            received = socket.recv(&mut buf) => match received {
                Ok(n) => service.handle_mgmt_frame(&buf[..n]),
                Err(e) if is_transient(&e) => warn!("Management socket read interrupted: {}", e),
                Err(e) => {
                    error!("Management socket failed: {}", e);
                    return Err(e.into());
                }
            },
            Some(inbound) = inbound_rx.recv() => handle_inbound(&mut service, &mut clients, inbound),
            Some(signal) = signal_rx.recv() => route_signal(&clients, signal),
            _ = wait_until(deadline) => service.fire_timers(Instant::now()),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Terminated, shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn handle_inbound(service: &mut AdapterService, clients: &mut Outboxes, inbound: RpcInbound) {
    match inbound {
        RpcInbound::Connected { client, outbox } => {
            clients.insert(client, outbox);
        }
        RpcInbound::Call {
            client,
            serial,
            call,
        } => {
            if let CallOutcome::Reply(result) = service.handle_call(client, serial, call) {
                deliver(clients, client, ServerMessage::Reply { serial, result });
            }
        }
        RpcInbound::Disconnected { client } => {
            clients.remove(&client);
            service.client_disconnected(client);
        }
    }
}

fn deliver(clients: &Outboxes, client: ClientId, msg: ServerMessage) {
    match clients.get(&client) {
        Some(outbox) => {
            let _ = outbox.send(msg);
        }
        None => warn!("Dropping message for departed {}", client),
    }
}

/// Deferred replies and agent requests have one recipient; everything else
/// is broadcast.
fn route_signal(clients: &Outboxes, signal: Signal) {
    match signal {
        Signal::DeferredReply { reply_to, result } => deliver(
            clients,
            reply_to.client,
            ServerMessage::Reply {
                serial: reply_to.serial,
                result: result.map(|()| Value::Null),
            },
        ),
        Signal::AgentRequest { agent, .. } => {
            deliver(clients, agent, ServerMessage::Signal { signal })
        }
        signal => {
            for outbox in clients.values() {
                let _ = outbox.send(ServerMessage::Signal {
                    signal: signal.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Mode, ReplyTo};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn outboxes(n: u64) -> (Outboxes, Vec<UnboundedReceiver<ServerMessage>>) {
        let mut clients = Outboxes::new();
        let mut receivers = Vec::new();
        for id in 1..=n {
            let (tx, rx) = mpsc::unbounded_channel();
            clients.insert(ClientId(id), tx);
            receivers.push(rx);
        }
        (clients, receivers)
    }

    #[test]
    fn test_deferred_reply_goes_to_caller_only() {
        let (clients, mut rx) = outboxes(2);
        route_signal(
            &clients,
            Signal::DeferredReply {
                reply_to: ReplyTo {
                    client: ClientId(2),
                    serial: 5,
                },
                result: Ok(()),
            },
        );

        assert!(rx[0].try_recv().is_err());
        assert_eq!(
            rx[1].try_recv().unwrap(),
            ServerMessage::Reply {
                serial: 5,
                result: Ok(Value::Null)
            }
        );
    }

    #[test]
    fn test_agent_request_and_broadcast() {
        let (clients, mut rx) = outboxes(2);
        route_signal(
            &clients,
            Signal::AgentRequest {
                agent: ClientId(1),
                request_id: 1,
                adapter: 0,
                mode: Mode::Discoverable,
            },
        );
        assert!(rx[0].try_recv().is_ok());
        assert!(rx[1].try_recv().is_err());

        route_signal(&clients, Signal::AdapterAdded { adapter: 0 });
        assert!(rx[0].try_recv().is_ok());
        assert!(rx[1].try_recv().is_ok());
    }
}
