use crate::domain::error::{Error, ErrorReply};
use crate::domain::models::ClientId;
use crate::infrastructure::rpc::protocol::{ClientMessage, RpcInbound, ServerMessage};
use anyhow::{Context, Result};
use interprocess::local_socket::{
    traits::ListenerExt, GenericNamespaced, ListenerOptions, Stream as LocalStream, ToNsName,
};
use interprocess::TryClone;
use std::io::{BufRead, BufReader, Write};
use std::thread;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Start accepting clients on `socket_name`.
///
/// Each connection gets a reader thread that forwards calls to `inbound`
/// and a writer thread that drains the connection's outbox.
pub fn spawn_server(socket_name: &str, inbound: UnboundedSender<RpcInbound>) -> Result<()> {
    let name = socket_name.to_ns_name::<GenericNamespaced>()?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_sync()
        .with_context(|| format!("Failed to listen on {}", socket_name))?;

    info!("Listening for clients on {}", socket_name);

    thread::Builder::new()
        .name("rpc-listener".into())
        .spawn(move || {
            let mut next_id = 0u64;
            for conn in listener.incoming() {
                let stream = match conn {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Failed to accept client: {}", e);
                        continue;
                    }
                };

                next_id += 1;
                let client = ClientId(next_id);
                info!("{} connected", client);
                if let Err(e) = handle_connection(client, stream, inbound.clone()) {
                    error!("Connection error for {}: {}", client, e);
                }
            }
        })?;

    Ok(())
}

fn handle_connection(
    client: ClientId,
    stream: LocalStream,
    inbound: UnboundedSender<RpcInbound>,
) -> Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    let (outbox, outbox_rx) = mpsc::unbounded_channel();

    inbound
        .send(RpcInbound::Connected {
            client,
            outbox: outbox.clone(),
        })
        .context("Event loop is gone")?;

    thread::Builder::new()
        .name(format!("rpc-writer-{}", client.0))
        .spawn(move || write_loop(client, stream, outbox_rx))?;

    thread::Builder::new()
        .name(format!("rpc-reader-{}", client.0))
        .spawn(move || read_loop(client, reader, inbound, outbox))?;

    Ok(())
}

fn read_loop(
    client: ClientId,
    mut reader: BufReader<LocalStream>,
    inbound: UnboundedSender<RpcInbound>,
    outbox: UnboundedSender<ServerMessage>,
) {
    let mut buffer = String::new();

    loop {
        buffer.clear();
        match reader.read_line(&mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let line = buffer.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClientMessage>(line) {
                    Ok(msg) => {
                        debug!("{} -> {:?}", client, msg.call);
                        let call = RpcInbound::Call {
                            client,
                            serial: msg.serial,
                            call: msg.call,
                        };
                        if inbound.send(call).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Malformed message from {}: {}", client, e);
                        let reply = ServerMessage::Reply {
                            serial: serial_of(line),
                            result: Err(ErrorReply::from(Error::InvalidArguments(e.to_string()))),
                        };
                        let _ = outbox.send(reply);
                    }
                }
            }
            Err(e) => {
                error!("Read error from {}: {}", client, e);
                break;
            }
        }
    }

    info!("{} disconnected", client);
    let _ = inbound.send(RpcInbound::Disconnected { client });
}

/// Best-effort serial of a message that failed to parse.
fn serial_of(line: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("serial").and_then(|s| s.as_u64()))
        .unwrap_or(0)
}

fn write_loop(
    client: ClientId,
    mut stream: LocalStream,
    mut outbox: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(msg) = outbox.blocking_recv() {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json + "\n",
            Err(e) => {
                error!("Failed to encode message for {}: {}", client, e);
                continue;
            }
        };
        if let Err(e) = stream.write_all(json.as_bytes()).and_then(|_| stream.flush()) {
            debug!("Dropping writer for {}: {}", client, e);
            break;
        }
    }
}
