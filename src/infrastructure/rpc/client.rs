use crate::infrastructure::rpc::protocol::{ClientMessage, RpcCall, ServerMessage};
use anyhow::{bail, Context, Result};
use interprocess::local_socket::{traits::Stream, GenericNamespaced, Stream as LocalStream, ToNsName};
use interprocess::TryClone;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use tracing::{debug, info};

/// Blocking one-shot client for the daemon's local socket.
pub struct RpcClient {
    stream: LocalStream,
    reader: BufReader<LocalStream>,
    next_serial: u64,
}

impl RpcClient {
    pub fn connect(socket_name: &str) -> Result<Self> {
        let name = socket_name.to_ns_name::<GenericNamespaced>()?;
        let stream = LocalStream::connect(name)
            .with_context(|| format!("Daemon is not listening on {}", socket_name))?;
        info!("Connected to daemon on {}", socket_name);

        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            next_serial: 1,
        })
    }

    /// Send `call` and wait for its reply. Signals that arrive first are
    /// skipped.
    pub fn call(&mut self, call: RpcCall) -> Result<Value> {
        let serial = self.next_serial;
        self.next_serial += 1;

        let json = serde_json::to_string(&ClientMessage { serial, call })? + "\n";
        self.stream.write_all(json.as_bytes())?;
        self.stream.flush()?;

        let mut buffer = String::new();
        loop {
            buffer.clear();
            if self.reader.read_line(&mut buffer)? == 0 {
                bail!("Daemon closed the connection");
            }

            match serde_json::from_str::<ServerMessage>(&buffer)? {
                ServerMessage::Reply {
                    serial: got,
                    result,
                } if got == serial => {
                    return result.map_err(|e| anyhow::anyhow!("{}: {}", e.name, e.message));
                }
                other => debug!("Skipping {:?}", other),
            }
        }
    }
}
