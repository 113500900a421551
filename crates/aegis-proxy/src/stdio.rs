//! Stdio transport
//!
//! Newline-delimited JSON-RPC on stdin/stdout, the framing MCP clients use
//! when they spawn the proxy as a child process. The client is authenticated
//! by process identity: whoever spawned us owns the session.

use crate::pipeline::{handle_message, ClientIdentity, ProxyState};
use aegis_core::rpc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Serve stdin/stdout until the client closes the stream
pub async fn serve(state: ProxyState, agent_id: String) -> std::io::Result<()> {
    info!(agent = %agent_id, "stdio transport ready");

    let stdout = std::sync::Arc::new(Mutex::new(tokio::io::stdout()));
    let identity = ClientIdentity {
        agent_id: agent_id.clone(),
        session_id: Some(format!("stdio-{}", std::process::id())),
        client_ip: None,
    };

    // Server-initiated notifications flow to the client on the same pipe.
    let (subscriber_id, mut notes) = state.hub.subscribe(format!("client-{}", agent_id));
    let note_stdout = std::sync::Arc::clone(&stdout);
    let forwarder = tokio::spawn(async move {
        while let Some(note) = notes.recv().await {
            if let Ok(line) = serde_json::to_string(&note) {
                let mut out = note_stdout.lock().await;
                if out.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = out.write_all(b"\n").await;
                let _ = out.flush().await;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<rpc::Request>(&line) {
            Ok(request) => handle_message(&state, request, &identity).await,
            Err(e) => {
                warn!("unparseable stdio line: {}", e);
                Some(rpc::Response::err(
                    serde_json::Value::Null,
                    rpc::RpcError::parse_error(format!("malformed json: {}", e)),
                ))
            }
        };

        if let Some(response) = response {
            let line = serde_json::to_string(&response)?;
            let mut out = stdout.lock().await;
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await?;
        }
    }

    debug!("stdin closed, stdio transport exiting");
    state.hub.unsubscribe(subscriber_id);
    forwarder.abort();
    Ok(())
}
