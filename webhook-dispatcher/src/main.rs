use anyhow::Context;
use nexus_webhook_dispatcher::logging;
use nexus_webhook_dispatcher::rpc::{self, AppState, HostIo, JsonRpcRequest, PARSE_ERROR};
use serde_json::Value;
use std::io::{self, BufRead};
use std::sync::Arc;
use tokio::sync::RwLock;

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let state = Arc::new(RwLock::new(
        AppState::new().context("failed to create webhook dispatcher")?,
    ));
    let handle = tokio::runtime::Handle::current();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut input = stdin.lock();
        let mut line = String::new();

        loop {
            line.clear();
            match input.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let resp = rpc::err_response(
                        Value::Number(0.into()),
                        PARSE_ERROR,
                        format!("Parse error: {e}"),
                    );
                    rpc::emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";

            let response = {
                let mut host = HostIo {
                    out: &mut out,
                    input: &mut input,
                };
                handle.block_on(rpc::handle_request(&request, &state, &mut host))
            };
            rpc::emit_line(&mut out, &response);

            if is_shutdown {
                break;
            }
        }
    })
    .await
    .context("stdin loop panicked")?;

    Ok(())
}
