//! RDP/VNC through guacd.
//!
//! After the handshake guacd's instructions go straight to the client as
//! they arrive; client instructions are written to guacd verbatim.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::{AdapterContext, GuacdKind, Protocol};
use crate::error::ApiError;
use crate::guacd::{GuacdConfig, GuacdTunnel};
use crate::sessions::channels::AdapterEnds;

pub async fn run(ctx: AdapterContext, ends: AdapterEnds) -> Result<(), ApiError> {
    let AdapterEnds {
        mut input,
        out_tx,
        mut ready,
        ..
    } = ends;

    let tunnel = match open(&ctx).await {
        Ok(t) => t,
        Err(e) => {
            ready.fail(e);
            return Ok(());
        }
    };
    let s = Arc::clone(&ctx.session);
    s.set_connection_id(tunnel.connection_id.clone());
    info!("Session {} guacd connection {}", s.id, tunnel.connection_id);
    let (mut reader, mut writer) = tunnel.split();
    ready.ok();

    {
        let s = Arc::clone(&s);
        let token = s.group.token();
        s.group.clone().spawn("guacd-read", async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    read = reader.read() => match read {
                        Ok(raw) => {
                            if out_tx.send(raw.into_bytes()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("Session {} guacd read ended: {e}", s.id);
                            s.away.close();
                            break;
                        }
                    },
                }
            }
            Ok(())
        });
    }

    let token = s.group.token();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = s.away.wait() => break,
            read = input.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = writer.write_raw(&buf[..n]).await {
                        debug!("Session {} guacd write failed: {e}", s.id);
                        s.away.close();
                        break;
                    }
                }
            },
        }
    }
    let _ = writer.disconnect().await;
    Ok(())
}

async fn open(ctx: &AdapterContext) -> Result<GuacdTunnel<tokio::net::TcpStream>, ApiError> {
    let s = &ctx.session;
    let (ip, port) = ctx.target().await?;
    let clipboard = match s.protocol {
        Protocol::Guacd(GuacdKind::Rdp) => ctx.settings.rdp,
        _ => ctx.settings.vnc,
    };
    let config = GuacdConfig::new_session(
        &s.id,
        s.protocol.name(),
        &ip,
        port,
        &s.account,
        s.viewport,
        clipboard,
    );
    GuacdTunnel::connect(&ctx.options.guacd_host, ctx.options.guacd_port, None, &config)
        .await
        .map_err(ApiError::connect_server)
}
