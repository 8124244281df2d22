use crate::ssh::BrokerState;
use russh::server::Handle;
use russh::ChannelMsg;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use uuid::Uuid;

const SHUTDOWN_DRAIN: std::time::Duration = std::time::Duration::from_secs(10);

/// Handle to the accept loop spawned for one `tcpip-forward` bind. Dropping or calling
/// `stop()` tears the listener down; in-flight connections finish their own copy loop.
pub struct BoundListener {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl BoundListener {
    pub fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Bind `0.0.0.0:bind_port` and spawn the accept loop for it. Each
/// accepted connection is dispatched independently; a slow or stuck peer never blocks new
/// accepts.
pub async fn bind(state: Arc<BrokerState>, device_id: Uuid, bind_port: u16, handle: Handle) -> std::io::Result<BoundListener> {
    let listener = TcpListener::bind(("0.0.0.0", bind_port)).await?;
    let (stop_tx, mut stop_rx) = oneshot::channel();

    tokio::spawn(async move {
        log::info!("listening for tunnel connections to device {device_id} on port {bind_port}");
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    log::info!("closing tunnel listener for device {device_id} on port {bind_port}");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, origin)) => {
                            let state = state.clone();
                            let handle = handle.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(state, handle, bind_port, stream, origin).await {
                                    log::debug!("tunnel connection from {origin} on port {bind_port} ended: {e}");
                                }
                            });
                        },
                        Err(e) => {
                            log::warn!("accept failed on tunnel port {bind_port}: {e}");
                        },
                    }
                }
            }
        }
    });

    Ok(BoundListener { stop_tx: Some(stop_tx) })
}

/// One accepted TCP connection: authorize it if its origin is itself a known mesh device, open
/// the `forwarded-tcpip` channel toward the bound device, and copy bytes both ways until either
/// side closes.
async fn serve_connection(
    state: Arc<BrokerState>,
    handle: Handle,
    bind_port: u16,
    mut stream: tokio::net::TcpStream,
    origin: SocketAddr,
) -> anyhow::Result<()> {
    if let std::net::IpAddr::V4(origin_ip) = origin.ip() {
        let source = {
            let conn = state.db.lock();
            crate::db::device::DeviceRepo::get_by_vpn_ip(&conn, origin_ip)
        };
        if let Ok(Some(source_device)) = source {
            let conn = state.db.lock();
            if let Err(e) = state.auth_cache.authorize(&conn, source_device.id, bind_port) {
                log::warn!("tunnel connection from device {} to port {bind_port} denied: {e}", source_device.id);
                anyhow::bail!("authorization denied: {e}");
            }
        }
    }

    let mut channel = handle
        .channel_open_forwarded_tcpip("0.0.0.0", bind_port as u32, &origin.ip().to_string(), origin.port() as u32)
        .await
        .map_err(|e| anyhow::anyhow!("failed to open forwarded-tcpip channel: {e:?}"))?;

    let (mut tcp_read, mut tcp_write) = stream.split();
    let mut buf = [0u8; 16 * 1024];

    loop {
        tokio::select! {
            result = tcp_read.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        let _ = channel.eof().await;
                        break;
                    },
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    },
                    Err(_) => break,
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if tcp_write.write_all(&data).await.is_err() {
                            break;
                        }
                    },
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {},
                }
            }
        }
    }

    let _ = tcp_write.shutdown().await;
    Ok(())
}

pub async fn shutdown(bound: Vec<BoundListener>) {
    for listener in bound {
        listener.stop();
    }
    tokio::time::sleep(SHUTDOWN_DRAIN).await;
}
