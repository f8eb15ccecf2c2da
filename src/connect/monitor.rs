//! Read-only attach to a live session.
//!
//! Terminal sessions fan their output flushes out to every monitor sink.
//! Guacamole sessions get a second guacd connection joined to the original
//! `connection_id` with `read-only` set.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use super::{farewell, Orchestrator};
use crate::error::ApiError;
use crate::guacd::{GuacdConfig, GuacdTunnel};
use crate::model::CurrentUser;
use crate::sessions::{ClientSink, ClientSource, Inbound, Session};

const DRAIN_WAIT: Duration = Duration::from_secs(5);
const ATTACHED_CHECK: Duration = Duration::from_millis(500);
const CLOSE_WAIT: Duration = Duration::from_secs(1);

impl Orchestrator {
    /// Attach `sink` to the session until either side goes away.
    pub async fn monitor(
        &self,
        user: &CurrentUser,
        session_id: &str,
        lang: &str,
        sink: ClientSink,
        mut source: ClientSource,
    ) -> Result<(), ApiError> {
        let result = self.attach(user, session_id, &sink, &mut source).await;
        if let Err(e) = &result {
            let guacd = self
                .registry
                .get(session_id)
                .is_some_and(|s| s.protocol.is_guacd());
            farewell(&sink, e, guacd, lang).await;
        }
        // A detached laggard may never drain its queue.
        let _ = tokio::time::timeout(CLOSE_WAIT, sink.close(None)).await;
        result
    }

    async fn attach(
        &self,
        user: &CurrentUser,
        session_id: &str,
        sink: &ClientSink,
        source: &mut ClientSource,
    ) -> Result<(), ApiError> {
        if !user.is_admin() {
            return Err(ApiError::no_perm("monitor session"));
        }
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| ApiError::InvalidSessionId {
                session_id: session_id.to_string(),
            })?;
        let key = format!(
            "{}-{}-{}",
            user.uid,
            session.id,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        info!("Session {} monitored by {} ({key})", session.id, user.user_name);
        if session.protocol.is_guacd() {
            self.watch_guacd(&session, sink, source).await
        } else {
            watch_terminal(&session, key, sink, source).await;
            Ok(())
        }
    }

    async fn watch_guacd(
        &self,
        session: &Session,
        sink: &ClientSink,
        source: &mut ClientSource,
    ) -> Result<(), ApiError> {
        let connection_id = session
            .connection_id()
            .ok_or_else(|| ApiError::InvalidSessionId {
                session_id: session.id.clone(),
            })?;
        let config = GuacdConfig::monitor(session.viewport);
        let tunnel = GuacdTunnel::connect(
            &self.adapters.guacd_host,
            self.adapters.guacd_port,
            Some(connection_id),
            &config,
        )
        .await
        .map_err(ApiError::connect_server)?;
        let (mut reader, mut writer) = tunnel.split();

        let pump_sink = sink.clone();
        let mut pump = tokio::spawn(async move {
            while let Ok(raw) = reader.read().await {
                if !pump_sink.send_text(raw).await {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                () = session.away.wait() => break,
                _ = &mut pump => break,
                msg = source.next(true) => match msg {
                    Some(Inbound::Raw(raw)) => {
                        if writer.write_raw(raw.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        pump.abort();
        let _ = writer.disconnect().await;
        debug!("Session {} guacd monitor detached", session.id);
        Ok(())
    }
}

async fn watch_terminal(session: &Session, key: String, sink: &ClientSink, source: &mut ClientSource) {
    session.add_monitor(key.clone(), sink.clone());
    let mut check = tokio::time::interval(ATTACHED_CHECK);
    loop {
        tokio::select! {
            () = session.away.wait() => {
                // Teardown writes the end banner to every monitor it drains.
                let drained = async {
                    while session.has_monitor(&key) {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                };
                let _ = tokio::time::timeout(DRAIN_WAIT, drained).await;
                break;
            }
            msg = source.next(false) => {
                if msg.is_none() {
                    break;
                }
            }
            _ = check.tick() => {
                // Output fan-out detaches monitors that fall behind.
                if !session.has_monitor(&key) {
                    break;
                }
            }
        }
    }
    session.remove_monitor(&key);
    debug!("Session {} monitor {key} detached", session.id);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::connect::tests::{
        fixture, fixture_with, inventory_data, read_until, request, telnet_target, user, wait_for,
    };
    use crate::guacd::{Instruction, InstructionReader};
    use crate::ssh::ConnectOptions;
    use crate::tunnel::SshGatewayDialer;

    /// guacd stand-in. A `select` of a protocol opens `$conn-1` and echoes
    /// client instructions back; a `select` of a connection id joins it and
    /// sends one `sync`.
    async fn fake_guacd() -> (u16, Arc<parking_lot::Mutex<Vec<Instruction>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let selects = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&selects);
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let (r, mut w) = sock.into_split();
                    let mut reader = InstructionReader::new(r);
                    let select = reader.read().await.unwrap();
                    let joining = select.args[0].starts_with('$');
                    seen.lock().push(select);
                    w.write_all(b"4.args,8.hostname,5.width;").await.unwrap();
                    for _ in 0..5 {
                        reader.read().await.unwrap();
                    }
                    if joining {
                        w.write_all(b"5.ready,4.$mon;4.sync,3.100;").await.unwrap();
                        while reader.read().await.is_ok() {}
                        return;
                    }
                    w.write_all(b"5.ready,7.$conn-1;").await.unwrap();
                    while let Ok(ins) = reader.read().await {
                        if ins.opcode == "disconnect"
                            || w.write_all(ins.encode().as_bytes()).await.is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        (port, selects)
    }

    #[tokio::test]
    async fn test_guacd_session_with_read_only_monitor() {
        let (guacd_port, selects) = fake_guacd().await;
        let mut data = inventory_data(1);
        data.assets[0].protocols = vec!["rdp:3389".into()];
        let dialer = Arc::new(SshGatewayDialer::new(ConnectOptions::default()));
        let fx = fixture_with(data, 3600, dialer, guacd_port).await;

        let (sink, mut out) = ClientSink::channel();
        let (in_tx, in_rx) = mpsc::channel(16);
        let mut req = request(user(7, "bob", false));
        req.protocol = "rdp".into();
        let orch = Arc::clone(&fx.orch);
        let run = tokio::spawn(async move {
            orch.connect(req, sink, ClientSource::Channel(in_rx)).await
        });
        wait_for(|| fx.orch.registry().len() == 1).await;
        let sid = fx.orch.registry().records()[0].session_id.clone();
        let session = fx.orch.registry().get(&sid).unwrap();
        assert_eq!(session.connection_id(), Some("$conn-1"));
        assert!(session.parser.is_none());

        in_tx
            .send(Inbound::Raw("3.key,5.65307,1.1;".into()))
            .await
            .unwrap();
        let text = read_until(&mut out, "65307").await;
        assert!(text.contains("3.key,5.65307,1.1;"));

        let (msink, mut mout) = ClientSink::channel();
        let (mtx, mrx) = mpsc::channel(4);
        let orch = Arc::clone(&fx.orch);
        let watched = sid.clone();
        let watch = tokio::spawn(async move {
            orch.monitor(
                &user(1, "alice", true),
                &watched,
                "en",
                msink,
                ClientSource::Channel(mrx),
            )
            .await
        });
        let text = read_until(&mut mout, "sync").await;
        assert!(text.contains("4.sync,3.100;"));
        {
            let selects = selects.lock();
            assert_eq!(selects.len(), 2);
            assert_eq!(selects[0].args, ["rdp"]);
            assert_eq!(selects[1].args, ["$conn-1"]);
        }

        drop(mtx);
        assert_eq!(watch.await.unwrap(), Ok(()));
        drop(in_tx);
        assert_eq!(run.await.unwrap(), Ok(()));
        assert!(fx.orch.registry().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_sees_output_and_end_banner() {
        let (port, _seen) = telnet_target().await;
        let fx = fixture(port, 3600).await;
        let (sink, _out) = ClientSink::channel();
        let (in_tx, in_rx) = mpsc::channel(16);
        let orch = Arc::clone(&fx.orch);
        let run = tokio::spawn(async move {
            orch.connect(request(user(7, "bob", false)), sink, ClientSource::Channel(in_rx))
                .await
        });
        wait_for(|| fx.orch.registry().len() == 1).await;
        let sid = fx.orch.registry().records()[0].session_id.clone();
        let session = fx.orch.registry().get(&sid).unwrap();

        let (msink, mut mout) = ClientSink::channel();
        let (_mtx, mrx) = mpsc::channel(4);
        let orch = Arc::clone(&fx.orch);
        let watched = sid.clone();
        let watch = tokio::spawn(async move {
            orch.monitor(
                &user(1, "alice", true),
                &watched,
                "en",
                msink,
                ClientSource::Channel(mrx),
            )
            .await
        });
        wait_for(|| session.monitor_count() == 1).await;

        in_tx
            .send(Inbound::Data(b"echo hi\r".to_vec()))
            .await
            .unwrap();
        read_until(&mut mout, "echo hi").await;

        drop(in_tx);
        assert_eq!(run.await.unwrap(), Ok(()));
        let text = read_until(&mut mout, "has been ended").await;
        assert!(text.contains(&format!("Session {sid} has been ended")));
        assert_eq!(watch.await.unwrap(), Ok(()));
        assert_eq!(session.monitor_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_monitor_is_detached_without_blocking_owner() {
        let (port, _seen) = telnet_target().await;
        let fx = fixture(port, 3600).await;
        let (sink, mut out) = ClientSink::channel();
        let (in_tx, in_rx) = mpsc::channel(16);
        let orch = Arc::clone(&fx.orch);
        let run = tokio::spawn(async move {
            orch.connect(request(user(7, "bob", false)), sink, ClientSource::Channel(in_rx))
                .await
        });
        wait_for(|| fx.orch.registry().len() == 1).await;
        let sid = fx.orch.registry().records()[0].session_id.clone();
        let session = fx.orch.registry().get(&sid).unwrap();

        // A monitor whose client never reads: its queue is already full.
        let (msink, _mout) = ClientSink::channel();
        while msink.try_send_text("x") {}
        let (_mtx, mrx) = mpsc::channel(4);
        let orch = Arc::clone(&fx.orch);
        let watched = sid.clone();
        let watch = tokio::spawn(async move {
            orch.monitor(
                &user(1, "alice", true),
                &watched,
                "en",
                msink,
                ClientSource::Channel(mrx),
            )
            .await
        });
        wait_for(|| session.monitor_count() == 1).await;

        in_tx
            .send(Inbound::Data(b"echo hi\r".to_vec()))
            .await
            .unwrap();
        read_until(&mut out, "echo hi").await;
        wait_for(|| session.monitor_count() == 0).await;
        let watched = tokio::time::timeout(Duration::from_secs(5), watch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watched, Ok(()));

        in_tx
            .send(Inbound::Data(b"echo again\r".to_vec()))
            .await
            .unwrap();
        read_until(&mut out, "echo again").await;
        drop(in_tx);
        assert_eq!(run.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_monitor_requires_admin_and_live_session() {
        let fx = fixture(1, 3600).await;
        let (sink, mut out) = ClientSink::channel();
        let (_tx, rx) = mpsc::channel(1);
        let result = fx
            .orch
            .monitor(&user(7, "bob", false), "s1", "en", sink, ClientSource::Channel(rx))
            .await;
        assert_eq!(result, Err(ApiError::no_perm("monitor session")));
        assert!(read_until(&mut out, "monitor session").await.contains("permission"));

        let (sink, _out) = ClientSink::channel();
        let (_tx, rx) = mpsc::channel(1);
        let result = fx
            .orch
            .monitor(&user(1, "alice", true), "s1", "en", sink, ClientSource::Channel(rx))
            .await;
        assert!(matches!(result, Err(ApiError::InvalidSessionId { .. })));
    }
}
