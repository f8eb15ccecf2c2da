//! Interactive shell on the target over SSH.

use russh::{ChannelMsg, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::AdapterContext;
use crate::error::ApiError;
use crate::model::Credential;
use crate::sessions::channels::AdapterEnds;
use crate::ssh;

const TERM: &str = "xterm-256color";
const PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

pub async fn run(ctx: AdapterContext, mut ends: AdapterEnds) -> Result<(), ApiError> {
    let mut channel = match open_shell(&ctx).await {
        Ok(ch) => ch,
        Err(e) => {
            ends.ready.fail(e);
            return Ok(());
        }
    };
    let s = &ctx.session;
    ends.ready.ok();
    info!("Session {} SSH shell opened", s.id);

    let token = s.group.token();
    let mut buf = vec![0u8; 4096];
    let result = loop {
        tokio::select! {
            () = token.cancelled() => break Ok(()),
            () = s.away.wait() => break Ok(()),
            read = ends.input.read(&mut buf) => match read {
                Ok(0) | Err(_) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = channel.data(&buf[..n]).await {
                        break Err(ApiError::connect_server(e));
                    }
                }
            },
            Some(win) = ends.window.recv() => {
                let _ = channel
                    .window_change(u32::from(win.width), u32::from(win.height), 0, 0)
                    .await;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                    if ends.output.write_all(&data).await.is_err() {
                        break Ok(());
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Session {} remote shell exited with {exit_status}", s.id);
                }
                Some(ChannelMsg::Close) | None => {
                    s.away.close();
                    break Ok(());
                }
                Some(_) => {}
            },
        }
    };
    let _ = channel.eof().await;
    let _ = channel.close().await;
    result
}

async fn open_shell(
    ctx: &AdapterContext,
) -> Result<russh::Channel<russh::client::Msg>, ApiError> {
    let s = &ctx.session;
    let (ip, port) = ctx.target().await?;
    let cred = Credential::from(&s.account);
    let handle = ssh::connect(&ip, port, &cred, &ctx.options.ssh)
        .await
        .map_err(ApiError::connect_server)?;
    let channel = handle
        .channel_open_session()
        .await
        .map_err(ApiError::connect_server)?;
    channel
        .request_pty(
            false,
            TERM,
            s.viewport.width,
            s.viewport.height,
            0,
            0,
            PTY_MODES,
        )
        .await
        .map_err(ApiError::connect_server)?;
    channel
        .request_shell(false)
        .await
        .map_err(ApiError::connect_server)?;
    s.set_ssh_client(handle);
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::server::{Auth, Handler, Msg, Session as ServerSession};
    use russh::{Channel, ChannelId, CryptoVec};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::connect::tests::{fixture_with, inventory_data, read_until, request, user, wait_for};
    use crate::sessions::{ClientSink, ClientSource, Inbound, WindowSize};
    use crate::ssh::ConnectOptions;
    use crate::tunnel::SshGatewayDialer;

    type Events = Arc<parking_lot::Mutex<Vec<String>>>;

    /// Target shell: logs pty and resize requests, echoes input and exits
    /// once it reads `exit\r`.
    struct EchoShell {
        events: Events,
        typed: Vec<u8>,
    }

    impl Handler for EchoShell {
        type Error = russh::Error;

        async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
            self.events.lock().push(format!("login {user}:{password}"));
            Ok(Auth::Accept)
        }

        async fn channel_open_session(
            &mut self,
            _channel: Channel<Msg>,
            _session: &mut ServerSession,
        ) -> Result<bool, Self::Error> {
            Ok(true)
        }

        async fn pty_request(
            &mut self,
            channel: ChannelId,
            term: &str,
            col_width: u32,
            row_height: u32,
            _pix_width: u32,
            _pix_height: u32,
            _modes: &[(russh::Pty, u32)],
            session: &mut ServerSession,
        ) -> Result<(), Self::Error> {
            self.events
                .lock()
                .push(format!("pty {term} {col_width}x{row_height}"));
            let _ = session.channel_success(channel);
            Ok(())
        }

        async fn shell_request(
            &mut self,
            channel: ChannelId,
            session: &mut ServerSession,
        ) -> Result<(), Self::Error> {
            let _ = session.data(channel, CryptoVec::from_slice(b"target$ "));
            Ok(())
        }

        async fn window_change_request(
            &mut self,
            _channel: ChannelId,
            col_width: u32,
            row_height: u32,
            _pix_width: u32,
            _pix_height: u32,
            _session: &mut ServerSession,
        ) -> Result<(), Self::Error> {
            self.events
                .lock()
                .push(format!("resize {col_width}x{row_height}"));
            Ok(())
        }

        async fn data(
            &mut self,
            channel: ChannelId,
            data: &[u8],
            session: &mut ServerSession,
        ) -> Result<(), Self::Error> {
            let _ = session.data(channel, CryptoVec::from_slice(data));
            self.typed.extend_from_slice(data);
            if self.typed.ends_with(b"exit\r") {
                let _ = session.exit_status_request(channel, 0);
                let _ = session.eof(channel);
                let _ = session.close(channel);
            }
            Ok(())
        }
    }

    async fn ssh_target() -> (u16, Events) {
        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            keys: vec![key],
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let events = Events::default();
        let shell = EchoShell {
            events: Arc::clone(&events),
            typed: Vec::new(),
        };
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let running = russh::server::run_stream(config, stream, shell).await.unwrap();
            let _ = running.await;
        });
        (port, events)
    }

    #[tokio::test]
    async fn test_shell_echo_resize_and_remote_exit() {
        let (port, events) = ssh_target().await;
        let mut data = inventory_data(1);
        data.assets[0].protocols = vec![format!("ssh:{port}")];
        let dialer = Arc::new(SshGatewayDialer::new(ConnectOptions::default()));
        let fx = fixture_with(data, 3600, dialer, 4822).await;

        let (sink, mut out) = ClientSink::channel();
        let (in_tx, in_rx) = mpsc::channel(16);
        let mut req = request(user(7, "bob", false));
        req.protocol = "ssh".into();
        let orch = Arc::clone(&fx.orch);
        let run = tokio::spawn(async move {
            orch.connect(req, sink, ClientSource::Channel(in_rx)).await
        });

        read_until(&mut out, "target$").await;
        assert!(events.lock().contains(&"login root:pw".to_string()));
        assert!(events.lock().contains(&"pty xterm-256color 80x24".to_string()));
        let sid = fx.orch.registry().records()[0].session_id.clone();
        assert!(fx.orch.registry().get(&sid).unwrap().parser.is_some());

        in_tx
            .send(Inbound::Data(b"uname\r".to_vec()))
            .await
            .unwrap();
        read_until(&mut out, "uname").await;

        in_tx
            .send(Inbound::Resize(WindowSize {
                width: 132,
                height: 43,
            }))
            .await
            .unwrap();
        wait_for(|| events.lock().contains(&"resize 132x43".to_string())).await;

        in_tx
            .send(Inbound::Data(b"exit\r".to_vec()))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("session did not end after the remote shell exited")
            .unwrap();
        assert_eq!(result, Ok(()));
        assert!(fx.orch.registry().is_empty());
        drop(in_tx);
    }
}
