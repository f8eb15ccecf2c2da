//! Database sessions: the vendor CLI running in a local PTY.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use super::{AdapterContext, DbKind};
use crate::error::ApiError;
use crate::model::Account;
use crate::sessions::channels::AdapterEnds;
use crate::shell::{program_available, pty};
use crate::ssh::join_host_port;

const CLOSED_BANNER: &str = "\r\n\x1b[31mThe connection is closed!\x1b[0m\r\n";
const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;

/// The CLI invocation for one database session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbClient {
    pub program: &'static str,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub exit_aliases: &'static [&'static str],
}

impl DbClient {
    pub fn new(kind: DbKind, ip: &str, port_num: u16, account: &Account) -> Self {
        let port = port_num.to_string();
        match kind {
            DbKind::Redis => {
                let mut args = vec!["-h".into(), ip.into(), "-p".into(), port];
                if !account.password.is_empty() {
                    args.extend(["-a".into(), account.password.clone()]);
                }
                Self {
                    program: "redis-cli",
                    args,
                    env: Vec::new(),
                    exit_aliases: &["exit", "quit"],
                }
            }
            DbKind::Mysql => {
                let mut args = vec![
                    "-h".into(),
                    ip.into(),
                    "-P".into(),
                    port,
                    "-u".into(),
                    account.account.clone(),
                ];
                if !account.password.is_empty() {
                    args.push(format!("-p{}", account.password));
                }
                Self {
                    program: "mysql",
                    args,
                    env: Vec::new(),
                    exit_aliases: &["exit", "quit", "\\q"],
                }
            }
            DbKind::Postgres => {
                // `user/dbname` selects a database; plain `user` lands in postgres.
                let (user, db) = account
                    .account
                    .split_once('/')
                    .unwrap_or((account.account.as_str(), "postgres"));
                Self {
                    program: "psql",
                    args: vec![
                        "-h".into(),
                        ip.into(),
                        "-p".into(),
                        port,
                        "-U".into(),
                        user.into(),
                        "-d".into(),
                        db.into(),
                    ],
                    env: vec![("PGPASSWORD".into(), account.password.clone())],
                    exit_aliases: &["\\q", "exit", "quit"],
                }
            }
            DbKind::Mongo => {
                let mut args = Vec::new();
                if !account.account.is_empty() && !account.password.is_empty() {
                    args.extend([
                        "--username".into(),
                        account.account.clone(),
                        "--password".into(),
                        account.password.clone(),
                    ]);
                }
                args.push(format!("mongodb://{}", join_host_port(ip, port_num)));
                Self {
                    program: "mongosh",
                    args,
                    env: Vec::new(),
                    exit_aliases: &["exit", "quit"],
                }
            }
        }
    }

    pub fn is_exit(&self, line: &str) -> bool {
        let line = line.trim();
        self.exit_aliases.iter().any(|a| a.eq_ignore_ascii_case(line))
    }
}

/// Tracks the line being typed so exit commands can be recognized.
#[derive(Debug, Default)]
struct LineTracker {
    line: String,
}

impl LineTracker {
    /// Feed keystrokes; returns completed lines.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut done = Vec::new();
        for &b in bytes {
            match b {
                b'\r' | b'\n' => done.push(std::mem::take(&mut self.line)),
                0x08 | 0x7f => {
                    self.line.pop();
                }
                0x15 | 0x03 => self.line.clear(),
                0x20..=0x7e => self.line.push(char::from(b)),
                _ => {}
            }
        }
        done
    }
}

pub async fn run(ctx: AdapterContext, kind: DbKind, mut ends: AdapterEnds) -> Result<(), ApiError> {
    let client = match ctx.target().await {
        Ok((ip, port)) => DbClient::new(kind, &ip, port, &ctx.session.account),
        Err(e) => {
            ends.ready.fail(e);
            return Ok(());
        }
    };
    run_client(ctx, client, ends).await
}

async fn run_client(ctx: AdapterContext, client: DbClient, ends: AdapterEnds) -> Result<(), ApiError> {
    let AdapterEnds {
        mut input,
        mut output,
        out_tx,
        mut window,
        mut ready,
    } = ends;

    let (pty_pair, mut child, (mut reader, mut writer)) = match start(&client) {
        Ok(s) => s,
        Err(e) => {
            ready.fail(e);
            return Ok(());
        }
    };
    let s = Arc::clone(&ctx.session);
    ready.ok();
    info!("Session {} {} client started", s.id, client.program);

    let exit_sent = Arc::new(AtomicBool::new(false));
    let token = s.group.token();

    {
        let s = Arc::clone(&s);
        let token = token.clone();
        let exit_sent = Arc::clone(&exit_sent);
        s.group.clone().spawn("db-exit", async move {
            tokio::select! {
                status = child.wait() => {
                    let clean = status.as_ref().is_ok_and(std::process::ExitStatus::success);
                    if clean {
                        exit_sent.store(true, Ordering::Release);
                    } else {
                        warn!("Session {} client exited: {status:?}", s.id);
                        if exit_sent
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            let _ = out_tx.send(CLOSED_BANNER.as_bytes().to_vec()).await;
                        }
                    }
                    s.away.close();
                }
                () = token.cancelled() => {
                    let _ = child.kill().await;
                }
                () = s.away.wait() => {
                    let _ = child.kill().await;
                }
            }
            Ok(())
        });
    }

    {
        let token = token.clone();
        s.group.clone().spawn("db-output", async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if output.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
            Ok(())
        });
    }

    let mut lines = LineTracker::default();
    let mut buf = vec![0u8; 1024];
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = s.away.wait() => break,
            read = input.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if lines.feed(&buf[..n]).iter().any(|l| client.is_exit(l)) {
                        exit_sent.store(true, Ordering::Release);
                    }
                    writer.write_all(&buf[..n]).await.map_err(ApiError::connect_server)?;
                    writer.flush().await.map_err(ApiError::connect_server)?;
                }
            },
            Some(win) = window.recv() => {
                if win.width > 0 && win.height > 0 {
                    let _ = pty::resize_pty(&pty_pair.master, win.height, win.width);
                }
            }
        }
    }
    Ok(())
}

type Started = (
    pty::PtyPair,
    tokio::process::Child,
    (tokio::fs::File, tokio::fs::File),
);

fn start(client: &DbClient) -> Result<Started, ApiError> {
    if !program_available(client.program) {
        return Err(ApiError::connect_server(format!("{} is not installed", client.program)));
    }
    let pty_pair = pty::allocate_pty(PTY_ROWS, PTY_COLS).map_err(ApiError::connect_server)?;
    let child = pty::spawn_command_pty(&pty_pair, client.program, &client.args, &client.env)
        .map_err(|e| ApiError::connect_server(format!("failed to start {}: {e}", client.program)))?;
    let io = pty::master_io(&pty_pair.master).map_err(ApiError::connect_server)?;
    Ok((pty_pair, child, io))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::guacd::tunnel::Viewport;
    use crate::model::{Asset, GlobalSettings, SessionRecord, SessionStatus, SessionType};
    use crate::protocols::{AdapterOptions, Protocol, TelnetPrompts};
    use crate::sessions::channels::{session_channels, ControlEnds};
    use crate::sessions::{Session, SessionInit};
    use crate::ssh::ConnectOptions;
    use crate::tunnel::{SshGatewayDialer, TunnelManager};

    fn context() -> AdapterContext {
        let record = SessionRecord {
            session_type: SessionType::Web,
            session_id: "db-1".into(),
            uid: 7,
            user_name: "bob".into(),
            asset_id: 1,
            asset_info: "cache(127.0.0.1)".into(),
            account_id: 2,
            account_info: "default()".into(),
            gateway_id: 0,
            gateway_info: String::new(),
            client_ip: "127.0.0.1".into(),
            protocol: "redis".into(),
            share_id: 0,
            share_end: None,
            status: SessionStatus::Online,
            created_at: Utc::now(),
            closed_at: None,
        };
        let (session, _close_rx) = Session::new(SessionInit {
            record,
            asset: Asset::default(),
            account: Account::default(),
            gateway: None,
            protocol: Protocol::Db(DbKind::Redis),
            viewport: Viewport {
                width: 80,
                height: 24,
                dpi: 96,
            },
            lang: "en".into(),
            parser: None,
            recorder: None,
        });
        let options = ConnectOptions::default();
        AdapterContext {
            session: Arc::new(session),
            tunnels: Arc::new(TunnelManager::new(Arc::new(SshGatewayDialer::new(
                options.clone(),
            )))),
            options: Arc::new(AdapterOptions {
                ssh: options,
                telnet: TelnetPrompts::default(),
                guacd_host: "127.0.0.1".into(),
                guacd_port: 4822,
            }),
            settings: Arc::new(GlobalSettings::default()),
            protocol: "redis".into(),
        }
    }

    /// A CLI stand-in: `quit` exits 1, `boom` exits 3, anything else echoes.
    fn scripted_cli() -> DbClient {
        DbClient {
            program: "sh",
            args: vec![
                "-c".into(),
                r#"while read l; do case "$l" in quit) exit 1;; boom) exit 3;; *) echo "got $l";; esac; done"#
                    .into(),
            ],
            env: Vec::new(),
            exit_aliases: &["quit", "exit"],
        }
    }

    async fn run_until_away(input: &[u8]) -> (Result<(), ApiError>, Vec<Vec<u8>>) {
        let ctx = context();
        let session = Arc::clone(&ctx.session);
        let (ctl, ends) = session_channels();
        let ControlEnds {
            mut in_writer,
            out_pipe: _out_pipe,
            mut out_rx,
            ready_rx,
            ..
        } = ctl;
        let run = tokio::spawn(run_client(ctx, scripted_cli(), ends));
        assert_eq!(ready_rx.await.unwrap(), Ok(()));

        in_writer.write_all(b"select 1\r").await.unwrap();
        in_writer.write_all(input).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.away.wait())
            .await
            .expect("client never exited");
        let result = run.await.unwrap();
        let mut sent = Vec::new();
        while let Ok(bytes) = out_rx.try_recv() {
            sent.push(bytes);
        }
        (result, sent)
    }

    #[tokio::test]
    async fn test_exit_alias_suppresses_closed_banner() {
        let (result, sent) = run_until_away(b"quit\r").await;
        assert_eq!(result, Ok(()));
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn test_crash_sends_closed_banner_once() {
        let (result, sent) = run_until_away(b"boom\r").await;
        assert_eq!(result, Ok(()));
        assert_eq!(sent, [CLOSED_BANNER.as_bytes().to_vec()]);
    }

    #[tokio::test]
    async fn test_missing_cli_fails_readiness() {
        let ctx = context();
        let (ctl, ends) = session_channels();
        let client = DbClient {
            program: "jumpgate-no-such-cli",
            ..scripted_cli()
        };
        run_client(ctx, client, ends).await.unwrap();
        let err = ctl.ready_rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    fn account(user: &str, pw: &str) -> Account {
        Account {
            account: user.into(),
            password: pw.into(),
            ..Account::default()
        }
    }

    #[test]
    fn test_redis_args() {
        let c = DbClient::new(DbKind::Redis, "10.0.0.5", 6379, &account("", "s3cret"));
        assert_eq!(c.program, "redis-cli");
        assert_eq!(c.args, ["-h", "10.0.0.5", "-p", "6379", "-a", "s3cret"]);
        let c = DbClient::new(DbKind::Redis, "10.0.0.5", 6379, &account("", ""));
        assert_eq!(c.args.len(), 4);
    }

    #[test]
    fn test_mysql_and_postgres_args() {
        let c = DbClient::new(DbKind::Mysql, "db", 3306, &account("root", "pw"));
        assert_eq!(c.args, ["-h", "db", "-P", "3306", "-u", "root", "-ppw"]);
        assert!(c.is_exit("\\q"));

        let c = DbClient::new(DbKind::Postgres, "db", 5432, &account("app/orders", "pw"));
        assert_eq!(c.args[5], "app");
        assert_eq!(c.args[7], "orders");
        assert_eq!(c.env, [("PGPASSWORD".to_string(), "pw".to_string())]);
        let c = DbClient::new(DbKind::Postgres, "db", 5432, &account("app", "pw"));
        assert_eq!(c.args[7], "postgres");
    }

    #[test]
    fn test_mongo_uri() {
        let c = DbClient::new(DbKind::Mongo, "10.0.0.9", 27017, &account("u", "p"));
        assert_eq!(c.args.last().unwrap(), "mongodb://10.0.0.9:27017");
        assert_eq!(c.args[0], "--username");
        let c = DbClient::new(DbKind::Mongo, "fe80::1", 27017, &account("", ""));
        assert_eq!(c.args, ["mongodb://[fe80::1]:27017"]);
    }

    #[test]
    fn test_exit_detection() {
        let c = DbClient::new(DbKind::Redis, "h", 1, &account("", ""));
        let mut t = LineTracker::default();
        assert!(t.feed(b"QUI").is_empty());
        let lines = t.feed(b"T \r");
        assert!(c.is_exit(&lines[0]));
        let lines = t.feed(b"exitx\x7f\r");
        assert!(c.is_exit(&lines[0]));
        let lines = t.feed(b"get k\r");
        assert!(!c.is_exit(&lines[0]));
    }
}
