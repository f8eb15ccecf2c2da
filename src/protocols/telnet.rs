//! Telnet: raw TCP with every option refused and a heuristic auto-login.
//!
//! The login step watches server output for English prompt words and
//! answers with the account's credentials. Servers with localized prompts
//! need the word lists in `[telnet]` adjusted.

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use super::AdapterContext;
use crate::error::ApiError;
use crate::sessions::channels::AdapterEnds;
use crate::ssh::join_host_port;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_WINDOW: Duration = Duration::from_secs(5);
const ANSWER_DELAY: Duration = Duration::from_millis(300);
const PROMPT_BUFFER: usize = 200;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// Prompt words that trigger the automatic login answers.
#[derive(Debug, Clone, Deserialize)]
pub struct TelnetPrompts {
    #[serde(default = "default_login_markers")]
    pub login_markers: Vec<String>,
    #[serde(default = "default_password_markers")]
    pub password_markers: Vec<String>,
    #[serde(default = "default_prompt_chars")]
    pub prompt_chars: Vec<char>,
}

fn default_login_markers() -> Vec<String> {
    vec!["login".into(), "username".into(), "account".into()]
}
fn default_password_markers() -> Vec<String> {
    vec!["password".into(), "pass:".into()]
}
fn default_prompt_chars() -> Vec<char> {
    vec!['$', '#', '>']
}

impl Default for TelnetPrompts {
    fn default() -> Self {
        Self {
            login_markers: default_login_markers(),
            password_markers: default_password_markers(),
            prompt_chars: default_prompt_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum IacState {
    #[default]
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Stateful option filter. Sequences split across reads are carried over,
/// so no negotiation byte ever leaks into the data stream.
#[derive(Debug, Default)]
pub struct IacFilter {
    state: IacState,
}

impl IacFilter {
    /// Returns `(data, replies)` for one chunk of wire bytes.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(input.len());
        let mut replies = Vec::new();
        for &b in input {
            self.state = match self.state {
                IacState::Data if b == IAC => IacState::Iac,
                IacState::Data => {
                    data.push(b);
                    IacState::Data
                }
                IacState::Iac => match b {
                    IAC => {
                        data.push(IAC);
                        IacState::Data
                    }
                    WILL | WONT | DO | DONT => IacState::Negotiate(b),
                    SB => IacState::Sub,
                    _ => IacState::Data,
                },
                IacState::Negotiate(cmd) => {
                    match cmd {
                        WILL => replies.extend_from_slice(&[IAC, DONT, b]),
                        DO => replies.extend_from_slice(&[IAC, WONT, b]),
                        _ => {}
                    }
                    IacState::Data
                }
                IacState::Sub if b == IAC => IacState::SubIac,
                IacState::Sub => IacState::Sub,
                IacState::SubIac if b == SE => IacState::Data,
                IacState::SubIac => IacState::Sub,
            };
        }
        (data, replies)
    }
}

/// Rolling, lowercased window over recent server output.
struct PromptWatch<'a> {
    prompts: &'a TelnetPrompts,
    buf: String,
}

#[derive(Debug, PartialEq, Eq)]
enum LoginStep {
    SendUser,
    SendPassword,
    ShellReady,
    Wait,
}

impl<'a> PromptWatch<'a> {
    fn new(prompts: &'a TelnetPrompts) -> Self {
        Self {
            prompts,
            buf: String::new(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(data).to_lowercase());
        if self.buf.len() > PROMPT_BUFFER {
            let mut cut = self.buf.len() - PROMPT_BUFFER;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    fn step(&self, sent_user: bool, sent_password: bool) -> LoginStep {
        if !sent_password && contains_any(&self.buf, &self.prompts.password_markers) {
            return LoginStep::SendPassword;
        }
        if !sent_user && contains_any(&self.buf, &self.prompts.login_markers) {
            return LoginStep::SendUser;
        }
        let tail = self.buf.trim_end();
        if (sent_user && sent_password)
            || tail
                .chars()
                .last()
                .is_some_and(|c| self.prompts.prompt_chars.contains(&c))
        {
            return LoginStep::ShellReady;
        }
        LoginStep::Wait
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

fn contains_any(buf: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| buf.contains(m.as_str()))
}

pub async fn run(ctx: AdapterContext, mut ends: AdapterEnds) -> Result<(), ApiError> {
    let stream = match dial(&ctx).await {
        Ok(s) => s,
        Err(e) => {
            ends.ready.fail(e);
            return Ok(());
        }
    };
    let s = &ctx.session;
    ends.ready.ok();
    info!("Session {} telnet connected", s.id);

    let (mut rd, mut wr) = stream.into_split();
    let mut filter = IacFilter::default();
    login(&ctx, &mut rd, &mut wr, &mut filter, &mut ends).await?;

    let token = s.group.token();
    let mut net_buf = vec![0u8; 4096];
    let mut in_buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = s.away.wait() => break,
            read = ends.input.read(&mut in_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => wr.write_all(&in_buf[..n]).await.map_err(ApiError::connect_server)?,
            },
            read = rd.read(&mut net_buf) => match read {
                Ok(0) | Err(_) => {
                    s.away.close();
                    break;
                }
                Ok(n) => {
                    let (data, replies) = filter.feed(&net_buf[..n]);
                    if !replies.is_empty() {
                        let _ = wr.write_all(&replies).await;
                    }
                    if !data.is_empty() && ends.output.write_all(&data).await.is_err() {
                        break;
                    }
                }
            },
            Some(win) = ends.window.recv() => {
                debug!("Session {} telnet resize {}x{} ignored", s.id, win.width, win.height);
            }
        }
    }
    let _ = wr.shutdown().await;
    Ok(())
}

async fn dial(ctx: &AdapterContext) -> Result<TcpStream, ApiError> {
    let (ip, port) = ctx.target().await?;
    let addr = join_host_port(&ip, port);
    tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| ApiError::connect_server(format!("dial {addr} timed out")))?
        .map_err(ApiError::connect_server)
}

/// Answer login prompts for up to [`LOGIN_WINDOW`], then set up the
/// terminal. Everything read is forwarded to the client.
async fn login(
    ctx: &AdapterContext,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
    filter: &mut IacFilter,
    ends: &mut AdapterEnds,
) -> Result<(), ApiError> {
    let s = &ctx.session;
    let mut watch = PromptWatch::new(&ctx.options.telnet);
    let (mut sent_user, mut sent_password) = (false, false);
    let deadline = Instant::now() + LOGIN_WINDOW;
    let mut buf = vec![0u8; 1024];

    loop {
        let n = match tokio::time::timeout_at(deadline, rd.read(&mut buf)).await {
            Err(_) => return Ok(()),
            Ok(Ok(0) | Err(_)) => return Err(ApiError::connect_server("telnet closed during login")),
            Ok(Ok(n)) => n,
        };
        let (data, replies) = filter.feed(&buf[..n]);
        if !replies.is_empty() {
            wr.write_all(&replies).await.map_err(ApiError::connect_server)?;
        }
        if data.is_empty() {
            continue;
        }
        let _ = ends.output.write_all(&data).await;
        watch.push(&data);

        match watch.step(sent_user, sent_password) {
            LoginStep::SendUser => {
                tokio::time::sleep(ANSWER_DELAY).await;
                let line = format!("{}\r\n", s.account.account);
                wr.write_all(line.as_bytes()).await.map_err(ApiError::connect_server)?;
                watch.clear();
                sent_user = true;
            }
            LoginStep::SendPassword => {
                tokio::time::sleep(ANSWER_DELAY).await;
                let line = format!("{}\r\n", s.account.password);
                wr.write_all(line.as_bytes()).await.map_err(ApiError::connect_server)?;
                watch.clear();
                sent_password = true;
            }
            LoginStep::ShellReady => {
                let (w, h) = (s.viewport.width, s.viewport.height);
                let setup = format!(
                    "export TERM=xterm-256color LINES={h} COLUMNS={w}; stty rows {h} cols {w}; clear\r\n"
                );
                wr.write_all(setup.as_bytes()).await.map_err(ApiError::connect_server)?;
                return Ok(());
            }
            LoginStep::Wait => {}
        }
    }
}
