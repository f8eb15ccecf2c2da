//! Client side of the guacd handshake.
//!
//! `select` -> `args` -> `size`/`audio`/`video`/`image` -> `connect` -> `ready`.
//! After `ready` the stream is split so one task can pump guacd output to the
//! browser while another forwards browser instructions to guacd.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{
    split, AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::debug;

use super::{GuacdError, Instruction, InstructionReader};
use crate::model::{Account, CopyPaste};

pub const VERSION: &str = "VERSION_1_5_0";
const CLIENT_NAME: &str = "jumpgate";
const RECORDING_PATH: &str = "/replay";
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
pub const MAX_PIXELS: u32 = 8192;
pub const MAX_DPI: u32 = 600;

/// Display geometry requested by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

impl Viewport {
    /// Caps every dimension at `MAX_PIXELS` and the density at `MAX_DPI`.
    pub fn bounded(self) -> Self {
        Self {
            width: self.width.min(MAX_PIXELS),
            height: self.height.min(MAX_PIXELS),
            dpi: self.dpi.min(MAX_DPI),
        }
    }
}

/// Protocol plus the parameter map answered to guacd's `args`.
#[derive(Debug, Clone, Default)]
pub struct GuacdConfig {
    pub protocol: String,
    pub parameters: HashMap<String, String>,
}

impl GuacdConfig {
    /// Full parameter set for a new recorded session.
    pub fn new_session(
        session_id: &str,
        protocol: &str,
        hostname: &str,
        port: u16,
        account: &Account,
        view: Viewport,
        clipboard: CopyPaste,
    ) -> Self {
        let mut p = HashMap::new();
        let mut set = |k: &str, v: String| {
            p.insert(k.to_string(), v);
        };
        set("version", VERSION.to_string());
        set("client-name", CLIENT_NAME.to_string());
        set("recording-path", RECORDING_PATH.to_string());
        set("create-recording-path", "true".to_string());
        set("recording-name", session_id.to_string());
        set("ignore-cert", "true".to_string());
        set("width", view.width.to_string());
        set("height", view.height.to_string());
        set("dpi", view.dpi.to_string());
        set("scheme", protocol.to_string());
        set("hostname", hostname.to_string());
        set("port", port.to_string());
        set("username", account.account.clone());
        set("password", account.password.clone());
        set("resize-method", "display-update".to_string());
        set("disable-copy", (!clipboard.copy).to_string());
        set("disable-paste", (!clipboard.paste).to_string());
        Self {
            protocol: protocol.to_string(),
            parameters: p,
        }
    }

    /// Read-only parameter set for attaching to a live connection.
    pub fn monitor(view: Viewport) -> Self {
        let parameters = [
            ("width", view.width.to_string()),
            ("height", view.height.to_string()),
            ("dpi", view.dpi.to_string()),
            ("read-only", "true".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            protocol: String::new(),
            parameters,
        }
    }

    fn param(&self, name: &str) -> String {
        if name.starts_with("VERSION_") {
            return VERSION.to_string();
        }
        self.parameters.get(name).cloned().unwrap_or_default()
    }
}

/// A guacd connection that completed the handshake.
pub struct GuacdTunnel<S> {
    pub connection_id: String,
    reader: InstructionReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
}

impl GuacdTunnel<TcpStream> {
    /// Dial guacd and run the handshake. `connection_id` attaches to an
    /// existing connection instead of selecting a protocol.
    pub async fn connect(
        host: &str,
        port: u16,
        connection_id: Option<&str>,
        config: &GuacdConfig,
    ) -> Result<Self, GuacdError> {
        let addr = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| GuacdError::Timeout)??;
        Self::handshake(stream, connection_id, config).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> GuacdTunnel<S> {
    pub async fn handshake(
        stream: S,
        connection_id: Option<&str>,
        config: &GuacdConfig,
    ) -> Result<Self, GuacdError> {
        let (r, w) = split(stream);
        let mut reader = InstructionReader::new(r);
        let mut writer = BufWriter::new(w);

        let target = connection_id.unwrap_or(&config.protocol);
        write_instruction(&mut writer, &Instruction::new("select", [target])).await?;

        let args = expect(&mut reader, "args").await?;
        let values: Vec<String> = args.args.iter().map(|name| config.param(name)).collect();

        let size = [
            config.param("width"),
            config.param("height"),
            config.param("dpi"),
        ];
        write_instruction(&mut writer, &Instruction::new("size", size)).await?;
        write_instruction(&mut writer, &Instruction::new("audio", ["audio/L8"])).await?;
        write_instruction(&mut writer, &Instruction::new("video", Vec::<String>::new())).await?;
        write_instruction(
            &mut writer,
            &Instruction::new("image", ["image/jpeg", "image/png", "image/webp"]),
        )
        .await?;
        write_instruction(&mut writer, &Instruction::new("connect", values)).await?;

        let ready = expect(&mut reader, "ready").await?;
        let connection_id = ready
            .args
            .into_iter()
            .next()
            .filter(|id| !id.is_empty())
            .ok_or(GuacdError::EmptyConnectionId)?;
        debug!("guacd ready, connection {connection_id}");

        Ok(Self {
            connection_id,
            reader,
            writer,
        })
    }

    pub fn split(self) -> (GuacdReader<S>, GuacdWriter<S>) {
        (
            GuacdReader {
                reader: self.reader,
            },
            GuacdWriter {
                writer: self.writer,
            },
        )
    }
}

/// Output half: one raw instruction per read.
pub struct GuacdReader<S> {
    reader: InstructionReader<ReadHalf<S>>,
}

impl<S: AsyncRead + Unpin> GuacdReader<S> {
    pub async fn read(&mut self) -> Result<String, GuacdError> {
        self.reader.read_raw().await
    }
}

/// Input half: forwards browser instructions verbatim.
pub struct GuacdWriter<S> {
    writer: BufWriter<WriteHalf<S>>,
}

impl<S: AsyncWrite + Unpin> GuacdWriter<S> {
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), GuacdError> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), GuacdError> {
        write_instruction(
            &mut self.writer,
            &Instruction::new("disconnect", Vec::<String>::new()),
        )
        .await
    }
}

async fn write_instruction<W: AsyncWrite + Unpin>(
    w: &mut BufWriter<W>,
    ins: &Instruction,
) -> Result<(), GuacdError> {
    w.write_all(ins.encode().as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

async fn expect<R: AsyncRead + Unpin>(
    reader: &mut InstructionReader<R>,
    opcode: &str,
) -> Result<Instruction, GuacdError> {
    let ins = reader.read().await?;
    if ins.opcode != opcode {
        return Err(GuacdError::Unexpected {
            expected: opcode.to_string(),
            got: ins.opcode,
        });
    }
    Ok(ins)
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    fn account() -> Account {
        Account {
            account: "administrator".into(),
            password: "P@ss".into(),
            ..Account::default()
        }
    }

    fn view() -> Viewport {
        Viewport {
            width: 1280,
            height: 800,
            dpi: 96,
        }
    }

    #[tokio::test]
    async fn test_handshake_answers_args_in_order() {
        let (client, server) = duplex(4096);
        let fake = tokio::spawn(async move {
            let (r, mut w) = split(server);
            let mut reader = InstructionReader::new(r);
            let select = reader.read().await.unwrap();
            assert_eq!(select, Instruction::new("select", ["rdp"]));
            w.write_all(
                b"4.args,7.version,8.hostname,4.port,8.username,8.password,5.width,6.height,3.dpi;",
            )
            .await
            .unwrap();
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(reader.read().await.unwrap());
            }
            w.write_all(b"5.ready,9.$conn-123;").await.unwrap();
            seen
        });

        let config = GuacdConfig::new_session(
            "sess-1",
            "rdp",
            "10.0.0.9",
            3389,
            &account(),
            view(),
            CopyPaste::default(),
        );
        let tunnel = GuacdTunnel::handshake(client, None, &config).await.unwrap();
        assert_eq!(tunnel.connection_id, "$conn-123");

        let seen = fake.await.unwrap();
        let ops: Vec<&str> = seen.iter().map(|i| i.opcode.as_str()).collect();
        assert_eq!(ops, ["size", "audio", "video", "image", "connect"]);
        assert_eq!(seen[0].args, ["1280", "800", "96"]);
        assert_eq!(
            seen[4].args,
            [
                "VERSION_1_5_0",
                "10.0.0.9",
                "3389",
                "administrator",
                "P@ss",
                "1280",
                "800",
                "96"
            ]
        );
    }

    #[tokio::test]
    async fn test_monitor_selects_connection_id() {
        let (client, server) = duplex(4096);
        let fake = tokio::spawn(async move {
            let (r, mut w) = split(server);
            let mut reader = InstructionReader::new(r);
            let select = reader.read().await.unwrap();
            w.write_all(b"4.args,9.read-only,5.width;").await.unwrap();
            let mut last = None;
            for _ in 0..5 {
                last = Some(reader.read().await.unwrap());
            }
            w.write_all(b"5.ready,4.$mon;").await.unwrap();
            (select, last.unwrap())
        });
        let tunnel = GuacdTunnel::handshake(client, Some("$conn-123"), &GuacdConfig::monitor(view()))
            .await
            .unwrap();
        assert_eq!(tunnel.connection_id, "$mon");
        let (select, connect) = fake.await.unwrap();
        assert_eq!(select.args, ["$conn-123"]);
        assert_eq!(connect.args, ["true", "1280"]);
    }

    #[tokio::test]
    async fn test_unexpected_opcode_and_empty_ready() {
        let (client, server) = duplex(1024);
        tokio::spawn(async move {
            let (_r, mut w) = split(server);
            w.write_all(b"5.error,3.bad,3.519;").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        let err = GuacdTunnel::handshake(client, None, &GuacdConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GuacdError::Unexpected { .. }));

        let (client, server) = duplex(1024);
        tokio::spawn(async move {
            let (_r, mut w) = split(server);
            w.write_all(b"4.args;5.ready;").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        let err = GuacdTunnel::handshake(client, None, &GuacdConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GuacdError::EmptyConnectionId));
    }

    #[test]
    fn test_clipboard_policy() {
        let config = GuacdConfig::new_session(
            "s",
            "vnc",
            "h",
            5900,
            &account(),
            view(),
            CopyPaste {
                copy: false,
                paste: true,
            },
        );
        assert_eq!(config.parameters["disable-copy"], "true");
        assert_eq!(config.parameters["disable-paste"], "false");
        assert_eq!(config.parameters["recording-name"], "s");
    }
}
