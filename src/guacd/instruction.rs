//! Guacamole instruction framing.
//!
//! An instruction is a comma-separated list of `LENGTH.VALUE` elements
//! terminated by `;`, where the first element is the opcode. `LENGTH` counts
//! Unicode scalar values, not bytes, so values may contain `,` `.` or `;`.

use std::fmt;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use super::GuacdError;

/// Upper bound on a single element; guards against a corrupt length prefix.
const MAX_ELEMENT_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new<I, S>(opcode: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcode: opcode.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse exactly one instruction. Trailing input after `;` is an error.
    pub fn parse(raw: &str) -> Result<Self, GuacdError> {
        let mut elements = Vec::new();
        let mut rest = raw;
        loop {
            let (len, after) = rest
                .split_once('.')
                .ok_or_else(|| GuacdError::Malformed(raw.to_string()))?;
            let len: usize = len
                .parse()
                .map_err(|_| GuacdError::Malformed(raw.to_string()))?;
            let end = after
                .char_indices()
                .nth(len)
                .map_or(after.len(), |(i, _)| i);
            if after[..end].chars().count() != len {
                return Err(GuacdError::Malformed(raw.to_string()));
            }
            elements.push(after[..end].to_string());
            let mut tail = after[end..].chars();
            match tail.next() {
                Some(',') => rest = tail.as_str(),
                Some(';') if tail.as_str().is_empty() => break,
                _ => return Err(GuacdError::Malformed(raw.to_string())),
            }
        }
        let mut it = elements.into_iter();
        let opcode = it.next().unwrap_or_default();
        Ok(Self {
            opcode,
            args: it.collect(),
        })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.opcode.chars().count(), self.opcode)?;
        for arg in &self.args {
            write!(f, ",{}.{}", arg.chars().count(), arg)?;
        }
        f.write_str(";")
    }
}

/// Reads whole instructions off a byte stream.
pub struct InstructionReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> InstructionReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read one instruction and return its raw wire text.
    pub async fn read_raw(&mut self) -> Result<String, GuacdError> {
        let mut raw = String::new();
        loop {
            let mut len_buf = Vec::new();
            let n = self.inner.read_until(b'.', &mut len_buf).await?;
            if n == 0 {
                return Err(GuacdError::Closed);
            }
            if len_buf.last() != Some(&b'.') {
                return Err(GuacdError::Closed);
            }
            let digits = std::str::from_utf8(&len_buf[..len_buf.len() - 1])
                .map_err(|_| GuacdError::Malformed(raw.clone()))?;
            let len: usize = digits
                .trim_start()
                .parse()
                .map_err(|_| GuacdError::Malformed(format!("{raw}{digits}")))?;
            if len > MAX_ELEMENT_LEN {
                return Err(GuacdError::Malformed(format!("element length {len}")));
            }
            raw.push_str(digits.trim_start());
            raw.push('.');

            let mut value = Vec::with_capacity(len);
            for _ in 0..len {
                let first = self.inner.read_u8().await?;
                value.push(first);
                for _ in 1..utf8_width(first) {
                    value.push(self.inner.read_u8().await?);
                }
            }
            let value =
                String::from_utf8(value).map_err(|_| GuacdError::Malformed(raw.clone()))?;
            raw.push_str(&value);

            let term = self.inner.read_u8().await?;
            raw.push(char::from(term));
            match term {
                b',' => {}
                b';' => return Ok(raw),
                _ => return Err(GuacdError::Malformed(raw)),
            }
        }
    }

    pub async fn read(&mut self) -> Result<Instruction, GuacdError> {
        let raw = self.read_raw().await?;
        Instruction::parse(&raw)
    }
}

fn utf8_width(first: u8) -> usize {
    match first {
        0xF0..=0xF7 => 4,
        0xE0..=0xEF => 3,
        0xC0..=0xDF => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let ins = Instruction::new("select", ["rdp"]);
        assert_eq!(ins.encode(), "6.select,3.rdp;");
        assert_eq!(Instruction::new("video", Vec::<String>::new()).encode(), "5.video;");
    }

    #[test]
    fn test_parse_roundtrip_with_delimiters_in_values() {
        let ins = Instruction::new("key", ["a,b", "x.y;z", "", "héllo"]);
        assert_eq!(Instruction::parse(&ins.encode()).unwrap(), ins);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(Instruction::parse("6.select,9.rdp;").is_err());
        assert!(Instruction::parse("6.select,3.rdp").is_err());
        assert!(Instruction::parse("x.select;").is_err());
        assert!(Instruction::parse("6.select;junk").is_err());
    }

    #[tokio::test]
    async fn test_reader_splits_stream() {
        let wire = "4.args,7.version,8.hostname;5.ready,9.$abc-1;2.é€,1.;;";
        let mut reader = InstructionReader::new(wire.as_bytes());
        let args = reader.read().await.unwrap();
        assert_eq!(args.opcode, "args");
        assert_eq!(args.args, vec!["version", "hostname"]);
        assert_eq!(reader.read_raw().await.unwrap(), "5.ready,9.$abc-1;");
        let odd = reader.read().await.unwrap();
        assert_eq!(odd.opcode, "é€");
        assert_eq!(odd.args, vec![";"]);
        assert!(matches!(reader.read().await, Err(GuacdError::Closed)));
    }
}
