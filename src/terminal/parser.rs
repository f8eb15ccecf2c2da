//! Command reconstruction and forbidden-command enforcement.
//!
//! The parser sees both directions of a terminal session. Keystrokes tell it
//! when a command is submitted; the rendered screen tells it what the command
//! line actually looked like (history recall, tab completion) and what the
//! command printed. One mutex serializes [`CommandParser::add_input`] and
//! [`CommandParser::add_output`].

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::screen::Emulator;
use crate::model::{CmdLevel, Command, SessionCmd};

const ENTER_MARKS: [&[u8]; 5] = [
    b"\x1b[?1049h",
    b"\x1b[?1048h",
    b"\x1b[?1047h",
    b"\x1b[?47h",
    b"\x1b[?25l",
];
const EXIT_MARKS: [&[u8]; 5] = [
    b"\x1b[?1049l",
    b"\x1b[?1048l",
    b"\x1b[?1047l",
    b"\x1b[?47l",
    b"\x1b[?25h",
];
/// Sequences that repaint a fresh line rather than open an editor.
const SCREEN_MARKS: [&[u8]; 2] = [b"\x1b[K\r\n", b"\x1b[4l"];
const TAIL_KEEP: usize = 16;

/// Dim/gray SGR sequences CLIs use for inline completion hints.
pub const DEFAULT_SCRUB_MARKERS: [&str; 4] = ["\x1b[0;90;49m", "\x1b[90m", "\x1b[2m", "\x1b[37m"];
const SCRUB_ENDS: [&[u8]; 4] = [b"\x1b[0m", b"\x1b[m", b"\x1b[39m", b"\x1b[22m"];

/// A compiled forbidden-command rule.
#[derive(Debug, Clone)]
pub struct ForbiddenRule {
    text: String,
    regex: Option<Regex>,
}

impl ForbiddenRule {
    pub fn literal(text: &str) -> Self {
        Self {
            text: text.to_string(),
            regex: None,
        }
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            text: pattern.to_string(),
            regex: Some(Regex::new(pattern)?),
        })
    }

    /// Compile enabled commands, skipping patterns that do not compile.
    pub fn compile(cmds: &[Command]) -> Vec<Self> {
        cmds.iter()
            .filter(|c| c.enable && !c.cmd.is_empty())
            .filter_map(|c| {
                if !c.is_re {
                    return Some(Self::literal(&c.cmd));
                }
                match Self::regex(&c.cmd) {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        warn!("Skipping forbidden command {}: {e}", c.id);
                        None
                    }
                }
            })
            .collect()
    }

    fn matches(&self, cmd: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(cmd),
            None => cmd.contains(&self.text),
        }
    }

    /// Text shown to the user when the rule fires.
    pub fn label(&self) -> String {
        if self.regex.is_some() {
            format!("Regex: {}", self.text)
        } else {
            self.text.clone()
        }
    }
}

/// A forbidden command found in a keystroke frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    /// Label of the rule that fired.
    pub label: String,
    /// Length of the frame prefix holding the commands submitted before the
    /// forbidden one. Only that prefix may be forwarded.
    pub allowed: usize,
}

/// Construction parameters for a [`CommandParser`].
#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub width: usize,
    pub height: usize,
    /// SSH keeps every result line; other CLIs drop the echoed first line.
    pub ssh: bool,
    /// Completion-hint markers scrubbed from non-SSH output.
    pub scrub_markers: Vec<String>,
}

pub struct CommandParser {
    session_id: String,
    audit: mpsc::UnboundedSender<SessionCmd>,
    state: Mutex<State>,
}

struct State {
    emu: Emulator,
    rules: Vec<ForbiddenRule>,
    ssh: bool,
    scrubber: Option<Scrubber>,
    tail: Vec<u8>,
    input: Vec<u8>,
    in_escape: Escape,
    is_prompt: bool,
    prompt: String,
    edit: bool,
    cur_cmd: String,
    last_cmd: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Start,
    Sequence,
}

impl CommandParser {
    pub fn new(
        session_id: &str,
        opts: &ParserOptions,
        rules: Vec<ForbiddenRule>,
        audit: mpsc::UnboundedSender<SessionCmd>,
    ) -> Self {
        let scrubber = (!opts.ssh && !opts.scrub_markers.is_empty())
            .then(|| Scrubber::new(&opts.scrub_markers));
        Self {
            session_id: session_id.to_string(),
            audit,
            state: Mutex::new(State {
                emu: Emulator::new(opts.width, opts.height),
                rules,
                ssh: opts.ssh,
                scrubber,
                tail: Vec::new(),
                input: Vec::new(),
                in_escape: Escape::None,
                is_prompt: true,
                prompt: String::new(),
                edit: false,
                cur_cmd: String::new(),
                last_cmd: String::new(),
            }),
        }
    }

    /// Feed client keystrokes. A frame may submit several commands; the
    /// first forbidden one stops processing and everything from it on must
    /// not be forwarded.
    pub fn add_input(&self, bytes: &[u8]) -> Option<Blocked> {
        let mut st = self.state.lock();
        if st.edit {
            return None;
        }
        if st.is_prompt {
            let lines = st.lines();
            if let Some(ps1) = lines.last() {
                st.prompt.clone_from(ps1);
            }
            self.flush_record(&mut st, &lines);
            st.is_prompt = false;
        }

        // Lossy decoding keeps every CR, so counting them maps chars back to
        // byte offsets.
        let mut crs = 0;
        let mut crs_submitted = 0;
        for ch in String::from_utf8_lossy(bytes).chars() {
            st.input.extend_from_slice(ch.to_string().as_bytes());
            if ch == '\r' {
                crs += 1;
            }
            match (st.in_escape, ch) {
                (Escape::None, '\x1b') => st.in_escape = Escape::Start,
                (Escape::Start, '[' | 'O') => st.in_escape = Escape::Sequence,
                (Escape::Start, _) => st.in_escape = Escape::None,
                (Escape::Sequence, c) => {
                    if ('\x40'..='\x7e').contains(&c) {
                        st.in_escape = Escape::None;
                    }
                }
                (Escape::None, '\r') => {
                    if let Some(label) = self.submit(&mut st) {
                        return Some(Blocked {
                            label,
                            allowed: through_nth_cr(bytes, crs_submitted),
                        });
                    }
                    crs_submitted = crs;
                }
                (Escape::None, '\x08' | '\x7f') => {
                    st.cur_cmd.pop();
                }
                (Escape::None, '\x15' | '\x03') => st.cur_cmd.clear(),
                (Escape::None, c) if !c.is_control() => st.cur_cmd.push(c),
                _ => {}
            }
        }
        None
    }

    /// Feed target output.
    pub fn add_output(&self, bytes: &[u8]) {
        let mut st = self.state.lock();
        st.track_edit_mode(bytes);
        let filtered;
        let bytes = match st.scrubber.as_mut() {
            Some(s) => {
                filtered = s.filter(bytes);
                &filtered[..]
            }
            None => bytes,
        };
        st.emu.feed(bytes);
    }

    pub fn resize(&self, width: usize, height: usize) {
        self.state.lock().emu.resize(width, height);
    }

    #[cfg(test)]
    pub fn size(&self) -> (usize, usize) {
        self.state.lock().emu.size()
    }

    pub fn is_edit(&self) -> bool {
        self.state.lock().edit
    }

    pub fn prompt(&self) -> String {
        self.state.lock().prompt.clone()
    }

    /// Emit the record for the last command, if any, as if a prompt followed.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.last_cmd.is_empty() {
            return;
        }
        let prompt = st.prompt.clone();
        st.emu.feed(format!("\r\n{prompt}").as_bytes());
        let lines = st.lines();
        self.flush_record(&mut st, &lines);
    }

    fn submit(&self, st: &mut State) -> Option<String> {
        let typed = st.cur_cmd.trim().to_string();
        let shown = st
            .lines()
            .last()
            .and_then(|line| line.strip_prefix(st.prompt.as_str()).map(str::trim))
            .unwrap_or_default()
            .to_string();
        let cmd = if shown.is_empty() { typed.clone() } else { shown };

        st.is_prompt = true;
        st.cur_cmd.clear();
        st.reset();

        // An earlier command of the same frame never saw its output.
        let earlier = std::mem::take(&mut st.last_cmd);
        if !earlier.is_empty() {
            self.emit(earlier, String::new(), CmdLevel::Normal);
        }

        let hit = st
            .rules
            .iter()
            .find(|r| r.matches(&cmd) || (!typed.is_empty() && r.matches(&typed)));
        if let Some(rule) = hit {
            let label = rule.label();
            debug!("Session {} blocked command {cmd:?}", self.session_id);
            self.emit(cmd, String::new(), CmdLevel::Blocked);
            return Some(label);
        }
        st.last_cmd = cmd;
        None
    }

    fn flush_record(&self, st: &mut State, lines: &[String]) {
        let cmd = std::mem::take(&mut st.last_cmd);
        if cmd.is_empty() {
            return;
        }
        let n = lines.len();
        let result = if st.ssh && n > 1 {
            lines[..n - 1].join("\n")
        } else if !st.ssh && n > 2 {
            lines[1..n - 1].join("\n")
        } else {
            String::new()
        };
        self.emit(cmd, result.trim().to_string(), CmdLevel::Normal);
    }

    fn emit(&self, cmd: String, result: String, level: CmdLevel) {
        let rec = SessionCmd {
            session_id: self.session_id.clone(),
            cmd,
            result,
            level,
            created_at: Utc::now(),
        };
        if self.audit.send(rec).is_err() {
            debug!("Session {} audit channel closed", self.session_id);
        }
    }
}

impl State {
    /// Rendered lines with trailing blank rows dropped.
    fn lines(&self) -> Vec<String> {
        let mut lines = self.emu.display();
        while lines.last().is_some_and(String::is_empty) {
            lines.pop();
        }
        lines
    }

    fn reset(&mut self) {
        self.emu.reset();
        self.input.clear();
    }

    fn track_edit_mode(&mut self, bytes: &[u8]) {
        self.tail.extend_from_slice(bytes);
        if !self.edit && contains_any(&self.tail, &ENTER_MARKS) && !contains_any(&self.tail, &SCREEN_MARKS) {
            self.edit = true;
            self.tail.clear();
        } else if self.edit && contains_any(&self.tail, &EXIT_MARKS) {
            self.edit = false;
            self.tail.clear();
            self.reset();
            self.cur_cmd.clear();
        }
        if self.tail.len() > TAIL_KEEP {
            let cut = self.tail.len() - TAIL_KEEP;
            self.tail.drain(..cut);
        }
    }
}

/// Length of `bytes` through its `n`th carriage return; zero for `n == 0`.
fn through_nth_cr(bytes: &[u8], n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\r')
        .nth(n - 1)
        .map_or(0, |(i, _)| i + 1)
}

fn contains_any(hay: &[u8], needles: &[&[u8]]) -> bool {
    needles
        .iter()
        .any(|n| hay.windows(n.len()).any(|w| w == *n))
}

/// Streaming filter dropping bytes from a marker up to the next SGR reset or
/// line break. Works across calls so markers split over frames still match.
struct Scrubber {
    markers: Vec<Vec<u8>>,
    pending: Vec<u8>,
    active: bool,
}

impl Scrubber {
    fn new(markers: &[String]) -> Self {
        Self {
            markers: markers.iter().map(|m| m.as_bytes().to_vec()).collect(),
            pending: Vec::new(),
            active: false,
        }
    }

    fn filter(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            if self.active {
                if b == b'\r' || b == b'\n' {
                    self.active = false;
                    self.pending.clear();
                    out.push(b);
                    continue;
                }
                self.pending.push(b);
                if SCRUB_ENDS.iter().any(|e| self.pending.ends_with(e)) {
                    self.active = false;
                    self.pending.clear();
                } else {
                    keep_prefix_suffix(&mut self.pending, SCRUB_ENDS.iter().copied());
                }
                continue;
            }

            self.pending.push(b);
            if self.markers.iter().any(|m| *m == self.pending) {
                self.active = true;
                self.pending.clear();
                continue;
            }
            let markers = self.markers.iter().map(Vec::as_slice);
            let start = prefix_suffix_start(&self.pending, markers);
            out.extend_from_slice(&self.pending[..start]);
            self.pending.drain(..start);
        }
        out
    }
}

/// Index of the earliest suffix of `buf` that is a prefix of some needle.
fn prefix_suffix_start<'a>(buf: &[u8], needles: impl Iterator<Item = &'a [u8]> + Clone) -> usize {
    (0..buf.len())
        .find(|&i| needles.clone().any(|n| n.starts_with(&buf[i..])))
        .unwrap_or(buf.len())
}

fn keep_prefix_suffix<'a>(buf: &mut Vec<u8>, needles: impl Iterator<Item = &'a [u8]> + Clone) {
    let start = prefix_suffix_start(buf, needles);
    buf.drain(..start);
}
