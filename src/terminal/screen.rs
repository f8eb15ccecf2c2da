//! In-memory character grid driven by a VT byte stream.
//!
//! Only what is needed to know what the user sees on the current line:
//! printing with autowrap, cursor motion, erase, insert/delete, scrolling and
//! the alternate screen. Colors and attributes are dropped.

use vte::{Params, Parser, Perform};

use crate::sessions::{MAX_COLS, MAX_ROWS};

const TAB: usize = 8;

/// A `width` x `height` grid plus cursor.
pub struct Screen {
    width: usize,
    height: usize,
    rows: Vec<Vec<char>>,
    x: usize,
    y: usize,
    pending_wrap: bool,
    saved: (usize, usize),
    main: Option<(Vec<Vec<char>>, usize, usize)>,
}

impl Screen {
    pub fn new(width: usize, height: usize) -> Self {
        let width = width.clamp(1, usize::from(MAX_COLS));
        let height = height.clamp(1, usize::from(MAX_ROWS));
        Self {
            width,
            height,
            rows: vec![vec![' '; width]; height],
            x: 0,
            y: 0,
            pending_wrap: false,
            saved: (0, 0),
            main: None,
        }
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Resize keeping the top-left content. Zero dimensions are ignored.
    pub fn resize(&mut self, width: usize, height: usize) {
        if width == 0 || height == 0 {
            return;
        }
        let width = width.min(usize::from(MAX_COLS));
        let height = height.min(usize::from(MAX_ROWS));
        for row in &mut self.rows {
            row.resize(width, ' ');
        }
        if height < self.rows.len() {
            let drop = self.rows.len() - height;
            let cut = drop.min(self.y);
            self.rows.drain(..cut);
            self.rows.truncate(height);
            self.y -= cut;
        }
        self.rows.resize(height, vec![' '; width]);
        self.width = width;
        self.height = height;
        self.x = self.x.min(width - 1);
        self.y = self.y.min(height - 1);
        self.pending_wrap = false;
        self.main = None;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.width, self.height);
    }

    /// Rendered rows with trailing blanks trimmed.
    pub fn display(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.iter().collect::<String>().trim_end().to_string())
            .collect()
    }

    fn blank(&self) -> Vec<char> {
        vec![' '; self.width]
    }

    fn linefeed(&mut self) {
        if self.y + 1 >= self.height {
            self.scroll_up(1);
        } else {
            self.y += 1;
        }
    }

    fn scroll_up(&mut self, n: usize) {
        let blank = self.blank();
        for _ in 0..n.min(self.height) {
            self.rows.remove(0);
            self.rows.push(blank.clone());
        }
    }

    fn scroll_down(&mut self, n: usize) {
        let blank = self.blank();
        for _ in 0..n.min(self.height) {
            self.rows.pop();
            self.rows.insert(0, blank.clone());
        }
    }

    fn reverse_index(&mut self) {
        if self.y == 0 {
            self.scroll_down(1);
        } else {
            self.y -= 1;
        }
    }

    fn goto(&mut self, x: usize, y: usize) {
        self.x = x.min(self.width - 1);
        self.y = y.min(self.height - 1);
        self.pending_wrap = false;
    }

    fn erase_display(&mut self, mode: u16) {
        match mode {
            0 => {
                self.erase_line(0);
                let blank = self.blank();
                for row in &mut self.rows[self.y + 1..] {
                    row.clone_from(&blank);
                }
            }
            1 => {
                self.erase_line(1);
                let blank = self.blank();
                for row in &mut self.rows[..self.y] {
                    row.clone_from(&blank);
                }
            }
            _ => {
                let blank = self.blank();
                for row in &mut self.rows {
                    row.clone_from(&blank);
                }
            }
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let (from, to) = match mode {
            0 => (self.x, self.width),
            1 => (0, self.x + 1),
            _ => (0, self.width),
        };
        let row = &mut self.rows[self.y];
        for c in &mut row[from..to.min(self.width)] {
            *c = ' ';
        }
    }

    fn enter_alternate(&mut self) {
        if self.main.is_none() {
            let fresh = vec![self.blank(); self.height];
            let rows = std::mem::replace(&mut self.rows, fresh);
            self.main = Some((rows, self.x, self.y));
        }
    }

    fn leave_alternate(&mut self) {
        if let Some((rows, x, y)) = self.main.take() {
            self.rows = rows;
            self.goto(x, y);
        }
    }
}

fn arg(params: &Params, idx: usize, default: u16) -> u16 {
    params
        .iter()
        .nth(idx)
        .and_then(|p| p.first().copied())
        .filter(|v| *v != 0)
        .unwrap_or(default)
}

fn mode(params: &Params) -> u16 {
    params
        .iter()
        .next()
        .and_then(|p| p.first().copied())
        .unwrap_or(0)
}

impl Perform for Screen {
    fn print(&mut self, c: char) {
        if self.pending_wrap {
            self.x = 0;
            self.linefeed();
            self.pending_wrap = false;
        }
        self.rows[self.y][self.x] = c;
        if self.x + 1 >= self.width {
            self.pending_wrap = true;
        } else {
            self.x += 1;
        }
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | 0x0b | 0x0c => self.linefeed(),
            b'\r' => self.x = 0,
            0x08 => self.x = self.x.saturating_sub(1),
            b'\t' => self.x = ((self.x / TAB + 1) * TAB).min(self.width - 1),
            _ => return,
        }
        self.pending_wrap = false;
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let private = intermediates.first() == Some(&b'?');
        let n = usize::from(arg(params, 0, 1));
        match (private, action) {
            (false, 'A') => self.goto(self.x, self.y.saturating_sub(n)),
            (false, 'B' | 'e') => self.goto(self.x, self.y + n),
            (false, 'C' | 'a') => self.goto(self.x + n, self.y),
            (false, 'D') => self.goto(self.x.saturating_sub(n), self.y),
            (false, 'E') => self.goto(0, self.y + n),
            (false, 'F') => self.goto(0, self.y.saturating_sub(n)),
            (false, 'G' | '`') => self.goto(n - 1, self.y),
            (false, 'd') => self.goto(self.x, n - 1),
            (false, 'H' | 'f') => {
                let col = usize::from(arg(params, 1, 1));
                self.goto(col - 1, n - 1);
            }
            (false, 'J') => self.erase_display(mode(params)),
            (false, 'K') => self.erase_line(mode(params)),
            (false, 'P') => {
                let (x, w) = (self.x, self.width);
                let row = &mut self.rows[self.y];
                let n = n.min(w - x);
                row.drain(x..x + n);
                row.resize(w, ' ');
            }
            (false, '@') => {
                let (x, w) = (self.x, self.width);
                let row = &mut self.rows[self.y];
                for _ in 0..n.min(w - x) {
                    row.insert(x, ' ');
                }
                row.truncate(w);
            }
            (false, 'X') => {
                let (x, w) = (self.x, self.width);
                for c in &mut self.rows[self.y][x..(x + n).min(w)] {
                    *c = ' ';
                }
            }
            (false, 'L') => {
                let blank = self.blank();
                for _ in 0..n.min(self.height - self.y) {
                    self.rows.pop();
                    self.rows.insert(self.y, blank.clone());
                }
            }
            (false, 'M') => {
                let blank = self.blank();
                for _ in 0..n.min(self.height - self.y) {
                    self.rows.remove(self.y);
                    self.rows.push(blank.clone());
                }
            }
            (false, 'S') => self.scroll_up(n),
            (false, 'T') => self.scroll_down(n),
            (false, 's') => self.saved = (self.x, self.y),
            (false, 'u') => self.goto(self.saved.0, self.saved.1),
            (true, 'h' | 'l') => {
                let alt = params
                    .iter()
                    .any(|p| matches!(p.first(), Some(1049 | 1047 | 47)));
                if alt && action == 'h' {
                    self.saved = (self.x, self.y);
                    self.enter_alternate();
                } else if alt {
                    self.leave_alternate();
                }
            }
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        if !intermediates.is_empty() {
            return;
        }
        match byte {
            b'7' => self.saved = (self.x, self.y),
            b'8' => self.goto(self.saved.0, self.saved.1),
            b'D' => self.linefeed(),
            b'E' => {
                self.x = 0;
                self.linefeed();
            }
            b'M' => self.reverse_index(),
            b'c' => self.reset(),
            _ => {}
        }
    }
}

/// A [`Screen`] plus the escape-sequence state machine feeding it.
pub struct Emulator {
    parser: Parser,
    screen: Screen,
}

impl Emulator {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            parser: Parser::new(),
            screen: Screen::new(width, height),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.parser.advance(&mut self.screen, *b);
        }
    }

    pub fn display(&self) -> Vec<String> {
        self.screen.display()
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.screen.resize(width, height);
    }

    pub fn reset(&mut self) {
        self.parser = Parser::new();
        self.screen.reset();
    }

    pub fn size(&self) -> (usize, usize) {
        self.screen.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(w: usize, h: usize, input: &[u8]) -> Vec<String> {
        let mut emu = Emulator::new(w, h);
        emu.feed(input);
        emu.display()
    }

    #[test]
    fn test_print_and_newline() {
        let lines = render(20, 3, b"hello\r\nworld");
        assert_eq!(lines, ["hello", "world", ""]);
    }

    #[test]
    fn test_backspace_overwrite() {
        let lines = render(20, 2, b"lss\x08 \x08");
        assert_eq!(lines[0], "ls");
    }

    #[test]
    fn test_scrolls_at_bottom() {
        let lines = render(10, 2, b"a\r\nb\r\nc");
        assert_eq!(lines, ["b", "c"]);
    }

    #[test]
    fn test_autowrap() {
        let lines = render(4, 3, b"abcdef");
        assert_eq!(lines, ["abcd", "ef", ""]);
    }

    #[test]
    fn test_cursor_and_erase() {
        let lines = render(20, 3, b"hello world\x1b[1;7H\x1b[K");
        assert_eq!(lines[0], "hello");
        let lines = render(20, 3, b"one\r\ntwo\x1b[2J\x1b[Hx");
        assert_eq!(lines, ["x", "", ""]);
    }

    #[test]
    fn test_alternate_screen_restores() {
        let lines = render(20, 3, b"$ vim\x1b[?1049h\x1b[Hediting\x1b[?1049l");
        assert_eq!(lines[0], "$ vim");
    }

    #[test]
    fn test_colors_are_dropped() {
        let lines = render(20, 1, b"\x1b[01;32mroot\x1b[0m:~# ");
        assert_eq!(lines[0], "root:~#");
    }

    #[test]
    fn test_zero_resize_ignored() {
        let mut emu = Emulator::new(10, 2);
        emu.feed(b"abc");
        emu.resize(0, 5);
        emu.resize(7, 0);
        assert_eq!(emu.size(), (10, 2));
        emu.feed(b"d");
        assert_eq!(emu.display()[0], "abcd");
    }

    #[test]
    fn test_oversized_grid_is_capped() {
        let mut emu = Emulator::new(100_000, 100_000);
        assert_eq!(
            emu.size(),
            (usize::from(MAX_COLS), usize::from(MAX_ROWS))
        );
        emu = Emulator::new(80, 24);
        emu.feed(b"$ ls");
        emu.resize(65_535, 65_535);
        assert_eq!(
            emu.size(),
            (usize::from(MAX_COLS), usize::from(MAX_ROWS))
        );
        assert_eq!(emu.display()[0], "$ ls");
    }

    #[test]
    fn test_shrink_keeps_cursor_row() {
        let mut emu = Emulator::new(10, 4);
        emu.feed(b"a\r\nb\r\nc\r\nd");
        emu.resize(10, 2);
        assert_eq!(emu.display(), ["c", "d"]);
        emu.feed(b"!");
        assert_eq!(emu.display(), ["c", "d!"]);
    }
}
