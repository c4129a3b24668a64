//! BufferSnapshot: structural screen state derived from accumulated PTY
//! bytes via a `vte`-driven parser, plus the binary wire encoding used by
//! the buffer-snapshot WebSocket (spec §3, §4.5).

use vte::{Params, Parser, Perform};

/// One screen cell: code point, colors, attribute flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg: u8,
    pub bg: u8,
    pub attrs: u8,
}

pub const ATTR_BOLD: u8 = 0b0001;
pub const ATTR_ITALIC: u8 = 0b0010;
pub const ATTR_UNDERLINE: u8 = 0b0100;
pub const ATTR_INVERSE: u8 = 0b1000;

impl Default for Cell {
    fn default() -> Self {
        Cell { ch: ' ', fg: 7, bg: 0, attrs: 0 }
    }
}

/// A structural screen state snapshot (spec §3).
#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub viewport_y: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub cells: Vec<Vec<Cell>>,
}

/// Per-session `vte::Perform` implementation tracking cursor and a flat cell
/// grid. Owns its own `vte::Parser` so callers just feed raw PTY bytes.
pub struct ScreenParser {
    parser: Parser,
    handler: ScreenHandler,
}

struct ScreenHandler {
    cols: u16,
    rows: u16,
    cursor_x: u16,
    cursor_y: u16,
    grid: Vec<Vec<Cell>>,
    cur_fg: u8,
    cur_bg: u8,
    cur_attrs: u8,
    dirty: bool,
}

impl ScreenParser {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: Parser::new(),
            handler: ScreenHandler::new(cols, rows),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.handler, bytes);
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.handler.resize(cols, rows);
    }

    /// True if the visible grid changed since the last `snapshot()` call
    /// (used by the fan-out coalescer to decide whether a new frame is due).
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.handler.dirty)
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            cols: self.handler.cols,
            rows: self.handler.rows,
            viewport_y: 0,
            cursor_x: self.handler.cursor_x,
            cursor_y: self.handler.cursor_y,
            cells: self.handler.grid.clone(),
        }
    }
}

impl ScreenHandler {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            cursor_x: 0,
            cursor_y: 0,
            grid: vec![vec![Cell::default(); cols as usize]; rows as usize],
            cur_fg: 7,
            cur_bg: 0,
            cur_attrs: 0,
            dirty: true,
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        let mut new_grid = vec![vec![Cell::default(); cols as usize]; rows as usize];
        for (y, row) in self.grid.iter().enumerate().take(rows as usize) {
            for (x, cell) in row.iter().enumerate().take(cols as usize) {
                new_grid[y][x] = *cell;
            }
        }
        self.grid = new_grid;
        self.cols = cols;
        self.rows = rows;
        self.cursor_x = self.cursor_x.min(cols.saturating_sub(1));
        self.cursor_y = self.cursor_y.min(rows.saturating_sub(1));
        self.dirty = true;
    }

    fn advance_cursor(&mut self) {
        self.cursor_x = self.cursor_x.saturating_add(1);
        if self.cursor_x >= self.cols {
            self.cursor_x = 0;
            self.newline();
        }
    }

    fn newline(&mut self) {
        if self.cursor_y + 1 >= self.rows {
            self.grid.remove(0);
            self.grid.push(vec![Cell::default(); self.cols as usize]);
        } else {
            self.cursor_y += 1;
        }
    }

    fn put_char(&mut self, ch: char) {
        if let Some(row) = self.grid.get_mut(self.cursor_y as usize) {
            if let Some(cell) = row.get_mut(self.cursor_x as usize) {
                *cell = Cell { ch, fg: self.cur_fg, bg: self.cur_bg, attrs: self.cur_attrs };
            }
        }
        self.dirty = true;
    }
}

impl Perform for ScreenHandler {
    fn print(&mut self, c: char) {
        self.put_char(c);
        self.advance_cursor();
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\r' => self.cursor_x = 0,
            b'\n' => self.newline(),
            0x08 => self.cursor_x = self.cursor_x.saturating_sub(1),
            b'\t' => {
                let next_stop = ((self.cursor_x / 8) + 1) * 8;
                self.cursor_x = next_stop.min(self.cols.saturating_sub(1));
            }
            _ => {}
        }
        self.dirty = true;
    }

    fn csi_dispatch(&mut self, params: &Params, _intermediates: &[u8], _ignore: bool, action: char) {
        let param = |idx: usize, default: u16| -> u16 {
            params.iter().nth(idx).and_then(|p| p.first().copied()).filter(|&v| v != 0).unwrap_or(default)
        };
        match action {
            'A' => self.cursor_y = self.cursor_y.saturating_sub(param(0, 1)),
            'B' => self.cursor_y = (self.cursor_y + param(0, 1)).min(self.rows.saturating_sub(1)),
            'C' => self.cursor_x = (self.cursor_x + param(0, 1)).min(self.cols.saturating_sub(1)),
            'D' => self.cursor_x = self.cursor_x.saturating_sub(param(0, 1)),
            'H' | 'f' => {
                self.cursor_y = param(0, 1).saturating_sub(1).min(self.rows.saturating_sub(1));
                self.cursor_x = param(1, 1).saturating_sub(1).min(self.cols.saturating_sub(1));
            }
            'm' => self.apply_sgr(params),
            'J' if param(0, 0) == 2 => {
                self.grid = vec![vec![Cell::default(); self.cols as usize]; self.rows as usize];
            }
            _ => {}
        }
        self.dirty = true;
    }

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}
    fn hook(&mut self, _p: &Params, _i: &[u8], _ignore: bool, _a: char) {}
    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}
    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

impl ScreenHandler {
    fn apply_sgr(&mut self, params: &Params) {
        let values: Vec<u16> = params.iter().map(|p| p.first().copied().unwrap_or(0)).collect();
        if values.is_empty() {
            self.cur_attrs = 0;
            self.cur_fg = 7;
            self.cur_bg = 0;
            return;
        }
        for &v in &values {
            match v {
                0 => {
                    self.cur_attrs = 0;
                    self.cur_fg = 7;
                    self.cur_bg = 0;
                }
                1 => self.cur_attrs |= ATTR_BOLD,
                3 => self.cur_attrs |= ATTR_ITALIC,
                4 => self.cur_attrs |= ATTR_UNDERLINE,
                7 => self.cur_attrs |= ATTR_INVERSE,
                30..=37 => self.cur_fg = (v - 30) as u8,
                40..=47 => self.cur_bg = (v - 40) as u8,
                90..=97 => self.cur_fg = (v - 90 + 8) as u8,
                100..=107 => self.cur_bg = (v - 100 + 8) as u8,
                _ => {}
            }
        }
    }
}

const SNAPSHOT_MAGIC: u8 = 0xBF;

/// Encode the server → client binary frame: magic byte, 4-byte LE session-id
/// length, session id bytes, then the session-local RLE cell grid (spec §4.5).
pub fn encode_frame(session_id: &str, snapshot: &BufferSnapshot) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(SNAPSHOT_MAGIC);
    let id_bytes = session_id.as_bytes();
    out.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(&snapshot.cols.to_le_bytes());
    out.extend_from_slice(&snapshot.rows.to_le_bytes());
    out.extend_from_slice(&snapshot.viewport_y.to_le_bytes());
    out.extend_from_slice(&snapshot.cursor_x.to_le_bytes());
    out.extend_from_slice(&snapshot.cursor_y.to_le_bytes());
    encode_rle_grid(&snapshot.cells, &mut out);
    out
}

fn encode_rle_grid(cells: &[Vec<Cell>], out: &mut Vec<u8>) {
    for row in cells {
        let mut i = 0;
        while i < row.len() {
            let cell = row[i];
            let mut run = 1u32;
            while i + (run as usize) < row.len() && row[i + run as usize] == cell {
                run += 1;
            }
            out.extend_from_slice(&run.to_le_bytes());
            out.extend_from_slice(&(cell.ch as u32).to_le_bytes());
            out.push(cell.fg);
            out.push(cell.bg);
            out.push(cell.attrs);
            i += run as usize;
        }
        // Row terminator: a zero-length run.
        out.extend_from_slice(&0u32.to_le_bytes());
    }
}

/// Decode a frame produced by `encode_frame`, for tests and for clients
/// implemented in Rust (e.g. the `vt` CLI's debug tooling).
pub fn decode_frame(data: &[u8]) -> Option<(String, BufferSnapshot)> {
    if data.first() != Some(&SNAPSHOT_MAGIC) {
        return None;
    }
    let mut pos = 1usize;
    let id_len = u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?) as usize;
    pos += 4;
    let session_id = std::str::from_utf8(data.get(pos..pos + id_len)?).ok()?.to_string();
    pos += id_len;
    let cols = u16::from_le_bytes(data.get(pos..pos + 2)?.try_into().ok()?);
    pos += 2;
    let rows = u16::from_le_bytes(data.get(pos..pos + 2)?.try_into().ok()?);
    pos += 2;
    let viewport_y = u16::from_le_bytes(data.get(pos..pos + 2)?.try_into().ok()?);
    pos += 2;
    let cursor_x = u16::from_le_bytes(data.get(pos..pos + 2)?.try_into().ok()?);
    pos += 2;
    let cursor_y = u16::from_le_bytes(data.get(pos..pos + 2)?.try_into().ok()?);
    pos += 2;

    let mut cells = Vec::with_capacity(rows as usize);
    for _ in 0..rows {
        let mut row = Vec::with_capacity(cols as usize);
        loop {
            let run = u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
            pos += 4;
            if run == 0 {
                break;
            }
            let ch = u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
            pos += 4;
            let fg = *data.get(pos)?;
            pos += 1;
            let bg = *data.get(pos)?;
            pos += 1;
            let attrs = *data.get(pos)?;
            pos += 1;
            let cell = Cell { ch: char::from_u32(ch).unwrap_or(' '), fg, bg, attrs };
            for _ in 0..run {
                row.push(cell);
            }
        }
        cells.push(row);
    }
    Some((session_id, BufferSnapshot { cols, rows, viewport_y, cursor_x, cursor_y, cells }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_text_lands_at_cursor() {
        let mut p = ScreenParser::new(10, 3);
        p.feed(b"hi");
        let snap = p.snapshot();
        assert_eq!(snap.cells[0][0].ch, 'h');
        assert_eq!(snap.cells[0][1].ch, 'i');
        assert_eq!(snap.cursor_x, 2);
    }

    #[test]
    fn cursor_position_csi_moves_cursor() {
        let mut p = ScreenParser::new(10, 5);
        p.feed(b"\x1b[3;4Hx");
        let snap = p.snapshot();
        assert_eq!(snap.cells[2][3].ch, 'x');
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut p = ScreenParser::new(4, 2);
        p.feed(b"ab\r\ncd");
        let snap = p.snapshot();
        let encoded = encode_frame("sess-1", &snap);
        let (id, decoded) = decode_frame(&encoded).unwrap();
        assert_eq!(id, "sess-1");
        assert_eq!(decoded.cols, snap.cols);
        assert_eq!(decoded.rows, snap.rows);
        assert_eq!(decoded.cells[0][0].ch, 'a');
        assert_eq!(decoded.cells[1][0].ch, 'c');
    }

    #[test]
    fn invalid_magic_is_rejected() {
        assert!(decode_frame(&[0x00, 1, 2, 3]).is_none());
    }
}
