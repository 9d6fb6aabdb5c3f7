use crate::frame::Frame;
use crate::pipeline::FrameSink;
use std::io::Write;

/// Draws frames into the terminal with U+2580 half-blocks: each cell shows
/// two pixels, foreground color for the top and background for the bottom.
/// Frames are nearest-neighbor resampled to whatever size the terminal
/// currently has, so the pipeline resolution is independent of the window.
pub struct TerminalSink<W: Write> {
    out: W,
    cols: usize,
    rows: usize,
    hud: String,
    last_fg: Option<(u8, u8, u8)>,
    last_bg: Option<(u8, u8, u8)>,
}

/// Rows at the bottom reserved for the status line.
const HUD_ROWS: usize = 1;

impl<W: Write> TerminalSink<W> {
    pub fn new(out: W, cols: u16, rows: u16) -> Self {
        Self {
            out,
            cols: cols as usize,
            rows: rows as usize,
            hud: String::new(),
            last_fg: None,
            last_bg: None,
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols as usize;
        self.rows = rows as usize;
    }

    pub fn set_hud(&mut self, hud: String) {
        self.hud = hud;
    }

    fn pixel(frame: &Frame, x: usize, y: usize) -> (u8, u8, u8) {
        let i = (y * frame.width + x) * 4;
        (frame.data[i], frame.data[i + 1], frame.data[i + 2])
    }
}

impl<W: Write> FrameSink for TerminalSink<W> {
    fn submit(&mut self, frame: Frame) -> anyhow::Result<()> {
        let visual_rows = self.rows.saturating_sub(HUD_ROWS);
        if self.cols == 0 || visual_rows == 0 || frame.width == 0 || frame.height == 0 {
            return Ok(());
        }
        let out_h = visual_rows * 2;

        self.out.write_all(b"\x1b[H\x1b[0m")?;
        // Autowrap off while painting full-width rows; otherwise the last
        // column wraps and the newline leaves visible gaps.
        self.out.write_all(b"\x1b[?7l")?;
        self.last_fg = None;
        self.last_bg = None;

        const HALF_BLOCK: char = '\u{2580}';

        for row in 0..visual_rows {
            let top_y = (row * 2) * frame.height / out_h;
            let bot_y = (row * 2 + 1) * frame.height / out_h;
            for col in 0..self.cols {
                let x = col * frame.width / self.cols;
                let top = Self::pixel(&frame, x, top_y.min(frame.height - 1));
                let bot = Self::pixel(&frame, x, bot_y.min(frame.height - 1));

                if self.last_fg != Some(top) {
                    write!(self.out, "\x1b[38;2;{};{};{}m", top.0, top.1, top.2)?;
                    self.last_fg = Some(top);
                }
                if self.last_bg != Some(bot) {
                    write!(self.out, "\x1b[48;2;{};{};{}m", bot.0, bot.1, bot.2)?;
                    self.last_bg = Some(bot);
                }
                write!(self.out, "{HALF_BLOCK}")?;
            }
            self.out.write_all(b"\r\n")?;
        }

        write!(self.out, "\x1b[{};1H\x1b[0m\x1b[2K", visual_rows + 1)?;
        // Truncate to the terminal width on a char boundary; a byte slice
        // would split multi-byte status text.
        let end = self
            .hud
            .char_indices()
            .nth(self.cols)
            .map_or(self.hud.len(), |(i, _)| i);
        write!(self.out, "{}", &self.hud[..end])?;

        self.out.write_all(b"\x1b[?7h")?;
        self.out.flush()?;
        Ok(())
    }
}
