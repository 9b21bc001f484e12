//! ANSI Escape Sequence Decoder
//!
//! Uses vte to scan terminal output and turn SGR sequences into styled runs.
//! Cursor addressing, alternate screens and every other CSI/OSC/ESC sequence
//! are consumed so they never leak into visible text, but they carry no
//! styling meaning here: rendering is line oriented.

use std::ops::Range;
use vte::{Params, Parser, Perform};

/// An RGB color resolved from any SGR color form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// xterm default 16-color table (normal 0-7, bright 8-15)
pub const ANSI_PALETTE: [Color; 16] = [
    Color::rgb(0, 0, 0),
    Color::rgb(205, 0, 0),
    Color::rgb(0, 205, 0),
    Color::rgb(205, 205, 0),
    Color::rgb(0, 0, 238),
    Color::rgb(205, 0, 205),
    Color::rgb(0, 205, 205),
    Color::rgb(229, 229, 229),
    Color::rgb(127, 127, 127),
    Color::rgb(255, 0, 0),
    Color::rgb(0, 255, 0),
    Color::rgb(255, 255, 0),
    Color::rgb(92, 92, 255),
    Color::rgb(255, 0, 255),
    Color::rgb(0, 255, 255),
    Color::rgb(255, 255, 255),
];

/// Channel levels of the 6x6x6 color cube (palette 16-231)
const CUBE_LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Resolve a 256-color palette index
    ///
    /// 0-15 map to [`ANSI_PALETTE`], 16-231 form the color cube and
    /// 232-255 are the 24-step grayscale ramp.
    pub fn from_palette(index: u8) -> Self {
        match index {
            0..=15 => ANSI_PALETTE[index as usize],
            16..=231 => {
                let i = index - 16;
                Self::rgb(
                    CUBE_LEVELS[(i / 36) as usize],
                    CUBE_LEVELS[((i / 6) % 6) as usize],
                    CUBE_LEVELS[(i % 6) as usize],
                )
            }
            232..=255 => {
                let level = 8 + (index - 232) * 10;
                Self::rgb(level, level, level)
            }
        }
    }

    /// Format as `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Running SGR state for one output stream
///
/// The state persists across decode calls: a color set on one line stays in
/// effect on the next until it is changed or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StyleState {
    pub foreground: Option<Color>,
    pub background: Option<Color>,
    pub bold: bool,
    pub dim: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
    pub strikethrough: bool,
}

impl StyleState {
    /// Reset every attribute (SGR 0)
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True when no attribute or color is set
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Foreground to paint with, honoring `inverse`
    pub fn effective_foreground(&self) -> Option<Color> {
        if self.inverse {
            self.background
        } else {
            self.foreground
        }
    }

    /// Background to paint with, honoring `inverse`
    pub fn effective_background(&self) -> Option<Color> {
        if self.inverse {
            self.foreground
        } else {
            self.background
        }
    }

    /// Apply the parameter list of one SGR sequence, in order
    pub fn apply_sgr(&mut self, params: &[u16]) {
        if params.is_empty() {
            self.reset();
            return;
        }

        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => self.reset(),
                1 => self.bold = true,
                2 => self.dim = true,
                3 => self.italic = true,
                4 => self.underline = true,
                7 => self.inverse = true,
                9 => self.strikethrough = true,
                22 => {
                    self.bold = false;
                    self.dim = false;
                }
                23 => self.italic = false,
                24 => self.underline = false,
                27 => self.inverse = false,
                29 => self.strikethrough = false,
                code @ 30..=37 => self.foreground = Some(ANSI_PALETTE[(code - 30) as usize]),
                code @ 90..=97 => self.foreground = Some(ANSI_PALETTE[(code - 90 + 8) as usize]),
                code @ 40..=47 => self.background = Some(ANSI_PALETTE[(code - 40) as usize]),
                code @ 100..=107 => {
                    self.background = Some(ANSI_PALETTE[(code - 100 + 8) as usize])
                }
                38 => {
                    let (color, consumed) = extended_color(&params[i + 1..]);
                    if let Some(color) = color {
                        self.foreground = Some(color);
                    }
                    i += consumed;
                }
                48 => {
                    let (color, consumed) = extended_color(&params[i + 1..]);
                    if let Some(color) = color {
                        self.background = Some(color);
                    }
                    i += consumed;
                }
                39 => self.foreground = None,
                49 => self.background = None,
                _ => {}
            }
            i += 1;
        }
    }
}

/// Parse the tail of a `38`/`48` sequence.
///
/// Returns the color (if well formed) and how many parameters were consumed.
fn extended_color(rest: &[u16]) -> (Option<Color>, usize) {
    match rest.first().copied() {
        Some(5) => match rest.get(1).copied() {
            Some(index) => (Some(Color::from_palette(index.min(255) as u8)), 2),
            None => (None, rest.len()),
        },
        Some(2) if rest.len() >= 4 => {
            let channel = |v: u16| v.min(255) as u8;
            (
                Some(Color::rgb(channel(rest[1]), channel(rest[2]), channel(rest[3]))),
                4,
            )
        }
        Some(2) => (None, rest.len()),
        _ => (None, 0),
    }
}

/// A stretch of plain text rendered with one style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledRun {
    /// Byte range into [`DecodedText::text`]
    pub range: Range<usize>,
    pub style: StyleState,
}

/// Result of decoding one piece of terminal output
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedText {
    pub text: String,
    pub runs: Vec<StyledRun>,
}

impl DecodedText {
    /// Text covered by a run
    pub fn run_text(&self, run: &StyledRun) -> &str {
        &self.text[run.range.clone()]
    }
}

/// Keeps the C0 controls that still mean something in line-oriented text
fn is_retained_control(byte: u8) -> bool {
    matches!(byte, b'\t' | b'\n' | b'\r')
}

struct Decoder<'a> {
    style: &'a mut StyleState,
    text: String,
    runs: Vec<StyledRun>,
    run_start: usize,
}

impl<'a> Decoder<'a> {
    fn new(style: &'a mut StyleState, capacity: usize) -> Self {
        Self {
            style,
            text: String::with_capacity(capacity),
            runs: Vec::new(),
            run_start: 0,
        }
    }

    fn close_run(&mut self) {
        if self.text.len() > self.run_start {
            self.runs.push(StyledRun {
                range: self.run_start..self.text.len(),
                style: *self.style,
            });
        }
        self.run_start = self.text.len();
    }

    fn finish(mut self) -> DecodedText {
        self.close_run();
        DecodedText {
            text: self.text,
            runs: self.runs,
        }
    }
}

impl Perform for Decoder<'_> {
    fn print(&mut self, c: char) {
        self.text.push(c);
    }

    fn execute(&mut self, byte: u8) {
        if is_retained_control(byte) {
            self.text.push(byte as char);
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        // Private-mode SGR variants (e.g. `CSI > 4 ; 2 m`) are not styling.
        if action != 'm' || ignore || !intermediates.is_empty() {
            return;
        }
        let params: Vec<u16> = params.iter().flatten().copied().collect();
        self.close_run();
        self.style.apply_sgr(&params);
    }
}

/// Decode `input` into plain text plus styled runs, advancing `state`.
///
/// Never fails: malformed sequences are swallowed by the vte state machine and
/// a sequence truncated at the end of `input` is left unconsumed.
pub fn decode(input: &str, state: &mut StyleState) -> DecodedText {
    let mut parser = Parser::new();
    let mut decoder = Decoder::new(state, input.len());
    for byte in input.bytes() {
        parser.advance(&mut decoder, byte);
    }
    decoder.finish()
}

struct Stripper {
    text: String,
}

impl Perform for Stripper {
    fn print(&mut self, c: char) {
        self.text.push(c);
    }

    fn execute(&mut self, byte: u8) {
        if is_retained_control(byte) {
            self.text.push(byte as char);
        }
    }
}

/// Remove every escape sequence from `input`, keeping only visible text
pub fn strip_ansi(input: &str) -> String {
    // Fast path: nothing to strip
    if !input.bytes().any(|b| b == 0x1b || (b < 0x20 && !is_retained_control(b)) || b == 0x7f)
    {
        return input.to_string();
    }

    let mut parser = Parser::new();
    let mut stripper = Stripper {
        text: String::with_capacity(input.len()),
    };
    for byte in input.bytes() {
        parser.advance(&mut stripper, byte);
    }
    stripper.text
}
