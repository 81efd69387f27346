//! Deflate (RFC 1951) decoder whose state can be captured between blocks.
//!
//! Input is pushed with [`Inflater::feed`]; output is pulled with
//! [`Inflater::inflate`]. Each header and each symbol is decoded as a unit:
//! if the input runs dry halfway, the read position is rolled back and
//! [`Status::NeedInput`] is returned, so nothing is ever half-consumed.
//!
//! Between blocks, the whole decoder state is the compressed bit position
//! plus the last 32 KiB of output. That is what [`FlateCheckpoint`] holds.

use crate::checkpoint::FlateCheckpoint;
use crate::error::{Error, Result};

pub(crate) const WINDOW_SIZE: usize = 32 * 1024;
const WINDOW_MASK: usize = WINDOW_SIZE - 1;

const MAX_BITS: usize = 15;
const MAX_LIT_CODES: usize = 286;
const MAX_DIST_CODES: usize = 30;
const FIXED_LIT_CODES: usize = 288;

const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115,
    131, 163, 195, 227, 258,
];
const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
const CODE_LENGTH_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

/// Why decoding could not go on.
enum Halt {
    /// More input is needed; the current unit was rolled back.
    Starved,
    Corrupt(&'static str),
}

type Step<T> = std::result::Result<T, Halt>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// `out` is full
    OutputFull,
    /// Feed more input, or mark the end of it
    NeedInput,
    /// Stopped at a block boundary because it was asked to
    Boundary,
    /// Final block decoded
    Done,
}

/// Canonical Huffman code in counts-per-length form.
struct Huffman {
    count: [u16; MAX_BITS + 1],
    symbol: Vec<u16>,
}

impl Huffman {
    fn new(lengths: &[u8]) -> Step<Self> {
        let mut count = [0u16; MAX_BITS + 1];
        for &len in lengths {
            count[len as usize] += 1;
        }

        let mut left: i32 = 1;
        for len in 1..=MAX_BITS {
            left <<= 1;
            left -= count[len] as i32;
            if left < 0 {
                return Err(Halt::Corrupt("over-subscribed huffman code"));
            }
        }

        let mut offsets = [0u16; MAX_BITS + 1];
        for len in 1..MAX_BITS {
            offsets[len + 1] = offsets[len] + count[len];
        }
        let coded = lengths.len() - count[0] as usize;
        let mut symbol = vec![0u16; coded];
        for (sym, &len) in lengths.iter().enumerate() {
            if len != 0 {
                symbol[offsets[len as usize] as usize] = sym as u16;
                offsets[len as usize] += 1;
            }
        }

        // an incomplete code is only allowed when it has a single symbol
        if left > 0 && coded > 1 {
            return Err(Halt::Corrupt("incomplete huffman code"));
        }

        Ok(Self { count, symbol })
    }

    fn fixed() -> (Self, Self) {
        let mut lengths = [0u8; FIXED_LIT_CODES];
        lengths[..144].fill(8);
        lengths[144..256].fill(9);
        lengths[256..280].fill(7);
        lengths[280..].fill(8);
        let lit = Self::new(&lengths).unwrap_or_else(|_| unreachable!("fixed literal code"));
        // 30 and 31 complete the code but never appear in valid data
        let dist = Self::new(&[5u8; MAX_DIST_CODES + 2])
            .unwrap_or_else(|_| unreachable!("fixed distance code"));
        (lit, dist)
    }
}

/// LSB-first bit reader over buffered input.
struct Bits {
    input: Vec<u8>,
    /// Next byte of `input` to load
    pos: usize,
    /// Absolute compressed offset of `input[0]`
    base: u64,
    acc: u64,
    count: u32,
    eof: bool,
}

#[derive(Clone, Copy)]
struct Mark {
    pos: usize,
    acc: u64,
    count: u32,
}

impl Bits {
    fn new(base: u64) -> Self {
        Self {
            input: Vec::new(),
            pos: 0,
            base,
            acc: 0,
            count: 0,
            eof: false,
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            acc: self.acc,
            count: self.count,
        }
    }

    fn reset(&mut self, mark: Mark) {
        self.pos = mark.pos;
        self.acc = mark.acc;
        self.count = mark.count;
    }

    /// Absolute position of the next unread bit.
    fn position(&self) -> u64 {
        (self.base + self.pos as u64) * 8 - self.count as u64
    }

    fn feed(&mut self, data: &[u8]) {
        if self.pos > 0 {
            self.input.drain(..self.pos);
            self.base += self.pos as u64;
            self.pos = 0;
        }
        self.input.extend_from_slice(data);
    }

    fn refill(&mut self) {
        while self.count <= 56 && self.pos < self.input.len() {
            self.acc |= (self.input[self.pos] as u64) << self.count;
            self.pos += 1;
            self.count += 8;
        }
    }

    fn starved(&self) -> Halt {
        if self.eof {
            Halt::Corrupt("unexpected end of deflate stream")
        } else {
            Halt::Starved
        }
    }

    fn consume(&mut self, n: u32) {
        self.acc >>= n;
        self.count -= n;
    }

    fn bits(&mut self, n: u32) -> Step<u32> {
        if n == 0 {
            return Ok(0);
        }
        self.refill();
        if self.count < n {
            return Err(self.starved());
        }
        let value = (self.acc & ((1u64 << n) - 1)) as u32;
        self.consume(n);
        Ok(value)
    }

    /// Drop bits up to the next byte boundary.
    fn align(&mut self) {
        let n = self.count % 8;
        self.consume(n);
    }

    fn decode(&mut self, code: &Huffman) -> Step<u16> {
        self.refill();
        let mut acc = self.acc;
        let mut value: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;
        for len in 1..=MAX_BITS {
            if len as u32 > self.count {
                return Err(self.starved());
            }
            value |= (acc & 1) as i32;
            acc >>= 1;
            let count = code.count[len] as i32;
            if value - count < first {
                self.consume(len as u32);
                return Ok(code.symbol[(index + (value - first)) as usize]);
            }
            index += count;
            first += count;
            first <<= 1;
            value <<= 1;
        }
        Err(Halt::Corrupt("invalid huffman code"))
    }

    /// Next byte of a stored block. Only valid once aligned.
    fn byte(&mut self) -> Step<u8> {
        if self.count >= 8 {
            let b = self.acc as u8;
            self.consume(8);
            return Ok(b);
        }
        if self.pos < self.input.len() {
            let b = self.input[self.pos];
            self.pos += 1;
            return Ok(b);
        }
        Err(self.starved())
    }
}

enum State {
    /// At a block boundary
    Header,
    Stored { remaining: usize },
    Codes { lit: Huffman, dist: Huffman },
    Done,
}

pub(crate) struct Inflater {
    bits: Bits,
    state: State,
    last_block: bool,
    window: Vec<u8>,
    wpos: usize,
    produced: u64,
    /// Back-reference not yet fully copied: (length, distance)
    copy: Option<(usize, usize)>,
    /// Leading bits of the first fed byte that belong to the previous block
    skip: u32,
}

impl Inflater {
    pub(crate) fn new() -> Self {
        Self {
            bits: Bits::new(0),
            state: State::Header,
            last_block: false,
            window: vec![0u8; WINDOW_SIZE],
            wpos: 0,
            produced: 0,
            copy: None,
            skip: 0,
        }
    }

    /// Rebuild a decoder from a block-boundary checkpoint. The caller must
    /// then feed input starting at byte `checkpoint.input_bits / 8`.
    pub(crate) fn restore(checkpoint: &FlateCheckpoint) -> Result<Self> {
        let expected = checkpoint.produced.min(WINDOW_SIZE as u64) as usize;
        if checkpoint.window.len() != expected {
            return Err(Error::decode(format!(
                "flate checkpoint has a {} byte window for {} produced bytes",
                checkpoint.window.len(),
                checkpoint.produced
            )));
        }

        let mut inflater = Self::new();
        inflater.window[..expected].copy_from_slice(&checkpoint.window);
        inflater.wpos = expected & WINDOW_MASK;
        inflater.produced = checkpoint.produced;
        inflater.bits = Bits::new(checkpoint.input_bits / 8);
        inflater.skip = (checkpoint.input_bits % 8) as u32;
        Ok(inflater)
    }

    pub(crate) fn produced(&self) -> u64 {
        self.produced
    }

    pub(crate) fn at_block_boundary(&self) -> bool {
        matches!(self.state, State::Header) && !self.last_block
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.bits.feed(data);
        if self.skip > 0 && !data.is_empty() {
            self.bits.refill();
            let skip = self.skip;
            self.bits.consume(skip);
            self.skip = 0;
        }
    }

    /// No more input will be fed.
    pub(crate) fn finish_input(&mut self) {
        self.bits.eof = true;
    }

    pub(crate) fn checkpoint(&self) -> Option<FlateCheckpoint> {
        if !self.at_block_boundary() {
            return None;
        }
        let len = (self.produced as usize).min(WINDOW_SIZE);
        let mut window = Vec::with_capacity(len);
        if len == WINDOW_SIZE {
            window.extend_from_slice(&self.window[self.wpos..]);
            window.extend_from_slice(&self.window[..self.wpos]);
        } else {
            window.extend_from_slice(&self.window[self.wpos - len..self.wpos]);
        }
        Some(FlateCheckpoint {
            produced: self.produced,
            input_bits: self.bits.position() + self.skip as u64,
            window,
        })
    }

    fn emit(&mut self, out: &mut [u8], n: &mut usize, b: u8) {
        out[*n] = b;
        *n += 1;
        self.window[self.wpos] = b;
        self.wpos = (self.wpos + 1) & WINDOW_MASK;
        self.produced += 1;
    }

    /// Decode into `out`. With `yield_at_boundary`, returns
    /// [`Status::Boundary`] every time a block ends so a checkpoint can be
    /// taken.
    pub(crate) fn inflate(&mut self, out: &mut [u8], yield_at_boundary: bool) -> Result<(usize, Status)> {
        let mut n = 0;
        match self.run(out, &mut n, yield_at_boundary) {
            Ok(status) => Ok((n, status)),
            Err(Halt::Starved) => Ok((n, Status::NeedInput)),
            Err(Halt::Corrupt(msg)) => Err(Error::decode(format!(
                "{} (at output offset {})",
                msg, self.produced
            ))),
        }
    }

    fn run(&mut self, out: &mut [u8], n: &mut usize, yield_at_boundary: bool) -> Step<Status> {
        loop {
            match self.state {
                State::Done => return Ok(Status::Done),
                State::Header => {
                    if self.last_block {
                        self.state = State::Done;
                        continue;
                    }
                    let mark = self.bits.mark();
                    match self.block_header() {
                        Ok(state) => self.state = state,
                        Err(halt) => {
                            self.bits.reset(mark);
                            return Err(halt);
                        }
                    }
                }
                State::Stored { .. } => {
                    if self.stored(out, n)? {
                        return Ok(Status::OutputFull);
                    }
                    if yield_at_boundary && !self.last_block {
                        return Ok(Status::Boundary);
                    }
                }
                State::Codes { .. } => {
                    if self.codes(out, n)? {
                        return Ok(Status::OutputFull);
                    }
                    if yield_at_boundary && !self.last_block {
                        return Ok(Status::Boundary);
                    }
                }
            }
        }
    }

    fn block_header(&mut self) -> Step<State> {
        let last = self.bits.bits(1)? == 1;
        let state = match self.bits.bits(2)? {
            0 => {
                self.bits.align();
                let len = self.bits.bits(16)?;
                let nlen = self.bits.bits(16)?;
                if len != !nlen & 0xffff {
                    return Err(Halt::Corrupt("stored block length mismatch"));
                }
                State::Stored {
                    remaining: len as usize,
                }
            }
            1 => {
                let (lit, dist) = Huffman::fixed();
                State::Codes { lit, dist }
            }
            2 => self.dynamic_tables()?,
            _ => return Err(Halt::Corrupt("invalid block type")),
        };
        self.last_block = last;
        Ok(state)
    }

    fn dynamic_tables(&mut self) -> Step<State> {
        let nlen = self.bits.bits(5)? as usize + 257;
        let ndist = self.bits.bits(5)? as usize + 1;
        let ncode = self.bits.bits(4)? as usize + 4;
        if nlen > MAX_LIT_CODES || ndist > MAX_DIST_CODES {
            return Err(Halt::Corrupt("too many length or distance codes"));
        }

        let mut lengths = [0u8; MAX_LIT_CODES + MAX_DIST_CODES];
        for &index in CODE_LENGTH_ORDER.iter().take(ncode) {
            lengths[index] = self.bits.bits(3)? as u8;
        }
        let code_lengths = Huffman::new(&lengths[..19])?;

        let mut lengths = [0u8; MAX_LIT_CODES + MAX_DIST_CODES];
        let total = nlen + ndist;
        let mut index = 0;
        while index < total {
            let symbol = self.bits.decode(&code_lengths)?;
            if symbol < 16 {
                lengths[index] = symbol as u8;
                index += 1;
                continue;
            }
            let (value, repeat) = match symbol {
                16 => {
                    if index == 0 {
                        return Err(Halt::Corrupt("repeat with no previous length"));
                    }
                    (lengths[index - 1], 3 + self.bits.bits(2)? as usize)
                }
                17 => (0, 3 + self.bits.bits(3)? as usize),
                _ => (0, 11 + self.bits.bits(7)? as usize),
            };
            if index + repeat > total {
                return Err(Halt::Corrupt("too many code lengths"));
            }
            lengths[index..index + repeat].fill(value);
            index += repeat;
        }

        if lengths[256] == 0 {
            return Err(Halt::Corrupt("missing end-of-block code"));
        }
        let lit = Huffman::new(&lengths[..nlen])?;
        let dist = Huffman::new(&lengths[nlen..total])?;
        Ok(State::Codes { lit, dist })
    }

    /// Copy stored bytes. Returns `true` if `out` filled up first.
    fn stored(&mut self, out: &mut [u8], n: &mut usize) -> Step<bool> {
        let State::Stored { mut remaining } = self.state else {
            unreachable!("stored() outside a stored block")
        };
        let result = loop {
            if remaining == 0 {
                break Ok(false);
            }
            if *n == out.len() {
                break Ok(true);
            }
            match self.bits.byte() {
                Ok(b) => {
                    self.emit(out, n, b);
                    remaining -= 1;
                }
                Err(halt) => break Err(halt),
            }
        };
        self.state = match result {
            Ok(false) => State::Header,
            _ => State::Stored { remaining },
        };
        result
    }

    /// Decode literals and matches. Returns `true` if `out` filled up first.
    fn codes(&mut self, out: &mut [u8], n: &mut usize) -> Step<bool> {
        let State::Codes { lit, dist } = std::mem::replace(&mut self.state, State::Header) else {
            unreachable!("codes() outside a huffman block")
        };
        let result = self.decode_symbols(&lit, &dist, out, n);
        if !matches!(result, Ok(false)) {
            self.state = State::Codes { lit, dist };
        }
        result
    }

    fn decode_symbols(&mut self, lit: &Huffman, dist: &Huffman, out: &mut [u8], n: &mut usize) -> Step<bool> {
        loop {
            if let Some((len, distance)) = self.copy.take() {
                let room = out.len() - *n;
                let now = len.min(room);
                for _ in 0..now {
                    let b = self.window[(self.wpos + WINDOW_SIZE - distance) & WINDOW_MASK];
                    self.emit(out, n, b);
                }
                if now < len {
                    self.copy = Some((len - now, distance));
                    return Ok(true);
                }
            }
            if *n == out.len() {
                return Ok(true);
            }

            let mark = self.bits.mark();
            match self.symbol(lit, dist) {
                Ok(Some(Symbol::Literal(b))) => self.emit(out, n, b),
                Ok(Some(Symbol::Match(len, distance))) => self.copy = Some((len, distance)),
                Ok(None) => return Ok(false),
                Err(halt) => {
                    self.bits.reset(mark);
                    return Err(halt);
                }
            }
        }
    }

    fn symbol(&mut self, lit: &Huffman, dist: &Huffman) -> Step<Option<Symbol>> {
        let symbol = self.bits.decode(lit)? as usize;
        if symbol < 256 {
            return Ok(Some(Symbol::Literal(symbol as u8)));
        }
        if symbol == 256 {
            return Ok(None);
        }
        let symbol = symbol - 257;
        if symbol >= LENGTH_BASE.len() {
            return Err(Halt::Corrupt("invalid length symbol"));
        }
        let len = LENGTH_BASE[symbol] as usize + self.bits.bits(LENGTH_EXTRA[symbol] as u32)? as usize;

        let symbol = self.bits.decode(dist)? as usize;
        if symbol >= DIST_BASE.len() {
            return Err(Halt::Corrupt("invalid distance symbol"));
        }
        let distance = DIST_BASE[symbol] as usize + self.bits.bits(DIST_EXTRA[symbol] as u32)? as usize;
        if distance as u64 > self.produced.min(WINDOW_SIZE as u64) {
            return Err(Halt::Corrupt("distance too far back"));
        }
        Ok(Some(Symbol::Match(len, distance)))
    }
}

enum Symbol {
    Literal(u8),
    Match(usize, usize),
}
