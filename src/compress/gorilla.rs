//! # Version 1 Codec
//!
//! Bit-packed in-place codec: delta-of-delta timestamps and XOR-prefix
//! values, after the scheme popularized by Facebook's Gorilla paper. Bits
//! land directly in the mapped page window, so persisting a page only needs
//! to record the cursor — the data is already where it belongs.
//!
//! ## Timestamp Encoding
//!
//! The first timestamp is stored as a 32-bit delta from the codec's base
//! (the owning file's range start). Subsequent timestamps store the
//! delta-of-delta in one of five prefix classes:
//!
//! ```text
//! 0                          dod == 0
//! 10   + 7 bits              dod in [-63, 64]
//! 110  + 9 bits              dod in [-255, 256]
//! 1110 + 12 bits             dod in [-2047, 2048]
//! 1111 + 32 bits             everything else
//! ```
//!
//! ## Value Encoding
//!
//! The first value is 64 raw bits. Subsequent values XOR against the
//! previous value: `0` for identical, `10` + meaningful bits when the XOR
//! fits the previous leading/trailing window, `11` + 5 bits of leading
//! zeros + 6 bits of length + meaningful bits when a new window is needed.
//! Leading-zero counts are clamped to 31 before the window is computed so
//! the 5-bit field and the derived trailing count stay consistent on decode.
//!
//! ## Cursor State
//!
//! All state is relative to the window start: a byte cursor plus the bit
//! position within that byte. `(cursor, start)` is exactly what the page
//! header persists, and replaying the window up to that position rebuilds
//! every piece of encoder state (previous delta, previous value bits, the
//! XOR window). Timestamps must be non-decreasing; older timestamps are
//! rejected with `OutOfOrder` and belong on a version-0 page.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::compress::CompressorPosition;
use crate::error::StorageError;
use crate::types::{DataPoint, Timestamp};

/// Sentinel: no XOR window established yet. The first non-zero XOR always
/// writes an explicit window instead of reusing a zero-width one.
const UNSET_WINDOW: u32 = u32::MAX;

#[derive(Debug, Default)]
pub struct GorillaCodec {
    base_tstamp: Timestamp,
    buf_len: usize,
    bit_pos: usize,
    dp_count: usize,
    last_tstamp: Timestamp,
    prev_delta: i64,
    prev_value_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
    full: bool,
}

/// One encoded field: value in the low bits, bit width.
type Chunks = SmallVec<[(u64, u8); 6]>;

impl GorillaCodec {
    pub fn init(&mut self, base_tstamp: Timestamp, buf_len: usize) {
        *self = Self {
            base_tstamp,
            buf_len,
            prev_leading: UNSET_WINDOW,
            prev_trailing: UNSET_WINDOW,
            ..Self::default()
        };
    }

    pub fn compress(&mut self, page: &mut [u8], tstamp: Timestamp, value: f64) -> Result<bool> {
        if self.full {
            return Ok(false);
        }
        if tstamp < self.base_tstamp || (self.dp_count > 0 && tstamp < self.last_tstamp) {
            bail!(StorageError::OutOfOrder);
        }

        let mut chunks = Chunks::new();
        let new_delta = self.plan_timestamp(tstamp, &mut chunks)?;
        let new_window = self.plan_value(value, &mut chunks);

        let needed: usize = chunks.iter().map(|&(_, n)| n as usize).sum();
        if self.bit_pos + needed > self.buf_len * 8 {
            self.full = true;
            return Ok(false);
        }

        for &(bits, nbits) in &chunks {
            write_bits(page, &mut self.bit_pos, bits, nbits);
        }

        if let Some((leading, trailing)) = new_window {
            self.prev_leading = leading;
            self.prev_trailing = trailing;
        }
        self.prev_delta = new_delta;
        self.prev_value_bits = value.to_bits();
        self.last_tstamp = tstamp;
        self.dp_count += 1;
        Ok(true)
    }

    fn plan_timestamp(&self, tstamp: Timestamp, chunks: &mut Chunks) -> Result<i64> {
        if self.dp_count == 0 {
            let delta = tstamp - self.base_tstamp;
            ensure!(
                delta <= u32::MAX as u64,
                "timestamp {} too far from page base {}",
                tstamp,
                self.base_tstamp
            );
            chunks.push((delta, 32));
            return Ok(0);
        }

        let delta = (tstamp - self.last_tstamp) as i64;
        let dod = delta - self.prev_delta;
        match dod {
            0 => chunks.push((0b0, 1)),
            -63..=64 => {
                chunks.push((0b10, 2));
                chunks.push(((dod + 63) as u64, 7));
            }
            -255..=256 => {
                chunks.push((0b110, 3));
                chunks.push(((dod + 255) as u64, 9));
            }
            -2047..=2048 => {
                chunks.push((0b1110, 4));
                chunks.push(((dod + 2047) as u64, 12));
            }
            _ => {
                chunks.push((0b1111, 4));
                chunks.push((dod as i32 as u32 as u64, 32));
            }
        }
        Ok(delta)
    }

    fn plan_value(&self, value: f64, chunks: &mut Chunks) -> Option<(u32, u32)> {
        let bits = value.to_bits();
        if self.dp_count == 0 {
            chunks.push((bits, 64));
            return None;
        }

        let xor = bits ^ self.prev_value_bits;
        if xor == 0 {
            chunks.push((0b0, 1));
            return None;
        }

        let mut leading = xor.leading_zeros();
        let trailing = xor.trailing_zeros();

        if self.prev_leading != UNSET_WINDOW
            && leading >= self.prev_leading
            && trailing >= self.prev_trailing
        {
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            chunks.push((0b10, 2));
            chunks.push((xor >> self.prev_trailing, meaningful as u8));
            None
        } else {
            // 5-bit field; the window is computed from the clamped count so
            // encode and decode agree on the trailing width.
            if leading > 31 {
                leading = 31;
            }
            let meaningful = 64 - leading - trailing;
            chunks.push((0b11, 2));
            chunks.push((leading as u64, 5));
            chunks.push(((meaningful - 1) as u64, 6));
            chunks.push((xor >> trailing, meaningful as u8));
            Some((leading, trailing))
        }
    }

    pub fn uncompress(&self, page: &[u8], out: &mut Vec<DataPoint>) -> Result<()> {
        let mut decoder = Decoder::new(page, self.base_tstamp, self.bit_pos);
        while let Some(dp) = decoder.next_dp()? {
            out.push(dp);
        }
        Ok(())
    }

    pub fn restore(
        &mut self,
        page: &[u8],
        position: CompressorPosition,
        out: Option<&mut Vec<DataPoint>>,
    ) -> Result<()> {
        let end_bit = position.offset as usize * 8 + position.start as usize;
        ensure!(end_bit <= page.len() * 8, StorageError::Corrupt);

        let mut decoder = Decoder::new(page, self.base_tstamp, end_bit);
        let mut sink = out;
        while let Some(dp) = decoder.next_dp()? {
            if let Some(out) = sink.as_deref_mut() {
                out.push(dp);
            }
        }

        self.bit_pos = end_bit;
        self.dp_count = decoder.dp_count;
        self.last_tstamp = decoder.last_tstamp;
        self.prev_delta = decoder.prev_delta;
        self.prev_value_bits = decoder.prev_value_bits;
        self.prev_leading = decoder.prev_leading;
        self.prev_trailing = decoder.prev_trailing;
        self.full = false;
        Ok(())
    }

    pub fn save_position(&self) -> CompressorPosition {
        CompressorPosition {
            offset: (self.bit_pos / 8) as u16,
            start: (self.bit_pos % 8) as u8,
        }
    }

    pub fn size(&self) -> usize {
        self.bit_pos.div_ceil(8)
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn dp_count(&self) -> usize {
        self.dp_count
    }

    pub fn last_tstamp(&self) -> Option<Timestamp> {
        (self.dp_count > 0).then_some(self.last_tstamp)
    }
}

fn write_bits(page: &mut [u8], bit_pos: &mut usize, value: u64, nbits: u8) {
    for i in (0..nbits).rev() {
        let byte = *bit_pos / 8;
        let shift = 7 - (*bit_pos % 8);
        if (value >> i) & 1 == 1 {
            page[byte] |= 1 << shift;
        } else {
            // compaction can hand us a window with stale bytes
            page[byte] &= !(1 << shift);
        }
        *bit_pos += 1;
    }
}

/// Replays an encoded window, tracking the same state the encoder held.
struct Decoder<'a> {
    page: &'a [u8],
    bit_pos: usize,
    end_bit: usize,
    base_tstamp: Timestamp,
    dp_count: usize,
    last_tstamp: Timestamp,
    prev_delta: i64,
    prev_value_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> Decoder<'a> {
    fn new(page: &'a [u8], base_tstamp: Timestamp, end_bit: usize) -> Self {
        Self {
            page,
            bit_pos: 0,
            end_bit,
            base_tstamp,
            dp_count: 0,
            last_tstamp: 0,
            prev_delta: 0,
            prev_value_bits: 0,
            prev_leading: UNSET_WINDOW,
            prev_trailing: UNSET_WINDOW,
        }
    }

    fn read_bits(&mut self, nbits: u8) -> Result<u64> {
        ensure!(
            self.bit_pos + nbits as usize <= self.end_bit,
            StorageError::Corrupt
        );
        let mut value = 0u64;
        for _ in 0..nbits {
            let byte = self.bit_pos / 8;
            let shift = 7 - (self.bit_pos % 8);
            value = (value << 1) | ((self.page[byte] >> shift) & 1) as u64;
            self.bit_pos += 1;
        }
        Ok(value)
    }

    fn next_dp(&mut self) -> Result<Option<DataPoint>> {
        if self.bit_pos >= self.end_bit {
            return Ok(None);
        }

        let tstamp = self.decode_timestamp()?;
        let value = self.decode_value()?;
        self.dp_count += 1;
        self.last_tstamp = tstamp;
        Ok(Some(DataPoint::new(tstamp, value)))
    }

    fn decode_timestamp(&mut self) -> Result<Timestamp> {
        if self.dp_count == 0 {
            let delta = self.read_bits(32)?;
            return Ok(self.base_tstamp + delta);
        }

        let dod = if self.read_bits(1)? == 0 {
            0
        } else if self.read_bits(1)? == 0 {
            self.read_bits(7)? as i64 - 63
        } else if self.read_bits(1)? == 0 {
            self.read_bits(9)? as i64 - 255
        } else if self.read_bits(1)? == 0 {
            self.read_bits(12)? as i64 - 2047
        } else {
            self.read_bits(32)? as u32 as i32 as i64
        };

        let delta = self.prev_delta + dod;
        ensure!(delta >= 0, StorageError::Corrupt);
        self.prev_delta = delta;
        Ok(self.last_tstamp + delta as u64)
    }

    fn decode_value(&mut self) -> Result<f64> {
        if self.dp_count == 0 {
            let bits = self.read_bits(64)?;
            self.prev_value_bits = bits;
            return Ok(f64::from_bits(bits));
        }

        let xor = if self.read_bits(1)? == 0 {
            0
        } else if self.read_bits(1)? == 0 {
            ensure!(self.prev_leading != UNSET_WINDOW, StorageError::Corrupt);
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            self.read_bits(meaningful as u8)? << self.prev_trailing
        } else {
            let leading = self.read_bits(5)? as u32;
            let meaningful = self.read_bits(6)? as u32 + 1;
            ensure!(leading + meaningful <= 64, StorageError::Corrupt);
            let trailing = 64 - leading - meaningful;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            self.read_bits(meaningful as u8)? << trailing
        };

        let bits = self.prev_value_bits ^ xor;
        self.prev_value_bits = bits;
        Ok(f64::from_bits(bits))
    }
}
