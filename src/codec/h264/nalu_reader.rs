// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;
use bytes::Buf;
use thiserror::Error;

/// A bit reader over the RBSP of a NAL unit. Emulation prevention bytes (the `0x03` in
/// `0x000003`) are dropped transparently.
pub(crate) struct NaluReader<'a> {
    /// Bytes not yet loaded into `curr_byte`.
    data: &'a [u8],
    /// The byte being read. The first unread bit is at position
    /// `8 - num_remaining_bits_in_curr_byte`.
    curr_byte: u8,
    num_remaining_bits_in_curr_byte: usize,
    /// Last two bytes loaded, for emulation prevention detection.
    prev_two_bytes: u16,
}

#[derive(Debug, Error)]
pub(crate) enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

impl<'a> NaluReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            curr_byte: 0,
            num_remaining_bits_in_curr_byte: 0,
            prev_two_bytes: 0xffff,
        }
    }

    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0u32;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= u32::from(self.curr_byte) << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.move_to_next_byte()?;
        }

        out |= u32::from(self.curr_byte) >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Reads an unsigned Exp-Golomb coded number (H.264 9.1).
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut num_bits = 0;

        while self.read_bits::<u32>(1)? == 0 {
            num_bits += 1;
            if num_bits > 31 {
                return Err(anyhow!("Invalid stream"));
            }
        }

        let value = ((1u32 << num_bits) - 1)
            .checked_add(self.read_bits::<u32>(num_bits)?)
            .ok_or_else(|| anyhow!("Exp-Golomb value does not fit in 32 bits"))?;

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        let ue = self.read_ue::<u32>()?;
        if ue > max {
            return Err(anyhow!("Value out of bounds: expected 0 - {}, got {}", max, ue));
        }

        U::try_from(ue).map_err(|_| anyhow!("Conversion error"))
    }

    /// Reads a signed Exp-Golomb coded number (H.264 9.1.1).
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> anyhow::Result<U> {
        let ue = self.read_ue::<u32>()? as i64;
        let se = if ue % 2 == 0 { -(ue / 2) } else { ue / 2 + 1 };

        i32::try_from(se)
            .ok()
            .and_then(|se| U::try_from(se).ok())
            .ok_or_else(|| anyhow!("Conversion error"))
    }

    fn move_to_next_byte(&mut self) -> Result<(), ReadBitsError> {
        if !self.data.has_remaining() {
            return Err(ReadBitsError::OutOfBits);
        }
        let mut byte = self.data.get_u8();

        if self.prev_two_bytes == 0 && byte == 0x03 {
            if !self.data.has_remaining() {
                return Err(ReadBitsError::OutOfBits);
            }
            byte = self.data.get_u8();
            // Another 3 bytes are needed before the next epb.
            self.prev_two_bytes = 0xffff;
        }

        self.prev_two_bytes = (self.prev_two_bytes << 8) | u16::from(byte);
        self.num_remaining_bits_in_curr_byte = 8;
        self.curr_byte = byte;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::NaluReader;

    // Adapted from chromium's media/video/h264_bit_reader_unittest.cc

    #[test]
    fn read_stream_without_escape_and_trailing_zero_bytes() {
        const RBSP: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);

        assert!(reader.read_bit().unwrap());
        assert!(!reader.read_bit().unwrap());
        reader.skip_bits(6).unwrap();
        assert!(reader.read_bit().is_err());
    }

    #[test]
    fn emulation_prevention_bytes_are_skipped() {
        const RBSP: [u8; 5] = [0x00, 0x00, 0x03, 0x01, 0xff];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0x000001);
        assert_eq!(reader.read_bits::<u8>(8).unwrap(), 0xff);
        assert!(reader.read_bit().is_err());
    }

    #[test]
    fn exp_golomb() {
        // ue: 0 -> "1", 1 -> "010", 2 -> "011", 7 -> "0001000"
        // se: ue 3 -> 2 ("00100"), ue 4 -> -2 ("00101")
        const RBSP: [u8; 3] = [0b1010_0110, 0b0010_0000, 0b1000_0101];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 1);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 2);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 7);
        assert_eq!(reader.read_se::<i32>().unwrap(), 2);
        assert_eq!(reader.read_se::<i32>().unwrap(), -2);
    }

    #[test]
    fn ue_out_of_bounds() {
        // ue 7
        const RBSP: [u8; 1] = [0b0001_0001];
        let mut reader = NaluReader::new(&RBSP);
        assert!(reader.read_ue_max::<u8>(6).is_err());
    }
}
