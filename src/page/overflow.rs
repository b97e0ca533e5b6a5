//! Overflow streak page body: carries streak bytes
//! that did not fit in the 40-byte tail of a commit's modified pages.

use crate::encode::{decode_u32, encode_u32};
use crate::error::{Error, Result};

const SIZE_OFFSET: usize = 0;
const DATA_OFFSET: usize = 4;

pub struct OverflowStreakView<'a> {
    body: &'a [u8],
}

impl<'a> OverflowStreakView<'a> {
    pub fn new(body: &'a [u8]) -> OverflowStreakView<'a> {
        OverflowStreakView { body }
    }

    pub fn size(&self) -> usize {
        decode_u32(self.body, SIZE_OFFSET) as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.body[DATA_OFFSET..DATA_OFFSET + self.size()]
    }
}

pub fn write_overflow_streak(body: &mut [u8], data: &[u8]) -> Result<()> {
    if DATA_OFFSET + data.len() > body.len() {
        return Err(Error::Invariant("overflow streak page too small".into()));
    }
    for b in body.iter_mut() {
        *b = 0;
    }
    encode_u32(body, SIZE_OFFSET, data.len() as u32);
    body[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BODY_SIZE;

    #[test]
    fn round_trips_data() {
        let mut body = vec![0u8; BODY_SIZE];
        write_overflow_streak(&mut body, b"hello").unwrap();
        let view = OverflowStreakView::new(&body);
        assert_eq!(view.size(), 5);
        assert_eq!(view.data(), b"hello");
    }
}
