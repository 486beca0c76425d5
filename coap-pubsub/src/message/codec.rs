// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Low-level message codec functions.
//!
//! Options are encoded as delta TLVs: a leading byte carries the option
//! number delta in the high nibble and the value length in the low nibble.
//! Nibble values 13 and 14 signal one- and two-byte extensions; nibble 15
//! is reserved (it would alias the 0xFF payload marker) and is rejected.

use super::option::*;
use super::*;

/// Calculates the encoded size of a CoAP option.
pub fn calc_option_size(prev_key: OptionNumber, key: OptionNumber, mut value_len: usize) -> usize {
    if value_len >= 269 {
        value_len += 2;
    } else if value_len >= 13 {
        value_len += 1;
    }

    let option_delta = key - prev_key;

    if option_delta >= 269 {
        value_len += 3;
    } else if option_delta >= 13 {
        value_len += 2;
    } else {
        value_len += 1;
    }

    value_len
}

/// Decodes one option from a `core::slice::Iter`, which can be obtained from a byte slice.
/// The iterator is then advanced to the next option.
///
/// Will return `Ok(None)` if it either encounters the end-of-options marker (`0xFF`) or if
/// the given iterator has been fully consumed.
pub fn decode_option<'a>(
    iter: &mut core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
) -> Result<Option<(OptionNumber, &'a [u8])>, Error> {
    macro_rules! try_next {
        ($iter:expr, $none:expr) => {
            match ($iter).next() {
                Some(x) => *x,
                None => return $none,
            }
        };
    }

    let header: u8 = try_next!(iter, Ok(None));

    if header == 0xFF {
        // End of options marker.
        return Ok(None);
    }

    let key_delta: u16 = match header >> 4 {
        13 => 13u16 + try_next!(iter, Err(Error::ParseFailure)) as u16,
        14 => {
            let msb = try_next!(iter, Err(Error::ParseFailure)) as u16;
            let lsb = try_next!(iter, Err(Error::ParseFailure)) as u16;
            269u16
                .checked_add((msb << 8) | lsb)
                .ok_or(Error::ParseFailure)?
        }
        15 => return Err(Error::ParseFailure),
        key => key as u16,
    };

    let len = match header & 0xF {
        13 => 13usize + try_next!(iter, Err(Error::ParseFailure)) as usize,
        14 => {
            let msb = try_next!(iter, Err(Error::ParseFailure)) as usize;
            let lsb = try_next!(iter, Err(Error::ParseFailure)) as usize;
            269usize + ((msb << 8) | lsb)
        }
        15 => return Err(Error::ParseFailure),
        len => len as usize,
    };

    if last_option.0 > u16::MAX - key_delta {
        // Don't let the key wrap.
        return Err(Error::ParseFailure);
    }

    let key = last_option + key_delta;

    if len == 0 {
        return Ok(Some((key, &[])));
    }

    if len > iter.as_slice().len() {
        return Err(Error::ParseFailure);
    }

    let value: &'a [u8] = &iter.as_slice()[..len];

    iter.nth(len - 1);

    Ok(Some((key, value)))
}

/// Encodes all parts of an option into the given buffer *except* the value bytes. All
/// other parts, including the value length, are encoded. This is used when re-encoding
/// an option header in place; [`encode_option`] (which also writes the value) is
/// usually a better fit.
pub fn encode_option_without_value(
    buffer: &mut [u8],
    prev_key: OptionNumber,
    key: OptionNumber,
    value_len: usize,
) -> Result<usize, Error> {
    if prev_key > key {
        return Err(Error::InvalidArgument);
    }

    let calc_len = calc_option_size(prev_key, key, value_len);
    if calc_len > buffer.len() {
        log::warn!("calc_len:{}, blen:{}", calc_len, buffer.len());
        return Err(Error::OutOfSpace);
    }

    if value_len > MAX_OPTION_VALUE_SIZE {
        log::warn!("value_len:{}, max:{}", value_len, MAX_OPTION_VALUE_SIZE);
        return Err(Error::InvalidArgument);
    }

    let mut value_offset = 1usize;
    let option_delta = (key - prev_key) as usize;

    if option_delta >= 269 {
        let ext = option_delta - 269;
        buffer[0] = 14 << 4;
        buffer[1] = (ext >> 8) as u8;
        buffer[2] = ext as u8;
        value_offset += 2;
    } else if option_delta >= 13 {
        buffer[0] = 13 << 4;
        buffer[1] = (option_delta - 13) as u8;
        value_offset += 1;
    } else {
        buffer[0] = (option_delta << 4) as u8;
    }

    if value_len >= 269 {
        let ext = value_len - 269;
        buffer[0] |= 14;
        buffer[value_offset] = (ext >> 8) as u8;
        buffer[value_offset + 1] = ext as u8;
        value_offset += 2;
    } else if value_len >= 13 {
        buffer[0] |= 13;
        buffer[value_offset] = (value_len - 13) as u8;
        value_offset += 1;
    } else {
        buffer[0] |= (value_len & 15) as u8;
    }

    Ok(value_offset + value_len)
}

/// Encodes an option into the given buffer, including the value.
pub fn encode_option(
    buffer: &mut [u8],
    prev_key: OptionNumber,
    key: OptionNumber,
    value: &[u8],
) -> Result<usize, Error> {
    let option_len = encode_option_without_value(buffer, prev_key, key, value.len())?;

    // The value bytes are always at the end.
    buffer[option_len - value.len()..option_len].copy_from_slice(value);

    Ok(option_len)
}

/// Helper function for implementing option insertion.
/// Return value is a tuple of several fields:
///
/// * `split_index` (`usize`) The index where the new option should be inserted.
/// * `prev_option_key` (`OptionNumber`) The option number of the option immediately before the split.
/// * `next_key` (`OptionNumber`) The option number of the option immediately after the split.
/// * `next_value_len` (`usize`) The length of the value of the option immediately after the split.
/// * `next_option_size` (`usize`) The length of the entire option immediately after the split.
fn insert_split_helper(
    buffer: &[u8],
    key: OptionNumber,
) -> (usize, OptionNumber, OptionNumber, usize, usize) {
    let mut prev_option_key = OptionNumber(0);
    let mut split_index;

    let mut iter = OptionIterator::new(buffer);

    loop {
        split_index = buffer.len() - iter.as_slice().len();

        let (next_key, next_value) = iter
            .next()
            .unwrap_or_else(|| {
                panic!(
                    "Unexpected end of options (prev: {}, iter: {:?})",
                    prev_option_key, iter
                )
            })
            .expect("Wrote corrupt options");

        if next_key > key {
            let next_option_size = buffer.len() - iter.as_slice().len() - split_index;
            return (
                split_index,
                prev_option_key,
                next_key,
                next_value.len(),
                next_option_size,
            );
        }

        prev_option_key = next_key;
    }
}

/// Inserts an option into an option list. Very slow unless called sequentially
/// in ascending option-number order.
pub fn insert_option(
    buffer: &mut [u8],
    mut len: usize,
    last_option: OptionNumber,
    key: OptionNumber,
    value: &[u8],
) -> Result<(usize, OptionNumber), Error> {
    if value.len() > MAX_OPTION_VALUE_SIZE {
        return Err(Error::InvalidArgument);
    }

    if key >= last_option {
        // This is the easy case: A simple append is adequate.
        len += encode_option(&mut buffer[len..], last_option, key, value)?;
        return Ok((len, key));
    }

    // What follows only happens if this method is called with an option key
    // out-of-order, which costs a memmove of everything after the split.

    let (split_index, prev_option_key, next_option_key, next_option_value_len, next_option_size) =
        insert_split_helper(&buffer[..len], key);

    // Track the possible change in size due to the change of the
    // key delta encoding of the option after the split.
    let key_delta_size_adj =
        next_option_size - calc_option_size(key, next_option_key, next_option_value_len);

    let new_option_size = calc_option_size(prev_option_key, key, value.len());

    let adj_size = new_option_size - key_delta_size_adj;

    // Do a space check before we start moving buffers around.
    if len + adj_size > buffer.len() {
        log::warn!("len:{} + adj_size:{} > blen:{}", len, adj_size, buffer.len());
        return Err(Error::OutOfSpace);
    }

    let src = split_index..len;
    let dest = split_index + adj_size;

    buffer.copy_within(src, dest);
    len += adj_size;

    // Encode our new option. This should not fail; if it does then something
    // has gone terribly wrong and we should panic.
    encode_option(
        &mut buffer[split_index..split_index + new_option_size],
        prev_option_key,
        key,
        value,
    )
    .expect("Internal inconsistency inserting option");

    if key != prev_option_key {
        // Partially re-encode the next option, since the previous option
        // key value has changed. The value part hasn't changed and remains
        // at the end of the option, so it isn't needed here.
        encode_option_without_value(
            &mut buffer[split_index + new_option_size..],
            key,
            next_option_key,
            next_option_value_len,
        )
        .expect("Internal inconsistency inserting option");
    }

    Ok((len, last_option))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_option_round_trip() {
        let mut buffer = [0u8; 16];
        let len = encode_option(&mut buffer, OptionNumber(0), OptionNumber::OBSERVE, &[1]).unwrap();
        assert_eq!(len, 2);
        assert_eq!(&buffer[..len], &[0x61, 0x01]);

        let mut iter = buffer[..len].iter();
        let (key, value) = decode_option(&mut iter, OptionNumber(0)).unwrap().unwrap();
        assert_eq!(key, OptionNumber::OBSERVE);
        assert_eq!(value, &[1]);
    }

    #[test]
    fn extended_delta_and_length() {
        // Option 60 (Size1) with a 20-byte value: delta needs a one-byte
        // extension and so does the length.
        let mut buffer = [0u8; 32];
        let value = [0xAB; 20];
        let len = encode_option(&mut buffer, OptionNumber(0), OptionNumber::SIZE1, &value).unwrap();
        assert_eq!(buffer[0], 0xDD);
        assert_eq!(buffer[1], 60 - 13);
        assert_eq!(buffer[2], 20 - 13);

        let mut iter = buffer[..len].iter();
        let (key, decoded) = decode_option(&mut iter, OptionNumber(0)).unwrap().unwrap();
        assert_eq!(key, OptionNumber::SIZE1);
        assert_eq!(decoded, &value[..]);
    }

    #[test]
    fn two_byte_length_extension() {
        let mut buffer = [0u8; 600];
        let value = [0x55u8; 300];
        let len =
            encode_option(&mut buffer, OptionNumber(0), OptionNumber::URI_PATH, &value).unwrap();

        let mut iter = buffer[..len].iter();
        let (key, decoded) = decode_option(&mut iter, OptionNumber(0)).unwrap().unwrap();
        assert_eq!(key, OptionNumber::URI_PATH);
        assert_eq!(decoded, &value[..]);
    }

    #[test]
    fn truncated_value_is_parse_failure() {
        // Header promises 4 bytes of value but only 2 follow.
        let bytes = [0x64u8, 1, 2];
        let mut iter = bytes.iter();
        assert_eq!(
            decode_option(&mut iter, OptionNumber(0)),
            Err(Error::ParseFailure)
        );
    }

    #[test]
    fn reserved_nibble_is_parse_failure() {
        let bytes = [0xF4u8, 1, 2, 3, 4];
        let mut iter = bytes.iter();
        assert_eq!(
            decode_option(&mut iter, OptionNumber(0)),
            Err(Error::ParseFailure)
        );
    }
}
