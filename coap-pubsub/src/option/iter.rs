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

use super::*;

/// A convenience iterator for parsing options from a byte buffer.
#[derive(Debug, Clone)]
pub struct OptionIterator<'a> {
    iter: core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
}

impl<'a> Default for OptionIterator<'a> {
    fn default() -> Self {
        OptionIterator::new(&[])
    }
}

impl<'a> OptionIterator<'a> {
    /// Creates a new instance of an `OptionIterator` with the given byte slice.
    pub fn new(buffer: &'a [u8]) -> OptionIterator<'a> {
        OptionIterator {
            iter: buffer.iter(),
            last_option: Default::default(),
        }
    }

    /// Returns the unread remaining buffer as a byte slice.
    ///
    /// Once the iterator has been fully consumed, this is the message
    /// payload (without the `0xFF` marker).
    pub fn as_slice(&self) -> &'a [u8] {
        self.iter.as_slice()
    }

    /// Peek ahead to the next option without moving the iterator forward.
    pub fn peek(&self) -> Option<Result<(OptionNumber, &'a [u8]), Error>> {
        decode_option(&mut self.iter.clone(), self.last_option).transpose()
    }
}

impl<'a> Iterator for OptionIterator<'a> {
    type Item = Result<(OptionNumber, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let ret = decode_option(&mut self.iter, self.last_option).transpose();
        if let Some(Ok((key, _))) = ret {
            self.last_option = key;
        }
        ret
    }
}

impl AsRef<[u8]> for OptionIterator<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Extension trait for option iterators that provides additional convenient accessors.
pub trait OptionIteratorExt<'a>: Iterator<Item = Result<(OptionNumber, &'a [u8]), Error>> {
    /// Moves the iterator forward until it finds a matching key or the
    /// spot where it should have been.
    ///
    /// If found, returns the option number and a byte slice of the value.
    /// Does not consume any options after the matching key.
    fn find_next(&mut self, key: OptionNumber) -> Option<Result<(OptionNumber, &'a [u8]), Error>>;

    /// Typed version of [`OptionIteratorExt::find_next`].
    ///
    /// Moves the iterator forward until it finds a matching key or the
    /// spot where it should have been.
    ///
    /// If found, returns the value of the option key.
    /// Does not consume any options after the matching key.
    fn find_next_of<T>(&mut self, key: OptionKey<T>) -> Option<Result<T, Error>>
    where
        T: TryOptionValueFrom<'a> + Sized,
    {
        match self.find_next(key.0)? {
            Ok((_, value)) => match T::try_option_value_from(value) {
                Some(x) => Some(Ok(x)),
                None => Some(Err(Error::ParseFailure)),
            },
            Err(e) => Some(Err(e)),
        }
    }
}

impl<'a, I> OptionIteratorExt<'a> for I
where
    I: Iterator<Item = Result<(OptionNumber, &'a [u8]), Error>> + Sized + Clone,
{
    fn find_next(&mut self, key: OptionNumber) -> Option<Result<(OptionNumber, &'a [u8]), Error>> {
        loop {
            let mut iter = self.clone();

            match iter.next()? {
                Err(x) => return Some(Err(x)),
                Ok((number, value)) => {
                    if number == key {
                        *self = iter;
                        return Some(Ok((key, value)));
                    }
                    if number < key.0 {
                        *self = iter;
                        continue;
                    }
                }
            };

            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::codec::encode_option;

    fn encode_options(options: &[(OptionNumber, &[u8])]) -> Vec<u8> {
        let mut buffer = vec![0u8; 256];
        let mut len = 0;
        let mut prev = OptionNumber(0);
        for (key, value) in options {
            len += encode_option(&mut buffer[len..], prev, *key, value).unwrap();
            prev = *key;
        }
        buffer.truncate(len);
        buffer
    }

    #[test]
    fn iterates_in_order() {
        let buffer = encode_options(&[
            (OptionNumber::OBSERVE, &[0]),
            (OptionNumber::URI_PATH, b"a"),
            (OptionNumber::URI_PATH, b"b"),
            (OptionNumber::URI_QUERY, b"rt=core.ps.coll"),
        ]);

        let mut iter = OptionIterator::new(&buffer);
        assert_eq!(iter.next(), Some(Ok((OptionNumber::OBSERVE, &[0u8][..]))));
        assert_eq!(iter.next(), Some(Ok((OptionNumber::URI_PATH, &b"a"[..]))));
        assert_eq!(iter.next(), Some(Ok((OptionNumber::URI_PATH, &b"b"[..]))));
        assert_eq!(
            iter.next(),
            Some(Ok((OptionNumber::URI_QUERY, &b"rt=core.ps.coll"[..])))
        );
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn find_next_skips_to_key() {
        let buffer = encode_options(&[
            (OptionNumber::OBSERVE, &[0]),
            (OptionNumber::URI_PATH, b"a"),
            (OptionNumber::URI_QUERY, b"q"),
        ]);

        let mut iter = OptionIterator::new(&buffer);
        assert_eq!(iter.find_next_of(URI_PATH), Some(Ok("a")));
        assert_eq!(iter.find_next_of(URI_PATH), None);
        assert_eq!(iter.find_next_of(URI_QUERY), Some(Ok("q")));
    }

    #[test]
    fn peek_does_not_advance() {
        let buffer = encode_options(&[(OptionNumber::OBSERVE, &[1])]);
        let mut iter = OptionIterator::new(&buffer);
        assert_eq!(iter.peek(), Some(Ok((OptionNumber::OBSERVE, &[1u8][..]))));
        assert_eq!(iter.next(), Some(Ok((OptionNumber::OBSERVE, &[1u8][..]))));
        assert_eq!(iter.next(), None);
    }
}
