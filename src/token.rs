// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use crate::Error;

/// Stable identity of an output record
///
/// Assigned once at allocation; other records refer to a record only through
/// its token. [`Token::NULL`] means "no reference".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(u64);

impl Token {
    pub const NULL: Self = Token(0);

    pub const fn new(raw: u64) -> Self {
        Token(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }
}

/// Hands out the human-facing identifiers records are numbered with
///
/// One allocator lives for one run, so separate runs never share state.
#[derive(Debug, Clone)]
pub struct IdentifierAllocator {
    next: Option<u32>,
}

impl IdentifierAllocator {
    pub fn new(first: u32) -> Self {
        Self { next: Some(first) }
    }

    /// Next unused identifier
    ///
    /// After `u32::MAX` has been handed out every call fails instead of
    /// wrapping back to a value already in use.
    pub fn next(&mut self) -> Result<u32, Error> {
        let id = self.next.ok_or(Error::ResourceExhausted { what: "record identifiers" })?;
        self.next = id.checked_add(1);

        Ok(id)
    }
}

impl Default for IdentifierAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}
