// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;

use crate::{records::ObjectKind, token::Token, Error, Record};

/// Owner of finished records and the source of tokens
pub trait ObjectRepository {
    /// `count` fresh tokens, unique for the lifetime of the repository
    fn allocate_tokens(&mut self, count: usize) -> Result<Vec<Token>, Error>;

    /// Takes a batch of records of one kind, with one token per record when
    /// `tokens` is given
    ///
    /// A run makes one call per kind. When a call fails, the run stops and
    /// the batches already taken do not form a complete table.
    fn add_records(&mut self, kind: ObjectKind, records: &[Record], tokens: Option<&[Token]>) -> Result<(), Error>;
}

/// One `add_records` call as received by [`InMemoryRepository`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub kind: ObjectKind,
    pub records: Vec<Record>,
    pub tokens: Option<Vec<Token>>,
}

/// Repository that keeps every batch in memory, in arrival order
#[derive(Debug, Clone)]
pub struct InMemoryRepository {
    next_token: u64,
    entries: Vec<RepositoryEntry>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::with_first_token(1)
    }

    /// Repository whose first token is `first`; zero is bumped to one so the
    /// null token is never handed out
    pub fn with_first_token(first: u64) -> Self {
        Self { next_token: first.max(1), entries: Vec::new() }
    }

    pub fn entries(&self) -> &[RepositoryEntry] {
        &self.entries
    }

    /// Every record of `kind` across all batches, in arrival order
    pub fn records(&self, kind: ObjectKind) -> impl Iterator<Item = &Record> {
        self.entries.iter().filter(move |e| e.kind == kind).flat_map(|e| e.records.iter())
    }

    /// The record a token was registered with
    pub fn lookup(&self, token: Token) -> Option<&Record> {
        self.entries.iter().find_map(|entry| {
            let tokens = entry.tokens.as_ref()?;
            let index = tokens.iter().position(|&t| t == token)?;
            entry.records.get(index)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRepository for InMemoryRepository {
    fn allocate_tokens(&mut self, count: usize) -> Result<Vec<Token>, Error> {
        let exhausted = Error::ResourceExhausted { what: "tokens" };
        let first = self.next_token;
        let end = u64::try_from(count).ok().and_then(|count| first.checked_add(count)).ok_or(exhausted.clone())?;

        let mut tokens = Vec::new();
        tokens.try_reserve_exact(count).map_err(|_| exhausted)?;
        tokens.extend((first..end).map(Token::new));
        self.next_token = end;

        Ok(tokens)
    }

    fn add_records(&mut self, kind: ObjectKind, records: &[Record], tokens: Option<&[Token]>) -> Result<(), Error> {
        if records.iter().any(|record| record.kind() != kind) {
            return Err(Error::Repository { kind, reason: "record of a different kind in batch" });
        }

        if tokens.is_some_and(|tokens| tokens.len() != records.len()) {
            return Err(Error::Repository { kind, reason: "token count does not match record count" });
        }

        self.entries.push(RepositoryEntry { kind, records: records.to_vec(), tokens: tokens.map(<[Token]>::to_vec) });

        Ok(())
    }
}
