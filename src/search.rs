//! Key search over a database or over the lines of a file.
//!
//! Modes:
//!
//! * `contain`: keys containing the pattern.
//! * `begin`: keys starting with the pattern.
//! * `end`: keys ending with the pattern.
//! * `regex`: keys matching a regular expression.
//! * `edit`: keys closest to the pattern by Levenshtein distance over UTF-8 characters.
//! * `editbin`: the same over raw bytes.
//!
//! The edit modes return keys ordered by distance, then by key. A capacity of 0 means no
//! limit.

use std::collections::BinaryHeap;
use std::str::FromStr;

use regex::bytes::Regex;

use crate::dbm::Dbm;
use crate::engines::RecordAction;
use crate::file::File;
use crate::util::edit_distance;
use crate::{Result, Status};

/// How keys are matched against a search pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Substring match.
    Contain,
    /// Prefix match.
    Begin,
    /// Suffix match.
    End,
    /// Regular expression match.
    Regex,
    /// Nearest keys by character edit distance.
    Edit,
    /// Nearest keys by byte edit distance.
    EditBinary,
}

impl FromStr for SearchMode {
    type Err = Status;

    fn from_str(mode: &str) -> Result<SearchMode> {
        match mode {
            "contain" => Ok(SearchMode::Contain),
            "begin" => Ok(SearchMode::Begin),
            "end" => Ok(SearchMode::End),
            "regex" => Ok(SearchMode::Regex),
            "edit" => Ok(SearchMode::Edit),
            "editbin" => Ok(SearchMode::EditBinary),
            _ => Err(Status::invalid_argument(format!("unknown search mode: {}", mode))),
        }
    }
}

fn chars(data: &[u8]) -> Vec<char> {
    String::from_utf8_lossy(data).chars().collect()
}

struct Search<'p> {
    mode: SearchMode,
    pattern: &'p [u8],
    pattern_chars: Vec<char>,
    regex: Option<Regex>,
    capacity: usize,
}

impl<'p> Search<'p> {
    fn new(mode: SearchMode, pattern: &'p [u8], capacity: usize) -> Result<Search<'p>> {
        let regex = match mode {
            SearchMode::Regex => {
                let text = std::str::from_utf8(pattern)
                    .map_err(|_| Status::invalid_argument("regex pattern is not UTF-8"))?;
                Some(Regex::new(text)?)
            }
            _ => None,
        };
        let pattern_chars = match mode {
            SearchMode::Edit => chars(pattern),
            _ => Vec::new(),
        };
        Ok(Search {
            mode,
            pattern,
            pattern_chars,
            regex,
            capacity: if capacity == 0 { usize::MAX } else { capacity },
        })
    }

    fn matches(&self, key: &[u8]) -> bool {
        match self.mode {
            SearchMode::Contain => {
                self.pattern.is_empty()
                    || key
                        .windows(self.pattern.len())
                        .any(|window| window == self.pattern)
            }
            SearchMode::Begin => key.starts_with(self.pattern),
            SearchMode::End => key.ends_with(self.pattern),
            SearchMode::Regex => self.regex.as_ref().is_some_and(|regex| regex.is_match(key)),
            SearchMode::Edit | SearchMode::EditBinary => true,
        }
    }

    fn distance(&self, key: &[u8]) -> usize {
        match self.mode {
            SearchMode::Edit => edit_distance(&chars(key), &self.pattern_chars),
            _ => edit_distance(key, self.pattern),
        }
    }

    /// Feeds the keys produced by `source` through the matcher.
    fn run(
        &self,
        source: impl FnOnce(&mut dyn FnMut(&[u8])) -> Result<()>,
    ) -> Result<Vec<Vec<u8>>> {
        if matches!(self.mode, SearchMode::Edit | SearchMode::EditBinary) {
            // Max-heap on (distance, key) holding the best `capacity` keys seen so far.
            let mut best: BinaryHeap<(usize, Vec<u8>)> = BinaryHeap::new();
            source(&mut |key| {
                let candidate = (self.distance(key), key.to_vec());
                if best.len() < self.capacity {
                    best.push(candidate);
                } else if best.peek().is_some_and(|worst| candidate < *worst) {
                    best.pop();
                    best.push(candidate);
                }
            })?;
            return Ok(best
                .into_sorted_vec()
                .into_iter()
                .map(|(_, key)| key)
                .collect());
        }
        let mut found = Vec::new();
        source(&mut |key| {
            if found.len() < self.capacity && self.matches(key) {
                found.push(key.to_vec());
            }
        })?;
        Ok(found)
    }
}

pub(crate) fn search_dbm(
    dbm: &Dbm,
    mode: SearchMode,
    pattern: &[u8],
    capacity: usize,
) -> Result<Vec<Vec<u8>>> {
    let search = Search::new(mode, pattern, capacity)?;
    search.run(|visit| {
        dbm.process_each(
            |key, _| {
                visit(key);
                RecordAction::Noop
            },
            false,
        )
    })
}

impl File {
    /// Lines of the file matching `pattern` under a search mode. See [`crate::search`].
    pub fn search(&self, mode: &str, pattern: &[u8], capacity: usize) -> Result<Vec<Vec<u8>>> {
        let search = Search::new(mode.parse()?, pattern, capacity)?;
        let lines = self.read_lines()?;
        search.run(|visit| {
            lines.iter().for_each(|line| visit(line));
            Ok(())
        })
    }
}
