//! Flag/argument tokenizer for raw invocation text.
//!
//! Splits input into a positional group plus named flag groups given a schema
//! of `{flag char, long word}` pairs. Every group keeps the source byte
//! ranges of its tokens, so both the parsed value (space-joined) and the
//! exact original substring can be reconstructed after slicing or merging.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// A recognized flag: a single short character and a long word form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDefinition {
    pub flag: char,
    pub word: String,
    pub description: String,
}

impl FlagDefinition {
    pub fn new(flag: char, word: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            flag,
            word: word.into(),
            description: description.into(),
        }
    }
}

/// One token of the source text: its byte range and unescaped value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringRange {
    pub start: usize,
    pub end: usize,
    pub value: String,
}

/// A single addressed or merged token view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagValue {
    /// The unescaped, space-joined parsed value.
    pub value: String,
    /// The exact original source substring(s) spanning the tokens.
    pub raw: String,
}

/// The tokenized invocation: the positional group plus one group per flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagResult {
    source: String,
    positional: Vec<Vec<StringRange>>,
    flags: HashMap<char, Vec<Vec<StringRange>>>,
}

impl FlagResult {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The `_` group: tokens not assigned to any flag.
    pub fn positional(&self) -> FlagValueSet<'_> {
        FlagValueSet {
            source: &self.source,
            groups: self.positional.clone(),
        }
    }

    pub fn get(&self, flag: char) -> Option<FlagValueSet<'_>> {
        self.flags.get(&flag).map(|groups| FlagValueSet {
            source: &self.source,
            groups: groups.clone(),
        })
    }

    pub fn is_set(&self, flag: char) -> bool {
        self.flags.contains_key(&flag)
    }
}

/// An ordered, index-addressable, sliceable and mergeable set of token
/// ranges belonging to one flag group.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagValueSet<'a> {
    source: &'a str,
    groups: Vec<Vec<StringRange>>,
}

impl<'a> FlagValueSet<'a> {
    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses the `index`th token across all groups.
    pub fn get(&self, index: usize) -> Option<FlagValue> {
        let range = self.groups.iter().flatten().nth(index)?;
        Some(FlagValue {
            value: range.value.clone(),
            raw: self.source[range.start..range.end].to_string(),
        })
    }

    /// Merges every group into one value; groups are joined by a space.
    pub fn merge(&self) -> FlagValue {
        self.merge_groups(&self.groups)
    }

    /// Merges the tokens in `[start, end)` (flat indexing) into one value.
    pub fn merge_range(&self, start: usize, end: Option<usize>) -> FlagValue {
        self.merge_groups(&jagged_slice(&self.groups, start, end))
    }

    /// A new set over the tokens in `[start, end)`, flat indexing.
    pub fn slice(&self, start: usize, end: Option<usize>) -> FlagValueSet<'a> {
        FlagValueSet {
            source: self.source,
            groups: jagged_slice(&self.groups, start, end),
        }
    }

    fn merge_groups(&self, groups: &[Vec<StringRange>]) -> FlagValue {
        let mut values = Vec::new();
        let mut raws = Vec::new();
        for group in groups {
            if group.is_empty() {
                continue;
            }
            let start = group.iter().map(|r| r.start).min().unwrap_or(0);
            let end = group.iter().map(|r| r.end).max().unwrap_or(0);
            values.push(
                group
                    .iter()
                    .map(|r| r.value.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            raws.push(self.source[start..end].to_string());
        }
        FlagValue {
            value: values.join(" "),
            raw: raws.join(" "),
        }
    }
}

fn jagged_slice(groups: &[Vec<StringRange>], start: usize, end: Option<usize>) -> Vec<Vec<StringRange>> {
    let end = end.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    let mut offset = 0usize;
    for group in groups {
        if offset + group.len() >= start && offset < end {
            let from = start.saturating_sub(offset).min(group.len());
            let to = end.saturating_sub(offset).min(group.len());
            if from < to {
                out.push(group[from..to].to_vec());
            }
        }
        offset += group.len();
        if offset >= end {
            break;
        }
    }
    out
}

/// Splits `text` into word tokens, honoring double-quoted phrases and
/// backslash escapes, preserving each token's source byte range.
pub fn smart_split_ranges(text: &str) -> Vec<StringRange> {
    let mut tokens = Vec::new();
    let mut value = String::new();
    let mut start: Option<usize> = None;
    let mut in_quotes = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if escaped {
            value.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                start.get_or_insert(index);
                escaped = true;
            }
            '"' if start.is_none() => {
                start = Some(index);
                in_quotes = true;
            }
            '"' if in_quotes => in_quotes = false,
            c if c.is_whitespace() && !in_quotes => {
                if let Some(begin) = start.take() {
                    tokens.push(StringRange {
                        start: begin,
                        end: index,
                        value: std::mem::take(&mut value),
                    });
                }
            }
            c => {
                start.get_or_insert(index);
                value.push(c);
            }
        }
    }
    if let Some(begin) = start {
        tokens.push(StringRange {
            start: begin,
            end: text.len(),
            value,
        });
    }
    tokens
}

/// Splits `text` into unescaped word values, dropping ranges.
pub fn smart_split(text: &str) -> Vec<String> {
    smart_split_ranges(text)
        .into_iter()
        .map(|range| range.value)
        .collect()
}

/// Tokenizes `text` against `definitions`.
///
/// A `--word` token opens the matching long flag's group; a `-abc` token is a
/// cluster of short flags (in strict mode only recognized characters switch
/// groups, and a cluster with no recognized flag is ordinary text); a bare
/// `--` closes the current flag group and returns to positional collection.
pub fn parse(definitions: &[FlagDefinition], text: &str, strict: bool) -> FlagResult {
    let word_map: HashMap<&str, char> = definitions
        .iter()
        .map(|d| (d.word.as_str(), d.flag))
        .collect();
    let flag_keys: HashSet<char> = definitions.iter().map(|d| d.flag).collect();

    let mut current_flag: Option<char> = None;
    let mut current_group: Vec<StringRange> = Vec::new();
    let mut positional: Vec<Vec<StringRange>> = Vec::new();
    let mut flags: HashMap<char, Vec<Vec<StringRange>>> = HashMap::new();

    let mut close_group = |flag: Option<char>, group: &mut Vec<StringRange>| {
        if group.is_empty() {
            return;
        }
        let group = std::mem::take(group);
        match flag {
            None => positional.push(group),
            Some(c) => flags.entry(c).or_default().push(group),
        }
    };

    for token in smart_split_ranges(text) {
        let raw = &text[token.start..token.end];
        if !raw.starts_with('-') {
            current_group.push(token);
        } else if token.value == "--" {
            if current_flag.is_some() {
                close_group(current_flag, &mut current_group);
                current_flag = None;
            } else {
                current_group.push(token);
            }
        } else if let Some(word) = token.value.strip_prefix("--") {
            match word_map.get(word) {
                None => current_group.push(token),
                Some(&flag) if current_flag != Some(flag) => {
                    close_group(current_flag, &mut current_group);
                    current_flag = Some(flag);
                }
                Some(_) => {}
            }
        } else if token.value.starts_with('-') {
            let mut flag_matched = !strict;
            for ch in token.value.chars() {
                if flag_keys.contains(&ch) {
                    flag_matched = true;
                }
                if ch.is_ascii_alphabetic()
                    && current_flag != Some(ch)
                    && (!strict || flag_keys.contains(&ch))
                {
                    flag_matched = true;
                    close_group(current_flag, &mut current_group);
                    current_flag = Some(ch);
                }
            }
            if !flag_matched {
                current_group.push(token);
            }
        } else {
            current_group.push(token);
        }
    }
    close_group(current_flag, &mut current_group);

    FlagResult {
        source: text.to_string(),
        positional,
        flags,
    }
}
