//! Parsing of profiling endpoint responses.
//!
//! A response is two header lines followed by `<signature> <count>` lines.

use crate::types::{SampleCount, StackSignature};

/// Lines at the top of every response that carry no samples.
pub const HEADER_LINES: usize = 2;

/// The well-formed data lines of one response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedPayload {
    /// `(signature, count)` per well-formed data line, in response order.
    pub stacks: Vec<(StackSignature, SampleCount)>,

    /// Total line count, headers and malformed lines included.
    pub num_lines: usize,
}

impl ParsedPayload {
    /// Line count minus the header, as reported to operators.
    pub fn num_stacks(&self) -> usize {
        self.num_lines.saturating_sub(HEADER_LINES)
    }
}

/// Parse a response body.
///
/// Data lines that do not split into exactly two whitespace-separated tokens
/// are skipped. Both tokens are kept as raw bytes.
pub fn parse_payload(body: &[u8]) -> ParsedPayload {
    let mut parsed = ParsedPayload::default();

    for (i, line) in lines(body).enumerate() {
        parsed.num_lines += 1;
        if i < HEADER_LINES {
            continue;
        }

        let mut tokens = line.split(|&b| is_space(b)).filter(|token| !token.is_empty());
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(signature), Some(count), None) => parsed
                .stacks
                .push((StackSignature::from(signature.to_vec()), SampleCount::from(count))),
            _ => continue,
        }
    }

    parsed
}

/// ASCII whitespace, vertical tab included.
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0b' | b'\x0c')
}

/// Split on `\n`, `\r\n` or a bare `\r`. A final line break does not start
/// another line; an empty body has no lines.
fn lines(body: &[u8]) -> Lines<'_> {
    Lines { rest: body }
}

struct Lines<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }

        let rest = self.rest;
        match rest.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(i) => {
                let skip = if rest[i..].starts_with(b"\r\n") { 2 } else { 1 };
                self.rest = &rest[i + skip..];
                Some(&rest[..i])
            }
            None => {
                self.rest = &[];
                Some(rest)
            }
        }
    }
}
