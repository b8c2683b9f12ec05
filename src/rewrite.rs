//! Hostname rewriting for streamed HTML.
//!
//! Bodies arrive in arbitrary chunks, so a hostname can be split across two
//! (or more) of them. Each [`Replacer`] holds back any chunk tail which might
//! be the start of a match, and retries it once the next chunk arrives.

use std::borrow::Cow;

use memchr::memmem::Finder;

/// Replace every occurrence of one byte string with another, across chunk
/// boundaries.
pub struct Replacer {
    finder: Finder<'static>,
    replacement: Vec<u8>,

    /// Tail of the previous chunk which is a proper prefix of our pattern.
    /// Never longer than the pattern minus one byte.
    carry: Vec<u8>,
}

impl Replacer {
    /// Replace `pattern` with `replacement`. `pattern` must not be empty.
    pub fn new(pattern: &str, replacement: &str) -> Replacer {
        debug_assert!(!pattern.is_empty(), "cannot replace an empty pattern");
        Replacer {
            finder: Finder::new(pattern.as_bytes()).into_owned(),
            replacement: replacement.as_bytes().to_owned(),
            carry: Vec::new(),
        }
    }

    /// The bytes we're searching for.
    fn pattern(&self) -> &[u8] {
        self.finder.needle()
    }

    /// Process the next chunk, appending whatever output is final to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        let data: Cow<'_, [u8]> = if self.carry.is_empty() {
            Cow::Borrowed(chunk)
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(chunk);
            Cow::Owned(joined)
        };

        let pattern_len = self.pattern().len();
        let mut last = 0;
        for pos in self.finder.find_iter(&data) {
            out.extend_from_slice(&data[last..pos]);
            out.extend_from_slice(&self.replacement);
            last = pos + pattern_len;
        }

        let tail = &data[last..];
        let keep = partial_match_len(tail, self.pattern());
        let (done, carry) = tail.split_at(tail.len() - keep);
        out.extend_from_slice(done);
        self.carry.clear();
        self.carry.extend_from_slice(carry);
    }

    /// End of stream. Whatever we were holding back can no longer match.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.carry);
    }
}

/// The length of the longest suffix of `tail` which is a proper prefix of
/// `pattern`.
fn partial_match_len(tail: &[u8], pattern: &[u8]) -> usize {
    let max = tail.len().min(pattern.len().saturating_sub(1));
    (1..=max)
        .rev()
        .find(|&len| tail.ends_with(&pattern[..len]))
        .unwrap_or(0)
}

/// A sequence of replacements applied one after another, as if each were a
/// separate pass over the complete text.
pub struct Rewriter {
    passes: Vec<Replacer>,
}

impl Rewriter {
    /// Build a rewriter from passes, applied in order.
    pub fn new(passes: Vec<Replacer>) -> Rewriter {
        Rewriter { passes }
    }

    /// The rewrites for serving `origin` as `public_host`: every mention of
    /// the origin becomes the public host, except that canonical and
    /// alternate links keep pointing at the origin.
    pub fn for_site(public_host: &str, origin: &str) -> Rewriter {
        let mut passes = vec![Replacer::new(origin, public_host)];
        for rel in ["canonical", "alternate"] {
            passes.push(Replacer::new(
                &format!("<link rel=\"{}\" href=\"https://{}", rel, public_host),
                &format!("<link rel=\"{}\" href=\"https://{}", rel, origin),
            ));
        }
        Rewriter::new(passes)
    }

    /// Rewrite the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = chunk.to_vec();
        let mut next = Vec::with_capacity(chunk.len());
        for pass in &mut self.passes {
            next.clear();
            pass.push(&data, &mut next);
            std::mem::swap(&mut data, &mut next);
        }
        data
    }

    /// Flush everything still held back at end of stream.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut pending = Vec::new();
        for pass in &mut self.passes {
            let mut next = Vec::with_capacity(pending.len());
            pass.push(&pending, &mut next);
            pass.finish(&mut next);
            pending = next;
        }
        pending
    }
}

/// Should we rewrite a body with this `Content-Type`?
pub fn is_rewritable(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}
