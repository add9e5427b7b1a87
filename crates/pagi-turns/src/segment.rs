//! Sentence segmentation of streamed response text for synthesis.
//!
//! Deltas are buffered and released on sentence boundaries (`.`, `!`, `?`, `…`, `;`
//! or a newline, followed by whitespace) once the chunk is at least `min_chars` long,
//! so the synthesizer gets natural phrases instead of single tokens.

/// Buffers text deltas and yields sentence-sized chunks.
#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    buffer: String,
    min_chars: usize,
}

impl SentenceSegmenter {
    pub fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
        }
    }

    /// Append a delta and return any chunks that are now complete.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut chunks = Vec::new();
        while let Some(end) = self.next_boundary() {
            let rest = self.buffer.split_off(end);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
        }
        chunks
    }

    /// Remaining text at the end of a response.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Byte offset just past the first boundary that closes a long-enough chunk.
    fn next_boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            let end = i + c.len_utf8();
            let is_terminal = matches!(c, '.' | '!' | '?' | '…' | ';' | '\n');
            if !is_terminal {
                continue;
            }
            // A terminal must be followed by whitespace, otherwise "3.14" or "e.g." would split.
            let followed_by_space = match chars.peek() {
                Some((_, next)) => next.is_whitespace(),
                None => c == '\n',
            };
            if !followed_by_space {
                continue;
            }
            if self.buffer[..end].trim().chars().count() >= self.min_chars {
                return Some(end);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_sentence_end() {
        let mut s = SentenceSegmenter::new(1);
        let chunks = s.push("Ciao! Sono pronto. Di cosa");
        assert_eq!(chunks, vec!["Ciao!", "Sono pronto."]);
        assert_eq!(s.flush().as_deref(), Some("Di cosa"));
        assert_eq!(s.flush(), None);
    }

    #[test]
    fn waits_for_following_whitespace() {
        let mut s = SentenceSegmenter::new(1);
        assert!(s.push("Costa 3.").is_empty());
        assert!(s.push("5 euro").is_empty());
        assert_eq!(s.push(" al metro. "), vec!["Costa 3.5 euro al metro."]);
    }

    #[test]
    fn short_sentences_are_merged() {
        let mut s = SentenceSegmenter::new(12);
        let chunks = s.push("Sì. Certo. Ecco i risultati. ");
        assert_eq!(chunks, vec!["Sì. Certo. Ecco i risultati."]);
    }

    #[test]
    fn streaming_deltas() {
        let mut s = SentenceSegmenter::new(1);
        let mut out = Vec::new();
        for delta in ["Ho ", "trovato", " due case", ". Vuoi", " vederle?", " "] {
            out.extend(s.push(delta));
        }
        assert_eq!(out, vec!["Ho trovato due case.", "Vuoi vederle?"]);
        assert_eq!(s.flush(), None);
    }
}
